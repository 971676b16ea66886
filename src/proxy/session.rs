//! Per-request sessions and the live-session gauge

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hands out session ids and counts sessions still alive.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    alive: AtomicI64,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a session. Ids begin at 1 and are never reused.
    pub fn start(
        self: &Arc<Self>,
        method: impl Into<String>,
        target: impl Into<String>,
    ) -> Session {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.alive.fetch_add(1, Ordering::Relaxed);
        Session {
            id,
            method: method.into(),
            target: target.into(),
            started: Instant::now(),
            registry: self.clone(),
        }
    }

    /// Sessions started and not yet dropped.
    pub fn alive(&self) -> i64 {
        self.alive.load(Ordering::Relaxed)
    }
}

/// One inbound request. Counts as alive until dropped, which for a tunnel is
/// when both directions have finished.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub method: String,
    pub target: String,
    started: Instant,
    registry: Arc<SessionRegistry>,
}

impl Session {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn alive(&self) -> i64 {
        self.registry.alive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.registry.alive.fetch_sub(1, Ordering::Relaxed);
    }
}
