//! Keeps one shared upstream connection alive across concurrent failures.
//!
//! Dials borrow the current connection for the duration of a stream open.
//! When an open fails, callers line up behind a single flight: the first one
//! decides whether the connection is really gone and redials at most once,
//! then every caller retries its own open exactly once.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};

use super::{BoxedStream, Dialer};
use crate::error::{Error, Result};
use crate::single_flight::SingleFlight;

/// A long-lived multiplexed connection that can open many streams.
#[async_trait]
pub trait SharedConnection: Send + Sync + 'static {
    async fn open_stream(&self, host: &str, port: u16) -> Result<BoxedStream>;

    /// True once the underlying transport is gone and no stream can be opened.
    fn is_closed(&self) -> bool;
}

/// Establishes fresh [`SharedConnection`]s.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: SharedConnection;

    async fn connect(&self) -> Result<Self::Connection>;
}

type Flight<T> = std::result::Result<Arc<T>, Arc<Error>>;

const RECONNECT_KEY: &str = "upstream";

pub struct ReconnectCoordinator<C: Connector> {
    connector: Arc<C>,
    current: Arc<RwLock<Arc<C::Connection>>>,
    flight: SingleFlight<&'static str, Flight<C::Connection>>,
}

impl<C: Connector> ReconnectCoordinator<C> {
    /// Connect once up front; a failure here (including authentication) is returned as is.
    pub async fn connect(connector: C) -> Result<Self> {
        let conn = connector.connect().await?;
        Ok(Self::with_connection(connector, conn))
    }

    pub fn with_connection(connector: C, conn: C::Connection) -> Self {
        Self {
            connector: Arc::new(connector),
            current: Arc::new(RwLock::new(Arc::new(conn))),
            flight: SingleFlight::new(),
        }
    }

    fn current(&self) -> Arc<C::Connection> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace `failed` with a fresh connection unless someone already did,
    /// or unless it is still alive and the failure was about the target.
    async fn recover(&self, failed: Arc<C::Connection>) -> Result<Arc<C::Connection>> {
        let connector = self.connector.clone();
        let current = self.current.clone();

        let (result, leader) = self
            .flight
            .run(RECONNECT_KEY, move || async move {
                let latest = current.read().unwrap_or_else(|e| e.into_inner()).clone();
                if !Arc::ptr_eq(&latest, &failed) || !failed.is_closed() {
                    return Ok(latest);
                }

                tracing::warn!("Upstream connection lost, reconnecting");
                let fresh = Arc::new(connector.connect().await.map_err(Arc::new)?);
                *current.write().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
                tracing::info!("Upstream connection re-established");
                Ok(fresh)
            })
            .await;

        if !leader {
            tracing::debug!("Joined in-flight upstream reconnect");
        }
        result.map_err(|e| Error::upstream(format!("Reconnect failed: {}", e)))
    }
}

#[async_trait]
impl<C: Connector> Dialer for ReconnectCoordinator<C> {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let conn = self.current();
        match conn.open_stream(host, port).await {
            Ok(stream) => Ok(stream),
            Err(first) => {
                tracing::debug!(host = %host, port, error = %first, "Stream open failed, checking upstream");
                let conn = self.recover(conn).await?;
                conn.open_stream(host, port).await
            }
        }
    }
}
