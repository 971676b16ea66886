//! Duplicate call suppression: concurrent callers with the same key share one
//! in-flight future and all observe its result.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;

pub struct SingleFlight<K, T>
where
    T: Clone,
{
    calls: Mutex<HashMap<K, Shared<BoxFuture<'static, T>>>>,
}

impl<K, T> Default for SingleFlight<K, T>
where
    T: Clone,
{
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` unless a call for `key` is already in flight, in which case
    /// wait for that one instead. Returns the shared result and whether this
    /// caller started the call.
    pub async fn run<F, Fut>(&self, key: K, f: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (flight, leader) = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            match calls.get(&key) {
                // A finished flight whose owner has not cleaned up yet is stale
                Some(existing) if existing.peek().is_none() => (existing.clone(), false),
                _ => {
                    let flight = f().boxed().shared();
                    calls.insert(key.clone(), flight.clone());
                    (flight, true)
                }
            }
        };

        let result = flight.clone().await;

        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        if calls
            .get(&key)
            .is_some_and(|current| current.ptr_eq(&flight))
        {
            calls.remove(&key);
        }

        (result, leader)
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}
