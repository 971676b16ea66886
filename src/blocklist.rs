//! Which hosts must leave through the upstream instead of directly

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Decides whether a host is blocked on the direct path.
pub trait BlockedHostOracle: Send + Sync {
    fn is_blocked(&self, host: &str) -> bool;
}

/// Static list of hosts. A host is blocked when it or any of its parent
/// domains is listed (`example.com` covers `api.example.com`).
#[derive(Debug, Clone, Default)]
pub struct BlockedList {
    hosts: Vec<String>,
}

impl BlockedList {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hosts: Vec<String> = hosts
            .into_iter()
            .map(|h| normalize(h.as_ref()))
            .filter(|h| !h.is_empty())
            .collect();
        hosts.sort();
        hosts.dedup();
        Self { hosts }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    fn contains(&self, host: &str) -> bool {
        self.hosts
            .binary_search_by(|probe| probe.as_str().cmp(host))
            .is_ok()
    }
}

impl BlockedHostOracle for BlockedList {
    fn is_blocked(&self, host: &str) -> bool {
        let host = normalize(host);
        let mut candidate = host.as_str();
        loop {
            if self.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return false,
            }
        }
    }
}

/// Remembers every host the oracle reported as blocked. Unblocked verdicts
/// are not cached, so the oracle is asked again next time.
pub struct BlockedHostCache {
    oracle: Arc<dyn BlockedHostOracle>,
    blocked: RwLock<HashSet<String>>,
}

impl BlockedHostCache {
    pub fn new(oracle: Arc<dyn BlockedHostOracle>) -> Self {
        Self {
            oracle,
            blocked: RwLock::new(HashSet::new()),
        }
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        let host = normalize(host);
        if self
            .blocked
            .read()
            .map(|set| set.contains(&host))
            .unwrap_or(false)
        {
            return true;
        }

        if !self.oracle.is_blocked(&host) {
            return false;
        }

        tracing::debug!(host = %host, "Host is blocked, caching verdict");
        if let Ok(mut set) = self.blocked.write() {
            set.insert(host);
        }
        true
    }

    pub fn cached(&self) -> usize {
        self.blocked.read().map(|s| s.len()).unwrap_or(0)
    }
}

fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_report;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOracle {
        inner: BlockedList,
        calls: AtomicUsize,
    }

    impl BlockedHostOracle for CountingOracle {
        fn is_blocked(&self, host: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.is_blocked(host)
        }
    }

    #[test]
    fn test_exact_and_parent_match() {
        let t = test_report!("Listed domain blocks itself and its subdomains");
        let list = BlockedList::new(["example.com", "Twitter.COM."]);
        t.assert_true("exact", list.is_blocked("example.com"));
        t.assert_true("subdomain", list.is_blocked("api.example.com"));
        t.assert_true("deep subdomain", list.is_blocked("a.b.example.com"));
        t.assert_true("normalized entry", list.is_blocked("twitter.com"));
        t.assert_true("case-insensitive host", list.is_blocked("WWW.Example.Com"));
        t.assert_true("suffix only", !list.is_blocked("notexample.com"));
        t.assert_true("parent not blocked", !list.is_blocked("com"));
        t.assert_true("unrelated", !list.is_blocked("rust-lang.org"));
    }

    #[test]
    fn test_empty_list() {
        let t = test_report!("Empty list blocks nothing");
        let list = BlockedList::new(Vec::<String>::new());
        t.assert_true("empty", list.is_empty());
        t.assert_true("not blocked", !list.is_blocked("example.com"));
    }

    #[test]
    fn test_cache_hit_skips_oracle() {
        let t = test_report!("A cached blocked verdict does not consult the oracle");
        let oracle = Arc::new(CountingOracle {
            inner: BlockedList::new(["blocked.example"]),
            calls: AtomicUsize::new(0),
        });
        let cache = BlockedHostCache::new(oracle.clone());

        t.assert_true("first", cache.is_blocked("blocked.example"));
        t.assert_true("second", cache.is_blocked("blocked.example"));
        t.assert_eq("oracle consulted once", &oracle.calls.load(Ordering::SeqCst), &1usize);
        t.assert_eq("cached", &cache.cached(), &1usize);
    }

    #[test]
    fn test_unblocked_not_cached() {
        let t = test_report!("Unblocked verdicts are asked again");
        let oracle = Arc::new(CountingOracle {
            inner: BlockedList::new(["blocked.example"]),
            calls: AtomicUsize::new(0),
        });
        let cache = BlockedHostCache::new(oracle.clone());

        t.assert_true("first", !cache.is_blocked("open.example"));
        t.assert_true("second", !cache.is_blocked("open.example"));
        t.assert_eq("oracle consulted twice", &oracle.calls.load(Ordering::SeqCst), &2usize);
        t.assert_eq("nothing cached", &cache.cached(), &0usize);
    }
}
