//! Known server endpoints and the load-balancing pointer over them.
//!
//! The host list is an immutable snapshot that is swapped wholesale on
//! topology changes; the current position is a separate atomic index that is
//! always read modulo the snapshot length. A retry loop holding an older
//! snapshot therefore never observes a list mutated underneath it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use aqueduct_core::{Error, LoadBalancingStrategy};
use parking_lot::RwLock;
use rand::Rng;
use tracing::info;

pub struct HostRegistry {
    hosts: RwLock<Arc<[String]>>,
    index: AtomicUsize,
    strategy: LoadBalancingStrategy,
    random_resolved: AtomicBool,
}

impl HostRegistry {
    pub fn new<I, S>(urls: I, strategy: LoadBalancingStrategy) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = dedup(normalize_all(urls)?);
        Ok(Self {
            hosts: RwLock::new(hosts.into()),
            index: AtomicUsize::new(0),
            strategy,
            random_resolved: AtomicBool::new(false),
        })
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Current snapshot of known hosts.
    pub fn hosts(&self) -> Arc<[String]> {
        self.hosts.read().clone()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap in a new host list and restart from its first entry.
    pub fn replace_hosts<I, S>(&self, urls: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts: Arc<[String]> = dedup(normalize_all(urls)?).into();
        info!("Replacing host list with {} host(s)", hosts.len());
        *self.hosts.write() = hosts;
        self.index.store(0, Ordering::SeqCst);
        self.random_resolved.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Append hosts not yet known, keeping order and the current position.
    ///
    /// Returns the hosts that were actually added.
    pub fn add_hosts<I, S>(&self, urls: I) -> Result<Vec<String>, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let candidates = normalize_all(urls)?;
        let mut guard = self.hosts.write();
        let mut hosts: Vec<String> = guard.to_vec();
        let mut added = Vec::new();
        for url in candidates {
            if !hosts.contains(&url) {
                hosts.push(url.clone());
                added.push(url);
            }
        }
        if !added.is_empty() {
            info!("Added {} host(s): {:?}", added.len(), added);
            *guard = hosts.into();
        }
        Ok(added)
    }

    /// Host the pointer currently names.
    pub fn current(&self) -> Option<String> {
        let hosts = self.hosts();
        if hosts.is_empty() {
            return None;
        }
        self.resolve_random(hosts.len());
        let index = self.index.load(Ordering::SeqCst) % hosts.len();
        Some(hosts[index].clone())
    }

    /// Move the pointer one step forward.
    pub fn advance(&self) {
        let len = self.len();
        if len == 0 {
            return;
        }
        let _ = self
            .index
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| Some((i % len + 1) % len));
    }

    /// Pick the host for a new logical request.
    ///
    /// Round-robin claims the current slot and moves the pointer on; the
    /// other strategies leave the pointer alone.
    pub(crate) fn select(&self) -> Option<String> {
        let hosts = self.hosts();
        let len = hosts.len();
        if len == 0 {
            return None;
        }
        self.resolve_random(len);

        let index = match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let (Ok(previous) | Err(previous)) =
                    self.index
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| Some((i % len + 1) % len));
                previous % len
            }
            _ => self.index.load(Ordering::SeqCst) % len,
        };
        Some(hosts[index].clone())
    }

    /// Move past `failed`, unless another request already did.
    pub(crate) fn advance_from(&self, failed: &str) {
        let hosts = self.hosts();
        let len = hosts.len();
        if len == 0 {
            return;
        }
        let _ = self.index.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| {
            if hosts[i % len] == failed {
                Some((i % len + 1) % len)
            } else {
                None
            }
        });
    }

    /// Host to try after `failed` within one logical request.
    pub(crate) fn failover_target(&self, failed: &str) -> Option<String> {
        self.advance_from(failed);
        match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let hosts = self.hosts();
                match hosts.iter().position(|h| h == failed) {
                    Some(position) => Some(hosts[(position + 1) % hosts.len()].clone()),
                    None => self.current(),
                }
            }
            _ => self.current(),
        }
    }

    fn resolve_random(&self, len: usize) {
        if self.strategy != LoadBalancingStrategy::OneRandom {
            return;
        }
        if !self.random_resolved.swap(true, Ordering::SeqCst) {
            let index = rand::thread_rng().gen_range(0..len);
            self.index.store(index, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegistry")
            .field("hosts", &self.hosts())
            .field("index", &self.index.load(Ordering::SeqCst))
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Normalise a server URL into the form used for identity comparisons.
///
/// Endpoint schemes reported by clusters (`tcp://`, `ssl://`) are mapped to
/// their HTTP equivalents.
pub fn normalize_url(url: &str) -> Result<String, Error> {
    let trimmed = url.trim();
    let (scheme, rest) = trimmed
        .split_once("://")
        .ok_or_else(|| Error::Config(format!("invalid server url: {}", url)))?;

    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "tcp" | "http+tcp" => "http",
        "https" | "ssl" | "tls" | "https+ssl" | "http+ssl" => "https",
        other => {
            return Err(Error::Config(format!("unsupported url scheme `{}` in {}", other, url)));
        }
    };

    let (authority, path) = match rest.find('/') {
        Some(at) => (&rest[..at], &rest[at..]),
        None => (rest, ""),
    };
    if authority.is_empty() {
        return Err(Error::Config(format!("server url has no host: {}", url)));
    }

    let normalized = format!(
        "{}://{}{}",
        scheme,
        authority.to_ascii_lowercase(),
        path.trim_end_matches('/')
    );
    reqwest::Url::parse(&normalized).map_err(|e| Error::Config(format!("invalid server url {}: {}", url, e)))?;
    Ok(normalized)
}

fn normalize_all<I, S>(urls: I) -> Result<Vec<String>, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    urls.into_iter().map(|url| normalize_url(url.as_ref())).collect()
}

fn dedup(urls: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(urls.len());
    for url in urls {
        if !unique.contains(&url) {
            unique.push(url);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(strategy: LoadBalancingStrategy) -> HostRegistry {
        HostRegistry::new(["http://a:8529", "http://b:8529", "http://c:8529"], strategy).unwrap()
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("http://Example.COM:8529/").unwrap(), "http://example.com:8529");
        assert_eq!(normalize_url("tcp://10.0.0.1:8529").unwrap(), "http://10.0.0.1:8529");
        assert_eq!(normalize_url("ssl://db:8530").unwrap(), "https://db:8530");
        assert_eq!(normalize_url(" https://db/prefix/ ").unwrap(), "https://db/prefix");
        assert!(normalize_url("db:8529").is_err());
        assert!(normalize_url("ftp://db").is_err());
    }

    #[test]
    fn test_new_deduplicates() {
        let hosts = HostRegistry::new(
            ["http://a:8529", "http://A:8529/", "tcp://a:8529", "http://b:8529"],
            LoadBalancingStrategy::None,
        )
        .unwrap();
        assert_eq!(hosts.hosts().to_vec(), vec!["http://a:8529".to_string(), "http://b:8529".to_string()]);
    }

    #[test]
    fn test_none_stays_until_advanced() {
        let hosts = registry(LoadBalancingStrategy::None);
        for _ in 0..5 {
            assert_eq!(hosts.select().unwrap(), "http://a:8529");
        }
        hosts.advance();
        assert_eq!(hosts.select().unwrap(), "http://b:8529");
        hosts.advance();
        hosts.advance();
        assert_eq!(hosts.current().unwrap(), "http://a:8529");
    }

    #[test]
    fn test_round_robin_cycles() {
        let hosts = registry(LoadBalancingStrategy::RoundRobin);
        let picked: Vec<String> = (0..6).map(|_| hosts.select().unwrap()).collect();
        assert_eq!(
            picked,
            vec![
                "http://a:8529",
                "http://b:8529",
                "http://c:8529",
                "http://a:8529",
                "http://b:8529",
                "http://c:8529"
            ]
        );
    }

    #[test]
    fn test_one_random_is_sticky() {
        let hosts = registry(LoadBalancingStrategy::OneRandom);
        let first = hosts.select().unwrap();
        for _ in 0..10 {
            assert_eq!(hosts.select().unwrap(), first);
        }
    }

    #[test]
    fn test_one_random_resolves_after_hosts_added() {
        let hosts = HostRegistry::new(["http://a:8529"], LoadBalancingStrategy::OneRandom).unwrap();
        hosts.add_hosts(["http://b:8529", "http://c:8529"]).unwrap();
        // Pick happens on first use, over all three hosts
        let first = hosts.current().unwrap();
        assert!(hosts.hosts().contains(&first));
        assert_eq!(hosts.current().unwrap(), first);
    }

    #[test]
    fn test_replace_resets_index() {
        let hosts = registry(LoadBalancingStrategy::None);
        hosts.advance();
        hosts.replace_hosts(["http://x:1", "http://y:2"]).unwrap();
        assert_eq!(hosts.current().unwrap(), "http://x:1");
        assert_eq!(hosts.len(), 2);
    }

    #[test]
    fn test_add_keeps_order_and_index() {
        let hosts = registry(LoadBalancingStrategy::None);
        hosts.advance();
        let added = hosts.add_hosts(["http://c:8529", "http://d:8529"]).unwrap();

        assert_eq!(added, vec!["http://d:8529".to_string()]);
        assert_eq!(hosts.len(), 4);
        assert_eq!(hosts.current().unwrap(), "http://b:8529");
    }

    #[test]
    fn test_advance_from_only_moves_once() {
        let hosts = registry(LoadBalancingStrategy::None);
        // Two concurrent failures on host a must not skip host b
        hosts.advance_from("http://a:8529");
        hosts.advance_from("http://a:8529");
        assert_eq!(hosts.current().unwrap(), "http://b:8529");
    }

    #[test]
    fn test_round_robin_failover_target() {
        let hosts = registry(LoadBalancingStrategy::RoundRobin);
        let first = hosts.select().unwrap();
        assert_eq!(first, "http://a:8529");
        assert_eq!(hosts.failover_target(&first).unwrap(), "http://b:8529");
        assert_eq!(hosts.failover_target("http://c:8529").unwrap(), "http://a:8529");
    }

    #[test]
    fn test_empty_registry() {
        let hosts = HostRegistry::new(Vec::<String>::new(), LoadBalancingStrategy::RoundRobin).unwrap();
        assert!(hosts.is_empty());
        assert!(hosts.select().is_none());
        hosts.advance();
    }
}
