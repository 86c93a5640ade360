//! Service directory: which hosts serve which patterns.
//!
//! # Responsibilities
//! - Apply watch events to the per-pattern host sets
//! - Keep the global pattern index equal to "patterns with a live host"
//! - Expire hosts whose lease lapsed without a refresh
//! - Answer routing queries for outbound sends
//!
//! # Design Decisions
//! - Per (pattern, host): absent → live → absent; no other states
//! - Host order is first-seen order; routing picks the first live host
//! - A repeated identical set refreshes the lease and changes nothing else
//! - Malformed keys are logged and ignored
//! - A full listing is authoritative: hosts missing from it are dropped

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::directory::key::parse_key;
use crate::observability::metrics;
use crate::routing::{Pattern, PatternIndex};
use crate::store::{StoreEntry, WatchAction, WatchEvent};

/// Leases longer than the clock can express are capped here.
const MAX_LEASE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Clone)]
struct HostEntry {
    host: String,
    address: String,
    lease_expiry: Instant,
}

/// Live (pattern, host, address) entries learned from the coordination store.
#[derive(Debug)]
pub struct ServiceDirectory {
    root: String,
    default_lease: Duration,
    hosts: HashMap<Pattern, Vec<HostEntry>>,
    index: PatternIndex<()>,
}

impl ServiceDirectory {
    pub fn new(root: impl Into<String>, default_lease: Duration) -> Self {
        Self {
            root: root.into(),
            default_lease,
            hosts: HashMap::new(),
            index: PatternIndex::new(),
        }
    }

    /// Apply one watch event. Returns true when routing state changed.
    pub fn apply(&mut self, event: &WatchEvent) -> bool {
        let Some((pattern, host)) = parse_key(&self.root, &event.key) else {
            tracing::warn!(key = %event.key, "Ignoring malformed directory key");
            return false;
        };

        match event.action {
            WatchAction::Set => match event.value.as_deref() {
                Some(address) if !address.is_empty() => {
                    let lease = event.ttl.unwrap_or(self.default_lease).min(MAX_LEASE);
                    self.upsert(pattern, host, address, Instant::now() + lease)
                }
                _ => {
                    tracing::warn!(key = %event.key, "Ignoring directory entry without an address");
                    false
                }
            },
            WatchAction::Delete | WatchAction::Expire => self.remove(&pattern, &host),
        }
    }

    /// Insert or refresh (pattern, host).
    pub fn upsert(&mut self, pattern: Pattern, host: String, address: &str, lease_expiry: Instant) -> bool {
        let entries = self.hosts.entry(pattern.clone()).or_default();
        if let Some(entry) = entries.iter_mut().find(|e| e.host == host) {
            entry.lease_expiry = lease_expiry;
            if entry.address == address {
                return false;
            }
            tracing::info!(pattern = %pattern, host = %host, address, "Directory host moved");
            entry.address = address.to_string();
            return true;
        }

        tracing::debug!(pattern = %pattern, host = %host, address, "Directory host live");
        entries.push(HostEntry {
            host,
            address: address.to_string(),
            lease_expiry,
        });
        if entries.len() == 1 {
            self.index.add(pattern, ());
            metrics::record_directory_patterns(self.index.len());
        }
        true
    }

    /// Drop (pattern, host). The pattern leaves the index with its last host.
    pub fn remove(&mut self, pattern: &Pattern, host: &str) -> bool {
        let Some(entries) = self.hosts.get_mut(pattern) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.host != host);
        if entries.len() == before {
            return false;
        }

        tracing::debug!(pattern = %pattern, host, "Directory host gone");
        if entries.is_empty() {
            self.hosts.remove(pattern);
            self.index.remove(pattern);
            metrics::record_directory_patterns(self.index.len());
        }
        true
    }

    /// Bring the directory in line with a complete listing of the store.
    /// Returns how many hosts were dropped for being absent from it.
    pub fn reconcile(&mut self, entries: &[StoreEntry]) -> usize {
        let mut listed = HashSet::new();
        for entry in entries {
            let event = WatchEvent::set(entry.key.clone(), entry.value.clone(), entry.ttl);
            self.apply(&event);
            if let Some(id) = parse_key(&self.root, &entry.key) {
                listed.insert(id);
            }
        }

        let mut stale = Vec::new();
        for (pattern, hosts) in &self.hosts {
            for entry in hosts {
                let id = (pattern.clone(), entry.host.clone());
                if !listed.contains(&id) {
                    stale.push(id);
                }
            }
        }

        for (pattern, host) in &stale {
            tracing::info!(pattern = %pattern, host = %host, "Directory host missing from listing");
            self.remove(pattern, host);
        }
        stale.len()
    }

    /// Remove every host whose lease ended at or before `now`.
    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<(Pattern, String)> = self
            .hosts
            .iter()
            .flat_map(|(pattern, entries)| {
                entries
                    .iter()
                    .filter(move |e| e.lease_expiry <= now)
                    .map(move |e| (pattern.clone(), e.host.clone()))
            })
            .collect();

        for (pattern, host) in &expired {
            tracing::info!(pattern = %pattern, host = %host, "Directory lease lapsed");
            self.remove(pattern, host);
        }
        expired.len()
    }

    /// Live hosts for `pattern` as (host, address), first-seen first.
    pub fn hosts_for(&self, pattern: &Pattern) -> Vec<(String, String)> {
        self.hosts
            .get(pattern)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| (e.host.clone(), e.address.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Best live pattern for `message` and the address to send it to.
    pub fn route(&self, message: &Value) -> Option<(Pattern, String)> {
        let (pattern, _) = self.index.lookup(message)?;
        let address = self.hosts.get(pattern)?.first()?.address.clone();
        Some((pattern.clone(), address))
    }

    pub fn contains(&self, pattern: &Pattern) -> bool {
        self.index.contains(pattern)
    }

    /// Number of patterns with at least one live host.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::key::directory_key;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(60);

    fn set(pattern: &str, host: &str, address: &str) -> WatchEvent {
        let key = directory_key("/micro", &Pattern::parse(pattern).unwrap(), host);
        WatchEvent::set(key, address, None)
    }

    fn delete(pattern: &str, host: &str) -> WatchEvent {
        WatchEvent::delete(directory_key("/micro", &Pattern::parse(pattern).unwrap(), host))
    }

    fn expire(pattern: &str, host: &str) -> WatchEvent {
        WatchEvent::expire(directory_key("/micro", &Pattern::parse(pattern).unwrap(), host))
    }

    #[tokio::test]
    async fn test_convergence_and_removal() {
        let mut dir = ServiceDirectory::new("/micro", LEASE);
        let adder = Pattern::parse("role:adder").unwrap();
        let message = json!({"role": "adder", "a": 1});

        assert!(dir.apply(&set("role:adder", "h1", "tcp://10.0.0.1:1")));
        assert!(dir.apply(&set("role:adder", "h2", "tcp://10.0.0.2:1")));
        assert_eq!(
            dir.hosts_for(&adder),
            vec![
                ("h1".to_string(), "tcp://10.0.0.1:1".to_string()),
                ("h2".to_string(), "tcp://10.0.0.2:1".to_string()),
            ]
        );
        assert_eq!(dir.route(&message).unwrap().1, "tcp://10.0.0.1:1");

        assert!(dir.apply(&delete("role:adder", "h1")));
        assert_eq!(dir.route(&message).unwrap().1, "tcp://10.0.0.2:1");
        assert!(dir.contains(&adder));

        assert!(dir.apply(&expire("role:adder", "h2")));
        assert!(dir.hosts_for(&adder).is_empty());
        assert!(!dir.contains(&adder));
        assert!(dir.route(&message).is_none());
        assert!(dir.is_empty());
    }

    #[tokio::test]
    async fn test_identical_set_is_noop() {
        let mut dir = ServiceDirectory::new("/micro", LEASE);
        assert!(dir.apply(&set("role:adder", "h1", "tcp://a:1")));
        assert!(!dir.apply(&set("role:adder", "h1", "tcp://a:1")));
        assert_eq!(dir.hosts_for(&Pattern::parse("role:adder").unwrap()).len(), 1);
        assert_eq!(dir.len(), 1);

        // Same host, new address: updated in place.
        assert!(dir.apply(&set("role:adder", "h1", "tcp://b:1")));
        assert_eq!(
            dir.hosts_for(&Pattern::parse("role:adder").unwrap()),
            vec![("h1".to_string(), "tcp://b:1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_specific_pattern_routes_first() {
        let mut dir = ServiceDirectory::new("/micro", LEASE);
        dir.apply(&set("a:1", "h1", "tcp://general:1"));
        dir.apply(&set("a:1,b:2", "h2", "tcp://specific:1"));

        let (pattern, address) = dir.route(&json!({"a": 1, "b": 2, "c": 3})).unwrap();
        assert_eq!(pattern, Pattern::parse("a:1,b:2").unwrap());
        assert_eq!(address, "tcp://specific:1");

        // Once the specific pattern is gone, only the general one can serve.
        dir.apply(&delete("a:1,b:2", "h2"));
        assert_eq!(dir.route(&json!({"a": 1, "b": 2})).unwrap().1, "tcp://general:1");
        assert!(dir.route(&json!({"b": 2})).is_none());
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_events_ignored() {
        let mut dir = ServiceDirectory::new("/micro", LEASE);
        assert!(!dir.apply(&delete("role:adder", "h1")));
        assert!(!dir.apply(&WatchEvent::set("/micro/only-one-segment", "tcp://a:1", None)));
        assert!(!dir.apply(&WatchEvent::set("/elsewhere/x/y", "tcp://a:1", None)));
        assert!(!dir.apply(&WatchEvent::set(
            directory_key("/micro", &Pattern::parse("role:adder").unwrap(), "h1"),
            "",
            None
        )));
        assert!(dir.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_drops_unlisted_hosts() {
        let mut dir = ServiceDirectory::new("/micro", LEASE);
        dir.apply(&set("role:adder", "h1", "tcp://a:1"));
        dir.apply(&set("role:adder", "h2", "tcp://b:1"));
        dir.apply(&set("role:echo", "h1", "tcp://a:1"));

        let key = |pattern: &str, host: &str| directory_key("/micro", &Pattern::parse(pattern).unwrap(), host);
        let listing = vec![
            StoreEntry::new(key("role:adder", "h2"), "tcp://b:1", Some(Duration::from_secs(30))),
            StoreEntry::new(key("role:multiplier", "h3"), "tcp://c:1", None),
        ];

        assert_eq!(dir.reconcile(&listing), 2);
        assert_eq!(
            dir.hosts_for(&Pattern::parse("role:adder").unwrap()),
            vec![("h2".to_string(), "tcp://b:1".to_string())]
        );
        assert!(dir.route(&json!({"role": "echo"})).is_none());
        assert_eq!(dir.route(&json!({"role": "multiplier"})).unwrap().1, "tcp://c:1");

        assert_eq!(dir.reconcile(&[]), 2);
        assert!(dir.is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_lease_is_accepted() {
        let mut dir = ServiceDirectory::new("/micro", Duration::MAX);
        assert!(dir.apply(&set("role:adder", "h1", "tcp://a:1")));
        assert_eq!(dir.prune_expired(Instant::now()), 0);
        assert!(dir.contains(&Pattern::parse("role:adder").unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_leases_are_pruned() {
        let mut dir = ServiceDirectory::new("/micro", LEASE);
        let key = directory_key("/micro", &Pattern::parse("role:adder").unwrap(), "h1");
        dir.apply(&WatchEvent::set(key.clone(), "tcp://a:1", Some(Duration::from_secs(10))));
        dir.apply(&set("role:echo", "h1", "tcp://a:1"));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(dir.prune_expired(Instant::now()), 0);

        // A refresh extends the lease.
        dir.apply(&WatchEvent::set(key, "tcp://a:1", Some(Duration::from_secs(10))));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(dir.prune_expired(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(dir.prune_expired(Instant::now()), 1);
        assert!(dir.route(&json!({"role": "adder"})).is_none());
        assert!(dir.route(&json!({"role": "echo"})).is_some());
    }
}
