//! Tracked source addresses with expiry-ordered eviction.
//!
//! Every address that produced an sshd failure lives here until its expiry
//! passes. Entries are kept in a hash map for lookup and in a `BTreeSet`
//! ordered by `(expire_at, address)` so the soonest expiry is always the
//! first element.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Cumulative failures that get an address denied.
pub const THRESHOLD: u64 = 5;

/// Penalty units per failure.
pub const FAILURE_PENALTY: i64 = 1;

/// How long a fresh entry stays relevant, per penalty unit.
pub const DECAY_WINDOW_MINUTES: i64 = 5;

/// Extra lifetime granted when an address is committed.
pub const COMMIT_GRACE_SECS: i64 = 60;

const SECS_PER_MINUTE: i64 = 60;

/// One watched source address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedHost {
    pub address: String,
    pub first_seen: DateTime<Utc>,
    pub attempts: u64,
    pub expire_at: DateTime<Utc>,
    /// Set once the update path has committed this address.
    pub committed: bool,
}

impl TrackedHost {
    fn new(address: String, attempts: u64, now: DateTime<Utc>) -> Self {
        let lifetime = penalty_secs(
            attempts,
            FAILURE_PENALTY * DECAY_WINDOW_MINUTES * SECS_PER_MINUTE,
        );

        Self {
            address,
            first_seen: now,
            attempts,
            expire_at: advance(now, lifetime),
            committed: false,
        }
    }

    pub fn over_threshold(&self) -> bool {
        self.attempts >= THRESHOLD
    }

    fn index_key(&self) -> (DateTime<Utc>, String) {
        (self.expire_at, self.address.clone())
    }
}

/// What the caller has to do after [`HostRegistry::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    /// Counted, nothing else to do.
    Updated,
    /// Threshold crossed for the first time: commit the address.
    Commit,
    /// Address unknown; call [`HostRegistry::insert`].
    InsertRequired,
}

/// The set of tracked hosts.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: HashMap<String, TrackedHost>,
    by_expiry: BTreeSet<(DateTime<Utc>, String)>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `repeat_count` more failures for a tracked address.
    ///
    /// Crossing the threshold pushes expiry back by [`COMMIT_GRACE_SECS`] so
    /// the rest of the burst still matches before eviction. Otherwise expiry
    /// moves by one minute per failure; unlike [`insert`](Self::insert),
    /// the decay window is not applied here.
    pub fn update(&mut self, address: &str, repeat_count: u64, now: DateTime<Utc>) -> UpdateAction {
        if address.is_empty() {
            warn!("assertion failed: update called with an empty address");
        }

        let Some(host) = self.hosts.get_mut(address) else {
            if repeat_count != 1 {
                info!(
                    "assertion failed: new host {} starts with {} attempts",
                    address, repeat_count
                );
            }
            return UpdateAction::InsertRequired;
        };

        let old_key = host.index_key();
        host.attempts = host.attempts.saturating_add(repeat_count);

        let action = if host.attempts >= THRESHOLD && !host.committed {
            host.expire_at = advance(host.expire_at, COMMIT_GRACE_SECS);
            host.committed = true;
            UpdateAction::Commit
        } else {
            host.expire_at = advance(
                host.expire_at,
                penalty_secs(repeat_count, FAILURE_PENALTY * SECS_PER_MINUTE),
            );
            UpdateAction::Updated
        };

        debug!(
            "host {} now at {} attempts, expires {} (at {})",
            host.address, host.attempts, host.expire_at, now
        );

        self.by_expiry.remove(&old_key);
        self.by_expiry.insert(host.index_key());
        action
    }

    /// Start tracking `address`.
    ///
    /// `committed` always starts false, even when `repeat_count` is already
    /// over the threshold; the caller commits such hosts itself.
    pub fn insert(&mut self, address: &str, repeat_count: u64, now: DateTime<Utc>) -> &TrackedHost {
        let host = TrackedHost::new(address.to_string(), repeat_count, now);
        let key = host.index_key();

        if let Some(previous) = self.hosts.insert(address.to_string(), host) {
            warn!("assertion failed: {} inserted while already tracked", address);
            self.by_expiry.remove(&previous.index_key());
        }
        self.by_expiry.insert(key);

        debug!("tracking new host {} ({} attempts)", address, repeat_count);
        &self.hosts[address]
    }

    /// Remove every entry with `expire_at <= now`, soonest first.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> Vec<TrackedHost> {
        let mut evicted = Vec::new();

        while let Some((expire_at, _)) = self.by_expiry.first() {
            if *expire_at > now {
                break;
            }

            if let Some((_, address)) = self.by_expiry.pop_first() {
                if let Some(host) = self.hosts.remove(&address) {
                    debug!("evicting {} ({} attempts)", host.address, host.attempts);
                    evicted.push(host);
                }
            }
        }

        evicted
    }

    pub fn soonest_expiry(&self) -> Option<DateTime<Utc>> {
        self.by_expiry.first().map(|(expire_at, _)| *expire_at)
    }

    /// Time left until the soonest expiry, zero if already past.
    pub fn time_to_soonest(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.soonest_expiry()
            .map(|at| (at - now).to_std().unwrap_or(std::time::Duration::ZERO))
    }

    pub fn get(&self, address: &str) -> Option<&TrackedHost> {
        self.hosts.get(address)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedHost> {
        self.hosts.values()
    }

    /// Entries from soonest to latest expiry.
    pub fn iter_by_expiry(&self) -> impl Iterator<Item = &TrackedHost> {
        self.by_expiry
            .iter()
            .filter_map(|(_, address)| self.hosts.get(address))
    }
}

fn penalty_secs(count: u64, unit_secs: i64) -> i64 {
    i64::try_from(count)
        .unwrap_or(i64::MAX)
        .saturating_mul(unit_secs)
}

fn advance(at: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    Duration::try_seconds(secs)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_insert_expiry_uses_decay_window() {
        let mut registry = HostRegistry::new();
        let host = registry.insert("2001:db8::1", 1, t0());

        assert_eq!(host.first_seen, t0());
        assert_eq!(host.attempts, 1);
        assert_eq!(host.expire_at, t0() + Duration::minutes(5));
        assert!(!host.committed);
        assert_eq!(registry.soonest_expiry(), Some(t0() + Duration::minutes(5)));
    }

    #[test]
    fn test_update_unknown_requires_insert() {
        let mut registry = HostRegistry::new();
        assert_eq!(
            registry.update("2001:db8::1", 1, t0()),
            UpdateAction::InsertRequired
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update_adds_one_minute_per_failure() {
        let mut registry = HostRegistry::new();
        registry.insert("2001:db8::1", 1, t0());

        assert_eq!(registry.update("2001:db8::1", 2, t0()), UpdateAction::Updated);

        let host = registry.get("2001:db8::1").unwrap();
        assert_eq!(host.attempts, 3);
        // 5 minutes from insert, plus 2 x 60s; no decay multiplier on update
        assert_eq!(host.expire_at, t0() + Duration::minutes(7));
    }

    #[test]
    fn test_threshold_commits_once_per_window() {
        let mut registry = HostRegistry::new();
        registry.insert("2001:db8::1", 1, t0());

        let actions: Vec<_> = (0..8)
            .map(|_| registry.update("2001:db8::1", 1, t0()))
            .collect();

        let commits = actions.iter().filter(|a| **a == UpdateAction::Commit).count();
        assert_eq!(commits, 1);
        // Attempts 2,3,4 update; 5 commits
        assert_eq!(actions[3], UpdateAction::Commit);

        let host = registry.get("2001:db8::1").unwrap();
        assert!(host.committed);
        assert_eq!(host.attempts, 9);
        // 5m + 3 x 1m + 60s grace + 4 x 1m
        assert_eq!(host.expire_at, t0() + Duration::minutes(13));
    }

    #[test]
    fn test_insert_over_threshold_is_not_marked_committed() {
        // An insert already over threshold is committed by the caller, and
        // the flag stays false, so the next update commits a second time.
        let mut registry = HostRegistry::new();
        let host = registry.insert("2001:db8::1", 6, t0());
        assert!(host.over_threshold());
        assert!(!host.committed);
        assert_eq!(host.expire_at, t0() + Duration::minutes(30));

        assert_eq!(registry.update("2001:db8::1", 1, t0()), UpdateAction::Commit);
        assert_eq!(registry.update("2001:db8::1", 1, t0()), UpdateAction::Updated);
    }

    #[test]
    fn test_evict_expired_stops_at_first_live_entry() {
        let mut registry = HostRegistry::new();
        registry.insert("a::1", 1, t0()); // +5m
        registry.insert("a::2", 2, t0()); // +10m
        registry.insert("a::3", 3, t0()); // +15m

        assert!(registry.evict_expired(t0() + Duration::minutes(4)).is_empty());

        let evicted = registry.evict_expired(t0() + Duration::minutes(10));
        let addresses: Vec<_> = evicted.iter().map(|h| h.address.as_str()).collect();
        assert_eq!(addresses, vec!["a::1", "a::2"]);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.soonest_expiry(), Some(t0() + Duration::minutes(15)));
    }

    #[test]
    fn test_update_reorders_entries() {
        let mut registry = HostRegistry::new();
        registry.insert("a::1", 1, t0()); // +5m
        registry.insert("a::2", 1, t0() + Duration::minutes(1)); // +6m

        registry.update("a::1", 3, t0()); // +8m

        let order: Vec<_> = registry.iter_by_expiry().map(|h| h.address.clone()).collect();
        assert_eq!(order, vec!["a::2", "a::1"]);
        assert_eq!(registry.soonest_expiry(), Some(t0() + Duration::minutes(6)));
    }

    #[test]
    fn test_time_to_soonest() {
        let mut registry = HostRegistry::new();
        assert_eq!(registry.time_to_soonest(t0()), None);

        registry.insert("a::1", 1, t0());
        assert_eq!(
            registry.time_to_soonest(t0() + Duration::minutes(1)),
            Some(std::time::Duration::from_secs(240))
        );
        assert_eq!(
            registry.time_to_soonest(t0() + Duration::minutes(9)),
            Some(std::time::Duration::ZERO)
        );
    }

    #[test]
    fn test_huge_repeat_count_saturates() {
        let mut registry = HostRegistry::new();
        registry.insert("a::1", u64::MAX, t0());
        assert_eq!(registry.update("a::1", u64::MAX, t0()), UpdateAction::Commit);
        assert_eq!(registry.get("a::1").unwrap().attempts, u64::MAX);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Record { host: u8, count: u64 },
        Advance(i64),
        Evict,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u8..8, 1u64..8).prop_map(|(host, count)| Op::Record { host, count }),
            2 => (0i64..1200).prop_map(Op::Advance),
            1 => Just(Op::Evict),
        ]
    }

    proptest! {
        /// Soonest expiry always matches a brute-force scan, and eviction
        /// removes exactly the entries that are due.
        #[test]
        fn prop_soonest_expiry_matches_scan(ops in prop::collection::vec(op(), 1..120)) {
            let mut registry = HostRegistry::new();
            let mut now = t0();

            for op in ops {
                match op {
                    Op::Record { host, count } => {
                        let address = format!("2001:db8::{host}");
                        if registry.update(&address, count, now) == UpdateAction::InsertRequired {
                            registry.insert(&address, count, now);
                        }
                    }
                    Op::Advance(secs) => now += Duration::seconds(secs),
                    Op::Evict => {
                        let before: Vec<TrackedHost> = registry.iter_by_expiry().cloned().collect();
                        let evicted = registry.evict_expired(now);

                        for host in &evicted {
                            prop_assert!(host.expire_at <= now);
                        }
                        for host in registry.iter() {
                            prop_assert!(host.expire_at > now);
                        }
                        prop_assert_eq!(evicted.len() + registry.len(), before.len());
                    }
                }

                let brute = registry.iter().map(|h| h.expire_at).min();
                prop_assert_eq!(registry.soonest_expiry(), brute);

                let ordered: Vec<_> = registry.iter_by_expiry().map(|h| h.expire_at).collect();
                prop_assert!(ordered.windows(2).all(|w| w[0] <= w[1]));
                prop_assert_eq!(ordered.len(), registry.len());

                for host in registry.iter_by_expiry() {
                    prop_assert!(host.expire_at >= host.first_seen);
                }
            }
        }
    }
}
