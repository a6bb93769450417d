//! Keyed coordination state.
//!
//! The [`KeyedStateRegistry`] is the only shared mutable resource. Every
//! feature keeps its per-key record here, and every access is scoped to a
//! single key: a check-then-set on one key happens under that key's map
//! shard lock and never spans an `.await`, so it is atomic with respect to
//! other tasks.
//!
//! Records are created lazily on first use of a key. Locks, queues and
//! counters are removed when released; throttle and freshness expiries are
//! pruned when next read after expiring. [`KeyedStateRegistry::reset`]
//! clears everything, for test isolation and session boundaries (logout).
//!
//! The registry is an explicit object shared through `Arc`, so each test or
//! session can own its own.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{ActionError, UserFacingError};
use crate::key::ActionKey;
use crate::queue::SequentialQueue;

// =============================================================================
// Records
// =============================================================================

/// Revision bookkeeping for one key of the push-aware coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionEntry {
    /// Count of writes this client originated for the key.
    pub local_revision: u64,
    /// Highest server revision observed, from a response or a push.
    pub server_revision: u64,
    /// Whether the last observed update came from a push.
    pub is_push: bool,
}

/// Last failure recorded against a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub message: String,
    pub user_facing: Option<UserFacingError>,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    fn from_error(error: &ActionError) -> Self {
        Self {
            message: error.to_string(),
            user_facing: error.user_facing().cloned(),
            at: Utc::now(),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
pub struct KeyedStateRegistry {
    running: DashSet<ActionKey>,
    sending: DashSet<ActionKey>,
    throttle: DashMap<ActionKey, Instant>,
    freshness: DashMap<ActionKey, Instant>,
    debounce: DashMap<ActionKey, u64>,
    queues: SequentialQueue,
    in_flight: DashMap<ActionKey, usize>,
    failures: DashMap<ActionKey, FailureRecord>,
    revisions: DashMap<ActionKey, RevisionEntry>,
    user_errors: Mutex<VecDeque<UserFacingError>>,
    session: DashMap<String, serde_json::Value>,
    resets: AtomicUsize,
}

impl KeyedStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Clear every record, the pending user errors and the session store.
    pub fn reset(&self) {
        self.running.clear();
        self.sending.clear();
        self.throttle.clear();
        self.freshness.clear();
        self.debounce.clear();
        self.queues.clear();
        self.in_flight.clear();
        self.failures.clear();
        self.revisions.clear();
        self.session.clear();
        self.lock_user_errors().clear();
        let n = self.resets.fetch_add(1, Ordering::AcqRel) + 1;
        info!(resets = n, "coordination registry reset");
    }

    pub(crate) fn queues(&self) -> &SequentialQueue {
        &self.queues
    }

    // -------------------------------------------------------------------------
    // Non-reentrant membership
    // -------------------------------------------------------------------------

    /// Enter the non-reentrant section for `key`. `None` if already inside.
    pub(crate) fn try_enter(&self, key: &ActionKey) -> Option<Membership<'_>> {
        Membership::acquire(&self.running, key)
    }

    pub fn is_running(&self, key: &ActionKey) -> bool {
        self.running.contains(key)
    }

    // -------------------------------------------------------------------------
    // Send lock (coalescing coordinators)
    // -------------------------------------------------------------------------

    pub(crate) fn try_begin_send(&self, key: &ActionKey) -> Option<Membership<'_>> {
        Membership::acquire(&self.sending, key)
    }

    pub fn is_sending(&self, key: &ActionKey) -> bool {
        self.sending.contains(key)
    }

    // -------------------------------------------------------------------------
    // Throttle
    // -------------------------------------------------------------------------

    /// Take the throttle lock for `key` for `duration` from now.
    ///
    /// Returns `false` when a still-valid lock exists, unless `ignore_lock`,
    /// in which case the lock is refreshed regardless.
    pub(crate) fn try_throttle(&self, key: &ActionKey, duration: Duration, ignore_lock: bool) -> bool {
        let now = Instant::now();
        match self.throttle.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now && !ignore_lock {
                    return false;
                }
                entry.insert(now + duration);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(now + duration);
                true
            }
        }
    }

    pub fn is_throttled(&self, key: &ActionKey) -> bool {
        self.still_valid(&self.throttle, key)
    }

    pub fn remove_throttle_lock(&self, key: &ActionKey) {
        self.throttle.remove(key);
    }

    // -------------------------------------------------------------------------
    // Freshness
    // -------------------------------------------------------------------------

    /// Claim the freshness window for `key`.
    ///
    /// `Err(())` means a still-valid window exists (and `ignore` is off). On
    /// success the previous expiry is returned so it can be restored if the
    /// call fails.
    pub(crate) fn try_freshen(
        &self,
        key: &ActionKey,
        duration: Duration,
        ignore: bool,
    ) -> Result<Option<Instant>, ()> {
        let now = Instant::now();
        match self.freshness.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let previous = *entry.get();
                if previous > now && !ignore {
                    return Err(());
                }
                entry.insert(now + duration);
                Ok((previous > now).then_some(previous))
            }
            Entry::Vacant(entry) => {
                entry.insert(now + duration);
                Ok(None)
            }
        }
    }

    /// Renew the window from the moment of successful completion.
    pub(crate) fn commit_freshness(&self, key: &ActionKey, duration: Duration) {
        self.freshness.insert(key.clone(), Instant::now() + duration);
    }

    /// Put back the expiry that was in place before a failed call.
    pub(crate) fn restore_freshness(&self, key: &ActionKey, previous: Option<Instant>) {
        match previous {
            Some(expiry) => {
                self.freshness.insert(key.clone(), expiry);
            }
            None => {
                self.freshness.remove(key);
            }
        }
    }

    pub fn is_fresh(&self, key: &ActionKey) -> bool {
        self.still_valid(&self.freshness, key)
    }

    pub fn remove_freshness(&self, key: &ActionKey) {
        self.freshness.remove(key);
    }

    fn still_valid(&self, map: &DashMap<ActionKey, Instant>, key: &ActionKey) -> bool {
        let now = Instant::now();
        let valid = map.get(key).map(|expiry| *expiry > now);
        match valid {
            Some(true) => true,
            Some(false) => {
                map.remove_if(key, |_, expiry| *expiry <= now);
                false
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Debounce
    // -------------------------------------------------------------------------

    /// Bump the debounce generation for `key` and return the new value.
    pub(crate) fn bump_debounce(&self, key: &ActionKey) -> u64 {
        let mut generation = self.debounce.entry(key.clone()).or_insert(0);
        *generation += 1;
        *generation
    }

    pub(crate) fn debounce_generation(&self, key: &ActionKey) -> u64 {
        self.debounce.get(key).map(|g| *g).unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // In-flight tracking
    // -------------------------------------------------------------------------

    /// Count one more active execution for `key` and clear its last failure.
    pub(crate) fn begin_execution(&self, key: &ActionKey) -> InflightGuard<'_> {
        self.failures.remove(key);
        *self.in_flight.entry(key.clone()).or_insert(0) += 1;
        InflightGuard {
            registry: self,
            key: key.clone(),
        }
    }

    fn end_execution(&self, key: &ActionKey) {
        let mut hit_zero = false;
        if let Some(mut count) = self.in_flight.get_mut(key) {
            *count = count.saturating_sub(1);
            hit_zero = *count == 0;
        }
        if hit_zero {
            self.in_flight.remove_if(key, |_, count| *count == 0);
        }
    }

    pub fn in_flight(&self, key: &ActionKey) -> usize {
        self.in_flight.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Whether any pipeline execution or coordinator send is active for `key`.
    pub fn is_busy(&self, key: &ActionKey) -> bool {
        self.in_flight(key) > 0 || self.sending.contains(key)
    }

    // -------------------------------------------------------------------------
    // Failures
    // -------------------------------------------------------------------------

    pub(crate) fn record_failure(&self, key: &ActionKey, error: &ActionError) {
        self.failures
            .insert(key.clone(), FailureRecord::from_error(error));
    }

    pub fn last_failure(&self, key: &ActionKey) -> Option<FailureRecord> {
        self.failures.get(key).map(|r| r.clone())
    }

    pub fn has_failed(&self, key: &ActionKey) -> bool {
        self.failures.contains_key(key)
    }

    pub fn clear_failure(&self, key: &ActionKey) {
        self.failures.remove(key);
    }

    // -------------------------------------------------------------------------
    // User-facing errors
    // -------------------------------------------------------------------------

    pub(crate) fn push_user_error(&self, error: UserFacingError) {
        self.lock_user_errors().push_back(error);
    }

    /// Drain the dialog-worthy errors queued for the UI, oldest first.
    pub fn take_user_errors(&self) -> Vec<UserFacingError> {
        self.lock_user_errors().drain(..).collect()
    }

    pub fn pending_user_errors(&self) -> usize {
        self.lock_user_errors().len()
    }

    fn lock_user_errors(&self) -> std::sync::MutexGuard<'_, VecDeque<UserFacingError>> {
        match self.user_errors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("user error queue mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Revisions
    // -------------------------------------------------------------------------

    pub fn revision(&self, key: &ActionKey) -> Option<RevisionEntry> {
        self.revisions.get(key).map(|e| *e)
    }

    /// Mutate the revision entry for `key`, creating it with `seed` first.
    pub(crate) fn update_revision<R>(
        &self,
        key: &ActionKey,
        seed: impl FnOnce() -> RevisionEntry,
        f: impl FnOnce(&mut RevisionEntry) -> R,
    ) -> R {
        let mut entry = self.revisions.entry(key.clone()).or_insert_with(seed);
        f(&mut entry)
    }

    // -------------------------------------------------------------------------
    // Session store
    // -------------------------------------------------------------------------

    /// Store a session-scoped value. Cleared by [`reset`](Self::reset).
    pub fn session_put(&self, name: impl Into<String>, value: serde_json::Value) {
        self.session.insert(name.into(), value);
    }

    pub fn session_get(&self, name: &str) -> Option<serde_json::Value> {
        self.session.get(name).map(|v| v.clone())
    }

    pub fn session_remove(&self, name: &str) -> Option<serde_json::Value> {
        self.session.remove(name).map(|(_, v)| v)
    }
}

impl std::fmt::Debug for KeyedStateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedStateRegistry")
            .field("running", &self.running.len())
            .field("sending", &self.sending.len())
            .field("in_flight", &self.in_flight.len())
            .field("revisions", &self.revisions.len())
            .finish()
    }
}

// =============================================================================
// Guards (RAII)
// =============================================================================

/// Membership in a per-key exclusive set. Leaves the set on drop.
pub(crate) struct Membership<'a> {
    set: &'a DashSet<ActionKey>,
    key: ActionKey,
}

impl<'a> Membership<'a> {
    fn acquire(set: &'a DashSet<ActionKey>, key: &ActionKey) -> Option<Self> {
        set.insert(key.clone()).then(|| Self {
            set,
            key: key.clone(),
        })
    }
}

impl Drop for Membership<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

/// Decrements the in-flight count for a key on drop, even on panic or
/// cancellation.
pub(crate) struct InflightGuard<'a> {
    registry: &'a KeyedStateRegistry,
    key: ActionKey,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.registry.end_execution(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ActionKey {
        ActionKey::name("k")
    }

    #[test]
    fn test_membership_is_exclusive_and_released_on_drop() {
        let registry = KeyedStateRegistry::new();
        let first = registry.try_enter(&key());
        assert!(first.is_some());
        assert!(registry.try_enter(&key()).is_none());
        assert!(registry.is_running(&key()));
        drop(first);
        assert!(!registry.is_running(&key()));
        assert!(registry.try_enter(&key()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_lock_expires() {
        let registry = KeyedStateRegistry::new();
        let d = Duration::from_millis(100);
        assert!(registry.try_throttle(&key(), d, false));
        assert!(!registry.try_throttle(&key(), d, false));
        assert!(registry.try_throttle(&key(), d, true));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!registry.is_throttled(&key()));
        assert!(registry.try_throttle(&key(), d, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_restore_without_previous_removes() {
        let registry = KeyedStateRegistry::new();
        let d = Duration::from_secs(10);
        let previous = registry.try_freshen(&key(), d, false).unwrap();
        assert_eq!(previous, None);
        assert!(registry.is_fresh(&key()));

        registry.restore_freshness(&key(), previous);
        assert!(!registry.is_fresh(&key()));
        assert!(registry.try_freshen(&key(), d, false).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_restore_keeps_previous_window() {
        let registry = KeyedStateRegistry::new();
        let d = Duration::from_secs(10);
        registry.try_freshen(&key(), d, false).unwrap();
        let expiry = Instant::now() + d;

        let previous = registry.try_freshen(&key(), d, true).unwrap();
        assert_eq!(previous, Some(expiry));
        registry.restore_freshness(&key(), previous);
        assert!(registry.is_fresh(&key()));
        assert!(registry.try_freshen(&key(), d, false).is_err());
    }

    #[test]
    fn test_debounce_generation() {
        let registry = KeyedStateRegistry::new();
        assert_eq!(registry.debounce_generation(&key()), 0);
        assert_eq!(registry.bump_debounce(&key()), 1);
        assert_eq!(registry.bump_debounce(&key()), 2);
        assert_eq!(registry.debounce_generation(&key()), 2);
    }

    #[test]
    fn test_inflight_guard_counts_and_clears_failure() {
        let registry = KeyedStateRegistry::new();
        registry.record_failure(&key(), &ActionError::Failed(anyhow::anyhow!("boom")));
        assert!(registry.has_failed(&key()));

        let a = registry.begin_execution(&key());
        assert!(!registry.has_failed(&key()));
        let b = registry.begin_execution(&key());
        assert_eq!(registry.in_flight(&key()), 2);
        assert!(registry.is_busy(&key()));
        drop(a);
        drop(b);
        assert_eq!(registry.in_flight(&key()), 0);
        assert!(!registry.is_busy(&key()));
    }

    #[test]
    fn test_reset_clears_everything() {
        let registry = KeyedStateRegistry::new();
        let _running = registry.try_enter(&key()).map(std::mem::forget);
        registry.push_user_error(UserFacingError::new("x"));
        registry.session_put("token", serde_json::json!("abc"));
        registry.update_revision(&key(), RevisionEntry::default, |e| e.local_revision = 3);

        registry.reset();

        assert!(!registry.is_running(&key()));
        assert_eq!(registry.pending_user_errors(), 0);
        assert!(registry.session_get("token").is_none());
        assert!(registry.revision(&key()).is_none());
    }

    #[test]
    fn test_user_errors_drain_in_order() {
        let registry = KeyedStateRegistry::new();
        registry.push_user_error(UserFacingError::new("first"));
        registry.push_user_error(UserFacingError::new("second"));
        let drained: Vec<String> = registry
            .take_user_errors()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(drained, vec!["first", "second"]);
        assert_eq!(registry.pending_user_errors(), 0);
    }
}
