//! Optimistic sync with server push and multiple writers.
//!
//! Builds on the coalescing model of [`crate::sync`] and adds revision
//! bookkeeping so that values pushed by the server (from this device or
//! another one) and responses to local writes can be ordered. The server
//! stamps every accepted write with a monotonic `server_revision`; the last
//! write wins.
//!
//! # Revisions
//!
//! Per key the registry keeps a [`RevisionEntry`]:
//!
//! - `local_revision` counts local writes. Each [`PushSyncCoordinator::run`]
//!   bumps it before applying its value.
//! - `server_revision` is the highest server revision seen. It never
//!   decreases.
//! - `is_push` is set when the latest change came from a push, and cleared
//!   by the next local write.
//!
//! # Writers
//!
//! ```text
//! run ─► local_revision += 1 ─► apply ─► send in flight? ── yes ─► Coalesced
//!                                              │ no
//!                          ┌──────────────────►▼
//!                          │     send(value, local_revision, device) ─► ack(server_revision)
//!                          │           │
//!                          └── yes ── local_revision advanced and not a push?
//!                                      │ no
//!                                      ▼
//!                     response revision >= known? apply_response : ignore
//! ```
//!
//! # Pushes
//!
//! [`PushSyncCoordinator::receive_push`] drops anything not newer than the
//! known server revision. An echo of this device's own write that is older
//! than the current local revision only advances `server_revision`; applying
//! it would undo a newer local value.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{Features, DEFAULT_FOLLOW_UP_LIMIT};
use crate::error::{ActionError, Failure, ProtocolViolation};
use crate::key::ActionKey;
use crate::outcome::{Outcome, SkipReason};
use crate::pipeline::ActionPipeline;
use crate::registry::{KeyedStateRegistry, RevisionEntry};

// =============================================================================
// Wire types
// =============================================================================

/// Identifies the device that originated a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl DeviceId {
    pub fn random() -> Self {
        DeviceId(Uuid::new_v4().as_u64_pair().0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Outbound write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest<V> {
    pub value: V,
    pub local_revision: u64,
    pub device_id: DeviceId,
}

/// Inbound server push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushUpdate<V> {
    pub value: V,
    pub server_revision: u64,
    /// Local revision of the write that produced this value.
    pub local_revision: u64,
    /// Device that produced this value.
    pub device_id: DeviceId,
}

/// Handle through which [`PushSync::send`] reports the server revision
/// assigned to the write. Sends that return without reporting one fail with
/// [`ProtocolViolation::MissingServerRevision`].
#[derive(Debug, Default)]
pub struct RevisionAck {
    revision: Mutex<Option<u64>>,
}

impl RevisionAck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, server_revision: u64) {
        *self.revision.lock().unwrap_or_else(PoisonError::into_inner) = Some(server_revision);
    }

    pub fn reported(&self) -> Option<u64> {
        *self.revision.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What [`PushSyncCoordinator::receive_push`] did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDisposition {
    /// Not newer than the known server revision; ignored.
    Stale,
    /// Own-device echo of an older write; only the revision advanced.
    SelfEcho,
    Applied,
}

// =============================================================================
// Traits
// =============================================================================

/// Persisted server revisions, so a restarted client still rejects stale
/// pushes.
pub trait RevisionStore: Send + Sync {
    fn load(&self, key: &ActionKey) -> Option<u64>;
    fn save(&self, key: &ActionKey, server_revision: u64);
}

/// The local state a push can land on.
pub trait PushTarget: Send + Sync {
    type Value: Clone + PartialEq + Send + Sync;

    fn key(&self) -> ActionKey;
    fn read(&self) -> Self::Value;
    fn apply(&self, value: Self::Value);
}

/// A revision-tracked optimistic write.
#[async_trait]
pub trait PushSync: PushTarget {
    type Response: Send;

    /// The value this call wants to show.
    fn value(&self) -> Self::Value;

    /// Send the write. Must call [`RevisionAck::report`] before returning
    /// successfully.
    async fn send(
        &self,
        request: &PushRequest<Self::Value>,
        ack: &RevisionAck,
    ) -> Result<Self::Response, Failure>;

    fn apply_response(&self, _response: &Self::Response) {}

    async fn on_finish(
        &self,
        _value: &Self::Value,
        _error: Option<&ActionError>,
    ) -> Option<Self::Value> {
        None
    }

    fn features(&self) -> Features {
        Features::new()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct PushSyncCoordinator {
    pipeline: Arc<ActionPipeline>,
    device_id: DeviceId,
    store: Option<Arc<dyn RevisionStore>>,
    follow_up_limit: u32,
}

struct Round<V, R> {
    request: PushRequest<V>,
    response: R,
    server_revision: u64,
}

impl PushSyncCoordinator {
    pub fn new(pipeline: Arc<ActionPipeline>, device_id: DeviceId) -> Self {
        Self {
            pipeline,
            device_id,
            store: None,
            follow_up_limit: DEFAULT_FOLLOW_UP_LIMIT,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RevisionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_follow_up_limit(mut self, limit: u32) -> Self {
        self.follow_up_limit = limit;
        self
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn registry(&self) -> &KeyedStateRegistry {
        self.pipeline.registry()
    }

    /// Known revision state, seeding the registry from the store on first
    /// sight.
    fn entry(&self, key: &ActionKey) -> RevisionEntry {
        self.update(key, |entry| *entry)
    }

    fn update<R>(&self, key: &ActionKey, f: impl FnOnce(&mut RevisionEntry) -> R) -> R {
        let persisted = self.store.as_ref().and_then(|store| store.load(key));
        self.registry().update_revision(
            key,
            || RevisionEntry {
                server_revision: persisted.unwrap_or(0),
                ..RevisionEntry::default()
            },
            |entry| {
                if let Some(persisted) = persisted {
                    entry.server_revision = entry.server_revision.max(persisted);
                }
                f(entry)
            },
        )
    }

    fn persist(&self, key: &ActionKey, server_revision: u64) {
        if let Some(store) = &self.store {
            store.save(key, server_revision);
        }
    }

    pub async fn run<P: PushSync>(&self, sync: &P) -> Result<Outcome<P::Response>, ActionError> {
        let key = sync.key();

        let local_revision = self.update(&key, |entry| {
            entry.local_revision += 1;
            entry.is_push = false;
            entry.local_revision
        });
        sync.apply(sync.value());

        let Some(mut send_lock) = self.registry().try_begin_send(&key) else {
            debug!(%key, local_revision, "send in flight, coalesced");
            return Ok(Outcome::Skipped(SkipReason::Coalesced));
        };

        let follow_ups = AtomicU32::new(0);
        let (key_ref, counter) = (&key, &follow_ups);

        loop {
            let result = self
                .pipeline
                .execute(key.clone(), sync.features(), move |_| {
                    self.send_until_settled(sync, key_ref, counter)
                })
                .await;

            match result {
                Ok(Outcome::Completed(round)) => {
                    drop(send_lock);
                    let entry = self.entry(&key);
                    if entry.local_revision > round.request.local_revision && !entry.is_push {
                        if let Some(lock) = self.registry().try_begin_send(&key) {
                            send_lock = lock;
                            continue;
                        }
                        return Ok(Outcome::Skipped(SkipReason::Coalesced));
                    }

                    let accepted = self.update(&key, |entry| {
                        if round.server_revision >= entry.server_revision {
                            entry.server_revision = round.server_revision;
                            true
                        } else {
                            false
                        }
                    });
                    if accepted {
                        self.persist(&key, round.server_revision);
                        sync.apply_response(&round.response);
                    } else {
                        debug!(
                            %key,
                            server_revision = round.server_revision,
                            "response older than known revision, not applied"
                        );
                    }

                    if let Some(replacement) = sync.on_finish(&round.request.value, None).await {
                        sync.apply(replacement);
                    }
                    return Ok(Outcome::Completed(round.response));
                }
                Ok(Outcome::Skipped(reason)) => return Ok(Outcome::Skipped(reason)),
                Err(error) => {
                    drop(send_lock);
                    if let Some(replacement) = sync.on_finish(&sync.read(), Some(&error)).await {
                        sync.apply(replacement);
                    }
                    return Err(error);
                }
            }
        }
    }

    async fn send_until_settled<P: PushSync>(
        &self,
        sync: &P,
        key: &ActionKey,
        follow_ups: &AtomicU32,
    ) -> Result<Round<P::Value, P::Response>, Failure> {
        loop {
            let request = PushRequest {
                value: sync.read(),
                local_revision: self.entry(key).local_revision,
                device_id: self.device_id,
            };
            let ack = RevisionAck::new();
            let response = sync.send(&request, &ack).await?;
            let Some(server_revision) = ack.reported() else {
                warn!(%key, "send returned without a server revision");
                return Err(Failure::fatal(ProtocolViolation::MissingServerRevision {
                    key: key.clone(),
                }));
            };

            let entry = self.entry(key);
            if entry.local_revision <= request.local_revision || entry.is_push {
                return Ok(Round {
                    request,
                    response,
                    server_revision,
                });
            }

            let count = follow_ups.fetch_add(1, Ordering::SeqCst) + 1;
            if count > self.follow_up_limit {
                warn!(%key, limit = self.follow_up_limit, "follow-up limit exceeded");
                return Err(Failure::fatal(ProtocolViolation::FollowUpLimit {
                    key: key.clone(),
                    limit: self.follow_up_limit,
                }));
            }
            debug!(
                %key,
                sent = request.local_revision,
                current = entry.local_revision,
                "local writes arrived while sending"
            );
        }
    }

    /// Reconcile a server push with local state.
    pub fn receive_push<T: PushTarget>(
        &self,
        target: &T,
        update: PushUpdate<T::Value>,
    ) -> PushDisposition {
        let key = target.key();
        let own_device = update.device_id == self.device_id;

        let disposition = self.update(&key, |entry| {
            if update.server_revision <= entry.server_revision {
                return PushDisposition::Stale;
            }
            entry.server_revision = update.server_revision;
            if own_device && update.local_revision < entry.local_revision {
                return PushDisposition::SelfEcho;
            }
            if own_device {
                entry.local_revision = entry.local_revision.max(update.local_revision);
            }
            entry.is_push = true;
            PushDisposition::Applied
        });

        match disposition {
            PushDisposition::Stale => {
                debug!(%key, server_revision = update.server_revision, "stale push ignored");
            }
            PushDisposition::SelfEcho => {
                debug!(%key, server_revision = update.server_revision, "own echo, revision only");
                self.persist(&key, update.server_revision);
            }
            PushDisposition::Applied => {
                debug!(%key, server_revision = update.server_revision, "push applied");
                self.persist(&key, update.server_revision);
                target.apply(update.value);
            }
        }
        disposition
    }
}

impl fmt::Debug for PushSyncCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSyncCoordinator")
            .field("device_id", &self.device_id)
            .field("follow_up_limit", &self.follow_up_limit)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use std::time::Duration;

    #[derive(Default)]
    struct Store(DashMap<ActionKey, u64>);

    impl RevisionStore for Store {
        fn load(&self, key: &ActionKey) -> Option<u64> {
            self.0.get(key).map(|r| *r)
        }
        fn save(&self, key: &ActionKey, server_revision: u64) {
            self.0.insert(key.clone(), server_revision);
        }
    }

    /// Fake server: assigns increasing revisions, optionally slowly.
    #[derive(Default)]
    struct Server {
        revision: Mutex<u64>,
        received: Mutex<Vec<PushRequest<u32>>>,
        applied: Mutex<Vec<u32>>,
        latency: Duration,
        skip_ack: bool,
    }

    impl Server {
        fn accept(&self, request: &PushRequest<u32>) -> u64 {
            self.received.lock().unwrap().push(request.clone());
            let mut revision = self.revision.lock().unwrap();
            *revision += 1;
            *revision
        }
    }

    struct Volume {
        state: Arc<Mutex<u32>>,
        server: Arc<Server>,
        value: u32,
    }

    impl PushTarget for Volume {
        type Value = u32;

        fn key(&self) -> ActionKey {
            ActionKey::name("volume")
        }
        fn read(&self) -> u32 {
            *self.state.lock().unwrap()
        }
        fn apply(&self, value: u32) {
            *self.state.lock().unwrap() = value;
        }
    }

    #[async_trait]
    impl PushSync for Volume {
        type Response = u32;

        fn value(&self) -> u32 {
            self.value
        }

        async fn send(&self, request: &PushRequest<u32>, ack: &RevisionAck) -> Result<u32, Failure> {
            let revision = self.server.accept(request);
            tokio::time::sleep(self.server.latency).await;
            if !self.server.skip_ack {
                ack.report(revision);
            }
            Ok(request.value)
        }

        fn apply_response(&self, response: &u32) {
            self.server.applied.lock().unwrap().push(*response);
            self.apply(*response);
        }
    }

    fn coordinator(device: u64) -> Arc<PushSyncCoordinator> {
        Arc::new(PushSyncCoordinator::new(
            Arc::new(ActionPipeline::new(KeyedStateRegistry::shared())),
            DeviceId(device),
        ))
    }

    fn volume(state: &Arc<Mutex<u32>>, server: &Arc<Server>, value: u32) -> Volume {
        Volume {
            state: state.clone(),
            server: server.clone(),
            value,
        }
    }

    fn update(value: u32, server_revision: u64, local_revision: u64, device: u64) -> PushUpdate<u32> {
        PushUpdate {
            value,
            server_revision,
            local_revision,
            device_id: DeviceId(device),
        }
    }

    #[tokio::test]
    async fn test_write_records_server_revision() {
        let coordinator = coordinator(1);
        let state = Arc::new(Mutex::new(0));
        let server = Arc::new(Server::default());

        let outcome = coordinator.run(&volume(&state, &server, 5)).await.unwrap();
        assert_eq!(outcome, Outcome::Completed(5));

        let entry = coordinator.entry(&ActionKey::name("volume"));
        assert_eq!(entry.local_revision, 1);
        assert_eq!(entry.server_revision, 1);
        assert!(!entry.is_push);
        let sent = server.received.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![PushRequest {
                value: 5,
                local_revision: 1,
                device_id: DeviceId(1),
            }]
        );
        assert_eq!(*server.applied.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_missing_ack_is_protocol_violation() {
        let coordinator = coordinator(1);
        let state = Arc::new(Mutex::new(0));
        let server = Arc::new(Server {
            skip_ack: true,
            ..Server::default()
        });

        let result = coordinator.run(&volume(&state, &server, 5)).await;
        assert!(matches!(
            result,
            Err(ActionError::Protocol(ProtocolViolation::MissingServerRevision { .. }))
        ));
        // Not retried.
        assert_eq!(server.received.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_during_send_follow_up_with_latest() {
        let coordinator = coordinator(1);
        let state = Arc::new(Mutex::new(0));
        let server = Arc::new(Server {
            latency: Duration::from_millis(100),
            ..Server::default()
        });

        let c = coordinator.clone();
        let first = volume(&state, &server, 10);
        let task = tokio::spawn(async move { c.run(&first).await });
        tokio::task::yield_now().await;

        for value in [20, 30, 40] {
            let outcome = coordinator.run(&volume(&state, &server, value)).await.unwrap();
            assert_eq!(outcome, Outcome::Skipped(SkipReason::Coalesced));
        }

        assert_eq!(task.await.unwrap().unwrap(), Outcome::Completed(40));
        let sent: Vec<(u32, u64)> = server
            .received
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.value, r.local_revision))
            .collect();
        assert_eq!(sent, vec![(10, 1), (40, 4)]);
        assert_eq!(*state.lock().unwrap(), 40);
    }

    #[test]
    fn test_stale_push_rejected() {
        let coordinator = coordinator(1);
        let state = Arc::new(Mutex::new(0));
        let target = volume(&state, &Arc::new(Server::default()), 0);

        assert_eq!(
            coordinator.receive_push(&target, update(3, 3, 1, 2)),
            PushDisposition::Applied
        );
        assert_eq!(
            coordinator.receive_push(&target, update(2, 2, 1, 2)),
            PushDisposition::Stale
        );
        assert_eq!(*state.lock().unwrap(), 3);
        let entry = coordinator.entry(&target.key());
        assert_eq!(entry.server_revision, 3);
        assert!(entry.is_push);
    }

    #[test]
    fn test_self_echo_updates_revision_only() {
        let coordinator = coordinator(7);
        let state = Arc::new(Mutex::new(9));
        let target = volume(&state, &Arc::new(Server::default()), 0);
        coordinator.update(&target.key(), |entry| entry.local_revision = 5);

        let disposition = coordinator.receive_push(&target, update(1, 4, 3, 7));
        assert_eq!(disposition, PushDisposition::SelfEcho);
        assert_eq!(*state.lock().unwrap(), 9);
        let entry = coordinator.entry(&target.key());
        assert_eq!(entry.server_revision, 4);
        assert_eq!(entry.local_revision, 5);
        assert!(!entry.is_push);
    }

    #[test]
    fn test_own_latest_echo_applies_and_raises_local_revision() {
        let coordinator = coordinator(7);
        let state = Arc::new(Mutex::new(0));
        let target = volume(&state, &Arc::new(Server::default()), 0);
        coordinator.update(&target.key(), |entry| entry.local_revision = 2);

        let disposition = coordinator.receive_push(&target, update(8, 1, 6, 7));
        assert_eq!(disposition, PushDisposition::Applied);
        assert_eq!(*state.lock().unwrap(), 8);
        assert_eq!(coordinator.entry(&target.key()).local_revision, 6);
    }

    #[test]
    fn test_persisted_revision_seeds_registry() {
        let store = Arc::new(Store::default());
        store.save(&ActionKey::name("volume"), 10);
        let coordinator = PushSyncCoordinator::new(
            Arc::new(ActionPipeline::new(KeyedStateRegistry::shared())),
            DeviceId(1),
        )
        .with_store(store.clone());

        let state = Arc::new(Mutex::new(0));
        let target = volume(&state, &Arc::new(Server::default()), 0);

        assert_eq!(
            coordinator.receive_push(&target, update(1, 9, 1, 2)),
            PushDisposition::Stale
        );
        assert_eq!(
            coordinator.receive_push(&target, update(1, 11, 1, 2)),
            PushDisposition::Applied
        );
        assert_eq!(store.load(&ActionKey::name("volume")), Some(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_during_send_wins_over_older_response() {
        let coordinator = coordinator(1);
        let state = Arc::new(Mutex::new(0));
        let server = Arc::new(Server {
            latency: Duration::from_millis(100),
            ..Server::default()
        });

        let c = coordinator.clone();
        let first = volume(&state, &server, 10);
        let task = tokio::spawn(async move { c.run(&first).await });
        tokio::task::yield_now().await;

        // Another device writes after us; its push lands while our ack is pending.
        let target = volume(&state, &server, 0);
        assert_eq!(
            coordinator.receive_push(&target, update(99, 5, 1, 2)),
            PushDisposition::Applied
        );

        task.await.unwrap().unwrap();
        assert_eq!(*state.lock().unwrap(), 99);
        assert!(server.applied.lock().unwrap().is_empty());
        assert_eq!(coordinator.entry(&target.key()).server_revision, 5);
        assert_eq!(server.received.lock().unwrap().len(), 1);
    }
}
