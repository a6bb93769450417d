//! Testing utilities for tether pipelines and coordinators.
//!
//! # Quick Start
//!
//! ```ignore
//! use tether_testing::{ManualConnectivity, RecordingServer, SharedState};
//!
//! let net = ManualConnectivity::offline();
//! let tether = Tether::builder().with_connectivity(net.clone()).build();
//!
//! let server = RecordingServer::<bool>::new().with_latency(Duration::from_millis(200));
//! let state = SharedState::new(false);
//!
//! // ... run syncs whose `send` calls `server.send(value)` ...
//!
//! assert_eq!(server.sent_values(), vec![true, false]);
//! assert_eq!(state.get(), false);
//! ```
//!
//! Bursts of spawned calls can be drained with [`SettleCounter`] instead of
//! sleeping for a guessed duration.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use tether::{Connectivity, DeviceId, Failure, PushRequest, PushUpdate, RevisionAck};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Manual Connectivity
// =============================================================================

/// Connectivity probe flipped by the test.
#[derive(Debug, Default)]
pub struct ManualConnectivity {
    online: AtomicBool,
    probes: AtomicUsize,
}

impl ManualConnectivity {
    pub fn online() -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn offline() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// How many times the probe was consulted.
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connectivity for ManualConnectivity {
    async fn is_online(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.online.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Shared State
// =============================================================================

/// Client-side state that records every value applied to it.
#[derive(Debug)]
pub struct SharedState<T> {
    inner: Arc<Mutex<StateInner<T>>>,
}

#[derive(Debug)]
struct StateInner<T> {
    value: T,
    history: Vec<T>,
}

impl<T: Clone> SharedState<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateInner {
                value,
                history: Vec::new(),
            })),
        }
    }

    pub fn get(&self) -> T {
        lock(&self.inner).value.clone()
    }

    pub fn set(&self, value: T) {
        let mut inner = lock(&self.inner);
        inner.history.push(value.clone());
        inner.value = value;
    }

    /// Every value passed to [`set`](Self::set), oldest first.
    pub fn history(&self) -> Vec<T> {
        lock(&self.inner).history.clone()
    }
}

impl<T> Clone for SharedState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

// =============================================================================
// Recording Server
// =============================================================================

/// A failure the server returns for one upcoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    Retriable(String),
    Fatal(String),
}

impl ScriptedFailure {
    fn into_failure(self) -> Failure {
        match self {
            ScriptedFailure::Retriable(message) => Failure::retriable(anyhow::anyhow!(message)),
            ScriptedFailure::Fatal(message) => Failure::fatal(anyhow::anyhow!(message)),
        }
    }
}

/// One request the server received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSend<V> {
    pub value: V,
    pub local_revision: Option<u64>,
    pub device_id: Option<DeviceId>,
    /// Revision assigned to the write, if it was accepted.
    pub server_revision: Option<u64>,
    pub received_at: DateTime<Utc>,
}

/// Fake server that records requests, assigns monotonic revisions, and
/// answers after a configurable latency or with scripted failures.
///
/// Requests are recorded when they arrive, before the latency elapses.
#[derive(Debug)]
pub struct RecordingServer<V> {
    inner: Arc<ServerInner<V>>,
}

#[derive(Debug)]
struct ServerInner<V> {
    sends: Mutex<Vec<RecordedSend<V>>>,
    failures: Mutex<VecDeque<ScriptedFailure>>,
    revision: AtomicU64,
    latency_ms: AtomicU64,
    omit_acks: AtomicBool,
}

impl<V: Clone + Send + Sync> RecordingServer<V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServerInner {
                sends: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                revision: AtomicU64::new(0),
                latency_ms: AtomicU64::new(0),
                omit_acks: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail the next request that does not already have a failure scripted.
    pub fn fail_next(&self, failure: ScriptedFailure) {
        lock(&self.inner.failures).push_back(failure);
    }

    /// Stop reporting server revisions on push sends.
    pub fn omit_acks(&self) {
        self.inner.omit_acks.store(true, Ordering::SeqCst);
    }

    /// Plain request: echoes the value back.
    pub async fn send(&self, value: &V) -> Result<V, Failure> {
        let arrival = self.arrive(value.clone(), None, None);
        self.respond().await;
        arrival
            .map(|_| value.clone())
            .map_err(ScriptedFailure::into_failure)
    }

    /// Revision-tracked request: assigns the next server revision and
    /// reports it through `ack`.
    pub async fn send_push(&self, request: &PushRequest<V>, ack: &RevisionAck) -> Result<u64, Failure> {
        let arrival = self.arrive(
            request.value.clone(),
            Some(request.local_revision),
            Some(request.device_id),
        );
        self.respond().await;
        let revision = arrival.map_err(ScriptedFailure::into_failure)?.unwrap_or(0);
        if !self.inner.omit_acks.load(Ordering::SeqCst) {
            ack.report(revision);
        }
        Ok(revision)
    }

    /// A write from another client, stamped with the next server revision,
    /// as it would be pushed to every device.
    pub fn external_write(&self, value: V, local_revision: u64, device_id: DeviceId) -> PushUpdate<V> {
        let server_revision = self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1;
        PushUpdate {
            value,
            server_revision,
            local_revision,
            device_id,
        }
    }

    /// The push the server would broadcast for the `n`-th recorded send.
    pub fn echo_of(&self, n: usize) -> Option<PushUpdate<V>> {
        let sends = lock(&self.inner.sends);
        let send = sends.get(n)?;
        Some(PushUpdate {
            value: send.value.clone(),
            server_revision: send.server_revision?,
            local_revision: send.local_revision?,
            device_id: send.device_id?,
        })
    }

    pub fn sends(&self) -> Vec<RecordedSend<V>> {
        lock(&self.inner.sends).clone()
    }

    pub fn sent_values(&self) -> Vec<V> {
        lock(&self.inner.sends).iter().map(|s| s.value.clone()).collect()
    }

    pub fn send_count(&self) -> usize {
        lock(&self.inner.sends).len()
    }

    /// Highest revision assigned so far.
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    fn arrive(
        &self,
        value: V,
        local_revision: Option<u64>,
        device_id: Option<DeviceId>,
    ) -> Result<Option<u64>, ScriptedFailure> {
        let failure = lock(&self.inner.failures).pop_front();
        let server_revision = match (&failure, local_revision) {
            (None, Some(_)) => Some(self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1),
            _ => None,
        };
        lock(&self.inner.sends).push(RecordedSend {
            value,
            local_revision,
            device_id,
            server_revision,
            received_at: Utc::now(),
        });
        match failure {
            Some(failure) => Err(failure),
            None => Ok(server_revision),
        }
    }

    async fn respond(&self) {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }
}

impl<V: Clone + Send + Sync> Default for RecordingServer<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for RecordingServer<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

// =============================================================================
// Settle Counter
// =============================================================================

/// Counts calls that have settled (completed, skipped or failed) so a test
/// can wait for a burst to drain without sleeping.
///
/// ```ignore
/// let settled = SettleCounter::new();
///
/// // in each spawned task, after the call returns: settled.mark()
///
/// timeout(Duration::from_secs(5), settled.wait_for(10)).await?;
/// ```
#[derive(Debug)]
pub struct SettleCounter {
    count: watch::Sender<usize>,
}

impl SettleCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            count: watch::Sender::new(0),
        })
    }

    pub fn mark(&self) {
        self.count.send_modify(|count| *count += 1);
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolves once at least `n` calls have settled.
    pub async fn wait_for(&self, n: usize) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}
