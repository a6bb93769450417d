//! Sync, push and command fixtures backed by `tether-testing`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tether::{
    async_trait, ActionError, ActionKey, DeviceId, Failure, OptimisticCommand, OptimisticSync,
    PushRequest, PushSync, PushTarget, ReloadPolicy, RevisionAck, Tether,
};
use tether_testing::{RecordingServer, SharedState};

pub fn tether(device: u64) -> Arc<Tether> {
    Arc::new(Tether::builder().with_device_id(DeviceId(device)).build())
}

// =============================================================================
// Toggle (coalescing sync)
// =============================================================================

#[derive(Clone)]
pub struct Toggle {
    pub state: SharedState<bool>,
    pub server: RecordingServer<bool>,
    pub finished: SharedState<Vec<(bool, bool)>>,
    pub value: bool,
}

impl Toggle {
    pub fn new(latency: Duration) -> Self {
        Self {
            state: SharedState::new(false),
            server: RecordingServer::new().with_latency(latency),
            finished: SharedState::new(Vec::new()),
            value: false,
        }
    }

    /// A call that flips the current value.
    pub fn tap(&self) -> Self {
        Self {
            value: !self.state.get(),
            ..self.clone()
        }
    }
}

#[async_trait]
impl OptimisticSync for Toggle {
    type Value = bool;
    type Response = bool;

    fn key(&self) -> ActionKey {
        ActionKey::from(("toggle", 1))
    }

    fn value(&self) -> bool {
        self.value
    }

    fn read(&self) -> bool {
        self.state.get()
    }

    fn apply(&self, value: bool) {
        self.state.set(value);
    }

    async fn send(&self, value: &bool) -> Result<bool, Failure> {
        self.server.send(value).await
    }

    async fn on_finish(&self, value: &bool, error: Option<&ActionError>) -> Option<bool> {
        let mut finished = self.finished.get();
        finished.push((*value, error.is_some()));
        self.finished.set(finished);
        None
    }
}

// =============================================================================
// Volume (revision-tracked push sync)
// =============================================================================

#[derive(Clone)]
pub struct Volume {
    pub state: SharedState<u32>,
    pub server: RecordingServer<u32>,
    /// Server revisions passed to `apply_response`.
    pub confirmed: SharedState<Vec<u64>>,
    pub value: u32,
}

impl Volume {
    pub fn new(latency: Duration) -> Self {
        Self {
            state: SharedState::new(0),
            server: RecordingServer::new().with_latency(latency),
            confirmed: SharedState::new(Vec::new()),
            value: 0,
        }
    }

    pub fn set(&self, value: u32) -> Self {
        Self {
            value,
            ..self.clone()
        }
    }
}

impl PushTarget for Volume {
    type Value = u32;

    fn key(&self) -> ActionKey {
        ActionKey::name("volume")
    }

    fn read(&self) -> u32 {
        self.state.get()
    }

    fn apply(&self, value: u32) {
        self.state.set(value);
    }
}

#[async_trait]
impl PushSync for Volume {
    type Response = u64;

    fn value(&self) -> u32 {
        self.value
    }

    async fn send(&self, request: &PushRequest<u32>, ack: &RevisionAck) -> Result<u64, Failure> {
        self.server.send_push(request, ack).await
    }

    fn apply_response(&self, server_revision: &u64) {
        let mut confirmed = self.confirmed.get();
        confirmed.push(*server_revision);
        self.confirmed.set(confirmed);
    }
}

// =============================================================================
// Rename (optimistic command)
// =============================================================================

#[derive(Clone)]
pub struct Rename {
    pub state: SharedState<String>,
    pub server: RecordingServer<String>,
    pub authoritative: Option<String>,
    pub reload_policy: ReloadPolicy,
    pub to: String,
}

impl Rename {
    pub fn new(initial: &str, to: &str) -> Self {
        Self {
            state: SharedState::new(initial.to_string()),
            server: RecordingServer::new(),
            authoritative: None,
            reload_policy: ReloadPolicy::OnFailure,
            to: to.to_string(),
        }
    }
}

#[async_trait]
impl OptimisticCommand for Rename {
    type Value = String;
    type Response = String;

    fn key(&self) -> ActionKey {
        ActionKey::tag("Profile", "Rename")
    }

    fn optimistic_value(&self) -> String {
        self.to.clone()
    }

    fn read(&self) -> String {
        self.state.get()
    }

    fn apply(&self, value: String) {
        self.state.set(value);
    }

    async fn send(&self, value: &String) -> Result<String, Failure> {
        self.server.send(value).await
    }

    async fn reload(&self) -> anyhow::Result<Option<String>> {
        Ok(self.authoritative.clone())
    }

    fn reload_policy(&self) -> ReloadPolicy {
        self.reload_policy
    }
}
