//! Coalesced toggles and push reconciliation against a simulated server.
//!
//! ```text
//! RUST_LOG=tether=debug cargo run -p toggle-sync
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether::{
    ActionKey, DeviceId, Failure, Outcome, PushRequest, PushSync, PushTarget, RevisionAck,
    OptimisticSync, Tether,
};
use tether_persistence::MemoryRevisionStore;
use tether_testing::{RecordingServer, SharedState};

// =============================================================================
// Favorite toggle (coalescing)
// =============================================================================

#[derive(Clone)]
struct Favorite {
    state: SharedState<bool>,
    server: RecordingServer<bool>,
    value: bool,
}

impl Favorite {
    fn tap(&self) -> Self {
        Self {
            value: !self.state.get(),
            ..self.clone()
        }
    }
}

#[async_trait]
impl OptimisticSync for Favorite {
    type Value = bool;
    type Response = bool;

    fn key(&self) -> ActionKey {
        ActionKey::from(("favorite", 42))
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
}

// =============================================================================
// Volume slider (revision-tracked)
// =============================================================================

#[derive(Clone)]
struct Volume {
    state: SharedState<u32>,
    server: RecordingServer<u32>,
    value: u32,
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
}

async fn favorite_demo(tether: Arc<Tether>) -> Result<()> {
    let favorite = Favorite {
        state: SharedState::new(false),
        server: RecordingServer::new().with_latency(Duration::from_millis(300)),
        value: false,
    };

    let first = favorite.tap();
    let t = tether.clone();
    let sender = tokio::spawn(async move { t.sync(&first).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    for _ in 0..5 {
        let outcome = tether.sync(&favorite.tap()).await?;
        info!(?outcome, local = favorite.state.get(), "tap");
    }

    let outcome = sender.await??;
    info!(
        ?outcome,
        sends = ?favorite.server.sent_values(),
        final_value = favorite.state.get(),
        "favorite settled"
    );
    Ok(())
}

async fn volume_demo(tether: Arc<Tether>) -> Result<()> {
    let server = RecordingServer::new().with_latency(Duration::from_millis(50));
    let state = SharedState::new(0);
    let volume = |value| Volume {
        state: state.clone(),
        server: server.clone(),
        value,
    };

    if let Outcome::Completed(revision) = tether.push(&volume(30)).await? {
        info!(revision, "local write confirmed");
    }

    // Another device moves the slider; the server pushes it to everyone.
    let remote = server.external_write(70, 1, DeviceId(0xbeef));
    info!(disposition = ?tether.receive_push(&volume(0), remote.clone()), "remote push");

    // Delivered again out of order.
    info!(disposition = ?tether.receive_push(&volume(0), remote), "replayed push");

    // Our own first write, echoed late.
    if let Some(echo) = server.echo_of(0) {
        info!(disposition = ?tether.receive_push(&volume(0), echo), "late echo");
    }

    info!(
        value = state.get(),
        entry = ?tether.registry().revision(&ActionKey::name("volume")),
        "volume settled"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tether=debug")),
        )
        .init();

    let store = Arc::new(MemoryRevisionStore::new());
    let tether = Arc::new(
        Tether::builder()
            .with_device_id(DeviceId(1))
            .with_revision_store(store.clone())
            .build(),
    );

    favorite_demo(tether.clone()).await?;
    volume_demo(tether.clone()).await?;

    info!(snapshot = %store.snapshot().to_json()?, "persisted revisions");
    Ok(())
}
