//! Single-flight optimistic writes with rollback.
//!
//! An [`OptimisticCommand`] applies its value locally before the server
//! confirms it. Duplicate runs for the same key are dropped while one is in
//! flight. On failure the prior value is restored (when nothing else changed
//! the state in the meantime) and the state can be reloaded from the server.
//!
//! ```text
//! run(cmd)
//!   │  non-reentrant gate ─────────────────────────► Skipped(AlreadyRunning)
//!   │  prior = read(); apply(optimistic)
//!   │  send(optimistic)        (retried per features)
//!   │    ├─ ok  ─► apply_response
//!   │    └─ err ─► should_rollback? apply(prior)
//!   │  reload per ReloadPolicy, apply result
//!   └─ release lock
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Features;
use crate::error::{ActionError, Failure};
use crate::hooks::{ActionContext, ActionHooks};
use crate::key::ActionKey;
use crate::outcome::Outcome;
use crate::pipeline::ActionPipeline;

/// When a command reloads its state from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloadPolicy {
    /// Only after a failed send.
    #[default]
    OnFailure,
    /// After every send.
    Always,
    Never,
}

impl ReloadPolicy {
    fn reloads(self, failed: bool) -> bool {
        match self {
            ReloadPolicy::OnFailure => failed,
            ReloadPolicy::Always => true,
            ReloadPolicy::Never => false,
        }
    }
}

/// An optimistic write against the server.
#[async_trait]
pub trait OptimisticCommand: Send + Sync {
    type Value: Clone + PartialEq + Send + Sync;
    type Response: Send;

    fn key(&self) -> ActionKey;

    /// The value to show immediately.
    fn optimistic_value(&self) -> Self::Value;

    /// The live local value.
    fn read(&self) -> Self::Value;

    fn apply(&self, value: Self::Value);

    async fn send(&self, value: &Self::Value) -> Result<Self::Response, Failure>;

    fn apply_response(&self, _response: &Self::Response) {}

    /// Fetch the authoritative value. `Ok(None)` leaves the state alone.
    async fn reload(&self) -> anyhow::Result<Option<Self::Value>> {
        Ok(None)
    }

    /// Whether to restore `prior` after a failed send. By default only when
    /// the state still shows the optimistic value.
    fn should_rollback(&self, _prior: &Self::Value, optimistic: &Self::Value) -> bool {
        self.read() == *optimistic
    }

    fn reload_policy(&self) -> ReloadPolicy {
        ReloadPolicy::OnFailure
    }

    /// Extra features for the send. Mutual exclusion on the command key is
    /// added unless these already name an exclusion key.
    fn features(&self) -> Features {
        Features::new()
    }
}

pub struct OptimisticCommandCoordinator {
    pipeline: Arc<ActionPipeline>,
}

impl OptimisticCommandCoordinator {
    pub fn new(pipeline: Arc<ActionPipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn run<C: OptimisticCommand>(
        &self,
        command: &C,
    ) -> Result<Outcome<C::Response>, ActionError> {
        let hooks = CommandHooks {
            command,
            prior: Mutex::new(None),
            failed: AtomicBool::new(false),
        };
        let mut features = command.features();
        if features.non_reentrant.is_none() {
            features = features.non_reentrant();
        }
        let state = &hooks;

        self.pipeline
            .execute_with(command.key(), features, &hooks, move |_| async move {
                state.failed.store(true, Ordering::SeqCst);
                let value = command.optimistic_value();
                let response = command.send(&value).await?;
                command.apply_response(&response);
                state.failed.store(false, Ordering::SeqCst);
                Ok(response)
            })
            .await
    }
}

/// Carries the optimistic apply and the rollback through the pipeline's
/// lifecycle, so both happen while the key is still held.
struct CommandHooks<'c, C: OptimisticCommand> {
    command: &'c C,
    prior: Mutex<Option<C::Value>>,
    failed: AtomicBool,
}

#[async_trait]
impl<'c, C: OptimisticCommand> ActionHooks for CommandHooks<'c, C> {
    async fn before(&self, _ctx: &ActionContext) -> Result<(), Failure> {
        let prior = self.command.read();
        self.command.apply(self.command.optimistic_value());
        *self.prior.lock().unwrap_or_else(PoisonError::into_inner) = Some(prior);
        Ok(())
    }

    async fn after(&self, ctx: &ActionContext) {
        let failed = self.failed.load(Ordering::SeqCst);
        let prior = self.prior.lock().unwrap_or_else(PoisonError::into_inner).take();

        if failed {
            if let Some(prior) = prior {
                let optimistic = self.command.optimistic_value();
                if self.command.should_rollback(&prior, &optimistic) {
                    debug!(key = %ctx.key(), "rolling back optimistic value");
                    self.command.apply(prior);
                }
            }
        }

        if self.command.reload_policy().reloads(failed) {
            match self.command.reload().await {
                Ok(Some(value)) => self.command.apply(value),
                Ok(None) => {}
                Err(e) => warn!(key = %ctx.key(), error = %e, "reload failed"),
            }
        }
    }
}
