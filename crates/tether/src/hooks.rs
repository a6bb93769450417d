//! Action context, lifecycle hooks and error classification.
//!
//! Hooks are traits implemented by explicit structs, so everything a hook
//! touches is visible where it is constructed. All methods have no-op
//! defaults; implement only what a call needs.
//!
//! ```ignore
//! struct SpinnerHooks { spinner: Arc<Spinner> }
//!
//! #[async_trait]
//! impl ActionHooks for SpinnerHooks {
//!     async fn before(&self, _ctx: &ActionContext) -> Result<(), Failure> {
//!         self.spinner.show();
//!         Ok(())
//!     }
//!
//!     async fn after(&self, _ctx: &ActionContext) {
//!         self.spinner.hide();
//!     }
//!
//!     fn classify(&self, _key: &ActionKey, error: ActionError) -> Disposition {
//!         Disposition::Raise(UserFacingError::new("Could not save").into())
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Features;
use crate::error::{ActionError, Failure};
use crate::key::ActionKey;

/// What an action sees when it runs.
#[derive(Debug, Clone)]
pub struct ActionContext {
    key: ActionKey,
    features: Arc<Features>,
    attempt: u32,
}

impl ActionContext {
    pub fn new(key: ActionKey, features: Arc<Features>) -> Self {
        Self {
            key,
            features,
            attempt: 0,
        }
    }

    pub(crate) fn with_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    pub fn key(&self) -> &ActionKey {
        &self.key
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    /// 0 for the first attempt, 1 for the first retry, and so on.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// What to do with a failure after retries are exhausted.
#[derive(Debug)]
pub enum Disposition {
    /// Treat as handled; the call returns `Skipped(Handled)`.
    Suppress,
    /// Fail with this error (the original, or a replacement).
    Raise(ActionError),
}

#[async_trait]
pub trait ActionHooks: Send + Sync {
    /// Runs once, before the first attempt. Returning
    /// [`Failure::Abort`] skips the action but still runs [`after`](Self::after).
    async fn before(&self, _ctx: &ActionContext) -> Result<(), Failure> {
        Ok(())
    }

    /// Always runs once the `before` hook has run, whatever the result.
    async fn after(&self, _ctx: &ActionContext) {}

    /// Called once per retry, before the delay is awaited.
    fn on_retry(&self, _key: &ActionKey, _attempt: u32, _delay: Duration, _error: &anyhow::Error) {}

    /// Per-call classification, applied before the pipeline-wide classifier.
    fn classify(&self, _key: &ActionKey, error: ActionError) -> Disposition {
        Disposition::Raise(error)
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl ActionHooks for NoHooks {}

/// Pipeline-wide classification, applied after the per-call hook.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, key: &ActionKey, error: ActionError) -> Disposition;
}

/// Passes every error through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl ErrorClassifier for PassThrough {
    fn classify(&self, _key: &ActionKey, error: ActionError) -> Disposition {
        Disposition::Raise(error)
    }
}

impl<F> ErrorClassifier for F
where
    F: Fn(&ActionKey, ActionError) -> Disposition + Send + Sync,
{
    fn classify(&self, key: &ActionKey, error: ActionError) -> Disposition {
        self(key, error)
    }
}
