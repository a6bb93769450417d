//! The action pipeline.
//!
//! [`ActionPipeline::execute`] runs an action under a [`Features`] set. The
//! gates run in a fixed order; any of them can end the call with
//! [`Outcome::Skipped`] without running the action:
//!
//! ```text
//! execute(key, features, action)
//!     │
//!     ├─ 1. debounce ............ newer call arrived?      ─► Skipped(Debounced)
//!     ├─ 2. connectivity ........ offline (not fused)?     ─► Skipped(Offline) | Err(Offline)
//!     ├─ 3. queue admission ..... full?                    ─► Skipped(QueueFull)
//!     ├─ 4. queue ordering ...... evicted / timed out?     ─► Skipped(Evicted | QueueTimeout)
//!     ├─ 5. mutual exclusion .... already running?         ─► Skipped(AlreadyRunning)
//!     ├─ 6. throttle ............ locked since last start? ─► Skipped(Throttled)
//!     ├─ 7. freshness ........... fresh since last success?─► Skipped(Fresh)
//!     ├─ 8. before hook ......... Abort?                    ─► (after) Skipped(Aborted)
//!     ├─ 9. retry-wrapped action
//!     ├─ 10. after hook (always)
//!     └─ 11. classify + cleanup
//! ```
//!
//! Cleanup is carried by RAII guards (queue turn, non-reentrant membership,
//! freshness claim, in-flight count), so it also happens when the returned
//! future is dropped mid-flight.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::{ConnectivityCheck, Features};
use crate::connectivity::{AlwaysOnline, Connectivity};
use crate::error::{ActionError, Failure, ProtocolViolation, UserFacingError};
use crate::hooks::{ActionContext, ActionHooks, Disposition, ErrorClassifier, NoHooks, PassThrough};
use crate::key::ActionKey;
use crate::outcome::{Outcome, SkipReason};
use crate::registry::KeyedStateRegistry;
use crate::retry::{run_caught, RetryError, RetryExecutor};

pub struct ActionPipeline {
    registry: Arc<KeyedStateRegistry>,
    connectivity: Arc<dyn Connectivity>,
    classifier: Arc<dyn ErrorClassifier>,
}

impl ActionPipeline {
    /// Pipeline over `registry` with an always-online probe and a
    /// pass-through classifier.
    pub fn new(registry: Arc<KeyedStateRegistry>) -> Self {
        Self {
            registry,
            connectivity: Arc::new(AlwaysOnline),
            classifier: Arc::new(PassThrough),
        }
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn registry(&self) -> &Arc<KeyedStateRegistry> {
        &self.registry
    }

    pub fn connectivity(&self) -> &Arc<dyn Connectivity> {
        &self.connectivity
    }

    /// Run `action` under `features` with no lifecycle hooks.
    pub async fn execute<T, F, Fut>(
        &self,
        key: impl Into<ActionKey>,
        features: Features,
        action: F,
    ) -> Result<Outcome<T>, ActionError>
    where
        F: FnMut(ActionContext) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        self.execute_with(key, features, &NoHooks, action).await
    }

    /// Run `action` under `features` with lifecycle `hooks`.
    pub async fn execute_with<T, F, Fut>(
        &self,
        key: impl Into<ActionKey>,
        features: Features,
        hooks: &dyn ActionHooks,
        action: F,
    ) -> Result<Outcome<T>, ActionError>
    where
        F: FnMut(ActionContext) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let key = key.into();
        let features = Arc::new(features);
        let registry = self.registry.as_ref();

        // 1. Debounce
        if let Some(debounce) = &features.debounce {
            let generation = registry.bump_debounce(&key);
            tokio::time::sleep(debounce.duration).await;
            if registry.debounce_generation(&key) != generation {
                return skipped(&key, SkipReason::Debounced);
            }
        }

        // 2. Connectivity gate (fused checks run inside the retry loop)
        if let Some(check) = &features.connectivity {
            if !features.connectivity_fused() && !self.connectivity.is_online().await {
                if check.abort_silently {
                    return skipped(&key, SkipReason::Offline);
                }
                return self.fail(&key, hooks, offline_error(check));
            }
        }

        // 3 + 4. Queue admission and ordering
        let _turn = match &features.sequential {
            Some(sequential) => {
                let queue_key = sequential.key.as_ref().unwrap_or(&key);
                match registry.queues().acquire(queue_key, sequential).await {
                    Ok(turn) => Some(turn),
                    Err(reason) => return skipped(&key, reason),
                }
            }
            None => None,
        };

        // 5. Mutual exclusion
        let _membership = match &features.non_reentrant {
            Some(non_reentrant) => {
                let exclusion_key = non_reentrant.key.as_ref().unwrap_or(&key);
                match registry.try_enter(exclusion_key) {
                    Some(membership) => Some(membership),
                    None => return skipped(&key, SkipReason::AlreadyRunning),
                }
            }
            None => None,
        };

        // 6. Rate limit, measured from start
        if let Some(throttle) = &features.throttle {
            if !registry.try_throttle(&key, throttle.duration, throttle.ignore_lock) {
                return skipped(&key, SkipReason::Throttled);
            }
        }

        // 7. Freshness, set optimistically and rolled back on failure
        let mut freshness = match &features.freshness {
            Some(fresh) => match registry.try_freshen(&key, fresh.duration, fresh.ignore_freshness) {
                Ok(previous) => Some(FreshnessClaim {
                    registry,
                    key: key.clone(),
                    previous,
                    committed: false,
                }),
                Err(()) => return skipped(&key, SkipReason::Fresh),
            },
            None => None,
        };

        let _inflight = registry.begin_execution(&key);
        let ctx = ActionContext::new(key.clone(), features.clone());
        let started = Instant::now();

        // 8 + 9. Before hook, then the retry-wrapped action
        let result = match run_caught(hooks.before(&ctx)).await {
            Ok(()) => {
                let mut executor = RetryExecutor::new(features.retry.as_ref()).with_hooks(hooks);
                if let (true, Some(check)) = (features.connectivity_fused(), &features.connectivity)
                {
                    executor = executor.with_connectivity(self.connectivity.as_ref(), check);
                }
                executor.run(&ctx, action).await
            }
            Err(Failure::Abort) => Err(RetryError::Aborted),
            Err(Failure::Retriable(e)) | Err(Failure::Fatal(e)) => Err(RetryError::Fatal(e)),
        };

        // 10. After hook, always
        if AssertUnwindSafe(hooks.after(&ctx)).catch_unwind().await.is_err() {
            error!(%key, "after hook panicked");
        }

        // 11. Classification and cleanup
        match result {
            Ok(value) => {
                if let (Some(claim), Some(fresh)) = (freshness.as_mut(), &features.freshness) {
                    claim.commit(fresh.duration);
                }
                debug!(%key, elapsed = ?started.elapsed(), "action completed");
                Ok(Outcome::Completed(value))
            }
            Err(RetryError::Aborted) => skipped(&key, SkipReason::Aborted),
            Err(failure) => {
                if let Some(throttle) = &features.throttle {
                    if throttle.remove_lock_on_error {
                        registry.remove_throttle_lock(&key);
                    }
                }
                let error = match failure {
                    RetryError::Exhausted(e) => ActionError::Failed(e),
                    RetryError::Fatal(e) => match e.downcast::<ProtocolViolation>() {
                        Ok(violation) => ActionError::Protocol(violation),
                        Err(e) => ActionError::Fatal(e),
                    },
                    RetryError::Offline => {
                        let check = features.connectivity.clone().unwrap_or_default();
                        if check.abort_silently {
                            return skipped(&key, SkipReason::Offline);
                        }
                        offline_error(&check)
                    }
                    RetryError::Aborted => return skipped(&key, SkipReason::Aborted),
                };
                self.fail(&key, hooks, error)
            }
        }
    }

    /// Classify a failure, record it against the key and queue it for a
    /// dialog when it asks for one.
    fn fail<T>(
        &self,
        key: &ActionKey,
        hooks: &dyn ActionHooks,
        error: ActionError,
    ) -> Result<Outcome<T>, ActionError> {
        let error = match hooks.classify(key, error) {
            Disposition::Suppress => return skipped(key, SkipReason::Handled),
            Disposition::Raise(error) => error,
        };
        let error = match self.classifier.classify(key, error) {
            Disposition::Suppress => return skipped(key, SkipReason::Handled),
            Disposition::Raise(error) => error,
        };

        warn!(%key, error = %error, "action failed");
        self.registry.record_failure(key, &error);
        if let Some(user_error) = error.user_facing() {
            if user_error.show_dialog {
                self.registry.push_user_error(user_error.clone());
            }
        }
        Err(error)
    }
}

impl std::fmt::Debug for ActionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionPipeline")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn skipped<T>(key: &ActionKey, reason: SkipReason) -> Result<Outcome<T>, ActionError> {
    debug!(%key, %reason, "action skipped");
    Ok(Outcome::Skipped(reason))
}

fn offline_error(check: &ConnectivityCheck) -> ActionError {
    let mut error = UserFacingError::offline();
    error.show_dialog = check.opens_dialog;
    ActionError::Offline(error)
}

/// Restores the previous freshness expiry unless the call succeeded.
struct FreshnessClaim<'a> {
    registry: &'a KeyedStateRegistry,
    key: ActionKey,
    previous: Option<Instant>,
    committed: bool,
}

impl FreshnessClaim<'_> {
    fn commit(&mut self, duration: std::time::Duration) {
        self.registry.commit_freshness(&self.key, duration);
        self.committed = true;
    }
}

impl Drop for FreshnessClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.restore_freshness(&self.key, self.previous);
        }
    }
}
