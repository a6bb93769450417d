//! The assembled coordination layer.
//!
//! [`Tether`] owns one registry and wires it into the pipeline and the
//! three coordinators. Build it once per session and share it.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::command::{OptimisticCommand, OptimisticCommandCoordinator};
use crate::config::{Features, DEFAULT_FOLLOW_UP_LIMIT};
use crate::connectivity::{AlwaysOnline, Connectivity};
use crate::error::{ActionError, Failure, UserFacingError};
use crate::hooks::{ActionContext, ActionHooks, ErrorClassifier, PassThrough};
use crate::key::ActionKey;
use crate::outcome::Outcome;
use crate::pipeline::ActionPipeline;
use crate::push::{
    DeviceId, PushDisposition, PushSync, PushSyncCoordinator, PushTarget, PushUpdate, RevisionStore,
};
use crate::registry::KeyedStateRegistry;
use crate::sync::{OptimisticSync, OptimisticSyncCoordinator};

pub struct Tether {
    pipeline: Arc<ActionPipeline>,
    commands: OptimisticCommandCoordinator,
    syncs: OptimisticSyncCoordinator,
    pushes: PushSyncCoordinator,
}

impl Tether {
    pub fn builder() -> TetherBuilder {
        TetherBuilder::new()
    }

    pub fn pipeline(&self) -> &Arc<ActionPipeline> {
        &self.pipeline
    }

    pub fn registry(&self) -> &KeyedStateRegistry {
        self.pipeline.registry()
    }

    pub fn device_id(&self) -> DeviceId {
        self.pushes.device_id()
    }

    /// Run an action through the pipeline. See [`ActionPipeline::execute`].
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
        self.pipeline.execute(key, features, action).await
    }

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
        self.pipeline.execute_with(key, features, hooks, action).await
    }

    pub async fn command<C: OptimisticCommand>(
        &self,
        command: &C,
    ) -> Result<Outcome<C::Response>, ActionError> {
        self.commands.run(command).await
    }

    pub async fn sync<S: OptimisticSync>(&self, sync: &S) -> Result<Outcome<S::Response>, ActionError> {
        self.syncs.run(sync).await
    }

    pub async fn push<P: PushSync>(&self, sync: &P) -> Result<Outcome<P::Response>, ActionError> {
        self.pushes.run(sync).await
    }

    pub fn receive_push<T: PushTarget>(&self, target: &T, update: PushUpdate<T::Value>) -> PushDisposition {
        self.pushes.receive_push(target, update)
    }

    /// Drain queued dialog-worthy errors for the UI.
    pub fn take_user_errors(&self) -> Vec<UserFacingError> {
        self.registry().take_user_errors()
    }

    /// Clear all per-key state, pending user errors and the session store.
    pub fn reset(&self) {
        self.registry().reset();
    }
}

impl std::fmt::Debug for Tether {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tether")
            .field("pipeline", &self.pipeline)
            .field("pushes", &self.pushes)
            .finish_non_exhaustive()
    }
}

impl Default for Tether {
    fn default() -> Self {
        Self::builder().build()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Tether`].
///
/// ```ignore
/// let tether = Tether::builder()
///     .with_connectivity(Arc::new(NetworkProbe::new()))
///     .with_classifier(Arc::new(|_: &ActionKey, e: ActionError| Disposition::Raise(e)))
///     .with_revision_store(store)
///     .build();
/// ```
pub struct TetherBuilder {
    registry: Option<Arc<KeyedStateRegistry>>,
    connectivity: Arc<dyn Connectivity>,
    classifier: Arc<dyn ErrorClassifier>,
    device_id: Option<DeviceId>,
    revision_store: Option<Arc<dyn RevisionStore>>,
    follow_up_limit: u32,
}

impl TetherBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            connectivity: Arc::new(AlwaysOnline),
            classifier: Arc::new(PassThrough),
            device_id: None,
            revision_store: None,
            follow_up_limit: DEFAULT_FOLLOW_UP_LIMIT,
        }
    }

    /// Share an existing registry instead of creating a fresh one.
    pub fn with_registry(mut self, registry: Arc<KeyedStateRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn with_revision_store(mut self, store: Arc<dyn RevisionStore>) -> Self {
        self.revision_store = Some(store);
        self
    }

    pub fn with_follow_up_limit(mut self, limit: u32) -> Self {
        self.follow_up_limit = limit;
        self
    }

    pub fn build(self) -> Tether {
        let registry = self.registry.unwrap_or_else(KeyedStateRegistry::shared);
        let device_id = self.device_id.unwrap_or_else(DeviceId::random);
        let pipeline = Arc::new(
            ActionPipeline::new(registry)
                .with_connectivity(self.connectivity)
                .with_classifier(self.classifier),
        );

        let mut pushes = PushSyncCoordinator::new(pipeline.clone(), device_id)
            .with_follow_up_limit(self.follow_up_limit);
        if let Some(store) = self.revision_store {
            pushes = pushes.with_store(store);
        }

        info!(%device_id, follow_up_limit = self.follow_up_limit, "tether ready");

        Tether {
            commands: OptimisticCommandCoordinator::new(pipeline.clone()),
            syncs: OptimisticSyncCoordinator::new(pipeline.clone())
                .with_follow_up_limit(self.follow_up_limit),
            pushes,
            pipeline,
        }
    }
}

impl Default for TetherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
