//! Coalescing optimistic sync for high-frequency toggles.
//!
//! Every [`OptimisticSyncCoordinator::run`] applies its value locally right
//! away. Only the caller that finds the key quiescent sends; everyone else
//! returns [`SkipReason::Coalesced`] and leaves the send to it. After each
//! response the sender compares the live value with what it sent and sends
//! once more if they differ, so M rapid taps during one request cost at most
//! two requests, the last one carrying the final value.
//!
//! ```text
//! tap ─► apply ─► send(true) ─────────► resp ─► live == sent? ── no ─► send(false) ─► resp ─► stable
//! tap ─► apply ─► Coalesced        ▲                                                            │
//! tap ─► apply ─► Coalesced ───────┘ (live value changes)                       apply_response, on_finish
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{Features, DEFAULT_FOLLOW_UP_LIMIT};
use crate::error::{ActionError, Failure, ProtocolViolation};
use crate::key::ActionKey;
use crate::outcome::{Outcome, SkipReason};
use crate::pipeline::ActionPipeline;

#[async_trait]
pub trait OptimisticSync: Send + Sync {
    type Value: Clone + PartialEq + Send + Sync;
    type Response: Send;

    fn key(&self) -> ActionKey;

    /// The value this call wants to show.
    fn value(&self) -> Self::Value;

    fn read(&self) -> Self::Value;

    fn apply(&self, value: Self::Value);

    async fn send(&self, value: &Self::Value) -> Result<Self::Response, Failure>;

    /// Applied once the local value is stable.
    fn apply_response(&self, _response: &Self::Response) {}

    /// Called after the send lock is released. A returned value replaces the
    /// local state, e.g. to revert after an error.
    async fn on_finish(
        &self,
        _value: &Self::Value,
        _error: Option<&ActionError>,
    ) -> Option<Self::Value> {
        None
    }

    /// Features applied to each send round.
    fn features(&self) -> Features {
        Features::new()
    }
}

pub struct OptimisticSyncCoordinator {
    pipeline: Arc<ActionPipeline>,
    follow_up_limit: u32,
}

impl OptimisticSyncCoordinator {
    pub fn new(pipeline: Arc<ActionPipeline>) -> Self {
        Self {
            pipeline,
            follow_up_limit: DEFAULT_FOLLOW_UP_LIMIT,
        }
    }

    /// Cap on follow-up sends per run before it fails with
    /// [`ProtocolViolation::FollowUpLimit`].
    pub fn with_follow_up_limit(mut self, limit: u32) -> Self {
        self.follow_up_limit = limit;
        self
    }

    pub async fn run<S: OptimisticSync>(
        &self,
        sync: &S,
    ) -> Result<Outcome<S::Response>, ActionError> {
        let key = sync.key();
        let registry = self.pipeline.registry();

        sync.apply(sync.value());

        let Some(mut send_lock) = registry.try_begin_send(&key) else {
            debug!(%key, "send in flight, coalesced");
            return Ok(Outcome::Skipped(SkipReason::Coalesced));
        };

        let follow_ups = AtomicU32::new(0);
        let limit = self.follow_up_limit;
        let (key_ref, counter) = (&key, &follow_ups);

        loop {
            let result = self
                .pipeline
                .execute(key.clone(), sync.features(), move |_| {
                    send_until_stable(sync, key_ref, counter, limit)
                })
                .await;

            match result {
                Ok(Outcome::Completed((sent, response))) => {
                    if sync.read() != sent {
                        follow_ups.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                    sync.apply_response(&response);
                    drop(send_lock);
                    // A caller may have applied a value after the last
                    // comparison but before the lock was released.
                    if sync.read() != sent {
                        match registry.try_begin_send(&key) {
                            Some(lock) => {
                                send_lock = lock;
                                follow_ups.fetch_add(1, Ordering::SeqCst);
                                continue;
                            }
                            None => return Ok(Outcome::Skipped(SkipReason::Coalesced)),
                        }
                    }
                    self.finish(sync, &sent, None).await;
                    return Ok(Outcome::Completed(response));
                }
                Ok(Outcome::Skipped(reason)) => return Ok(Outcome::Skipped(reason)),
                Err(error) => {
                    drop(send_lock);
                    self.finish(sync, &sync.read(), Some(&error)).await;
                    return Err(error);
                }
            }
        }
    }

    async fn finish<S: OptimisticSync>(&self, sync: &S, value: &S::Value, error: Option<&ActionError>) {
        if let Some(replacement) = sync.on_finish(value, error).await {
            sync.apply(replacement);
        }
    }
}

async fn send_until_stable<S: OptimisticSync>(
    sync: &S,
    key: &ActionKey,
    follow_ups: &AtomicU32,
    limit: u32,
) -> Result<(S::Value, S::Response), Failure> {
    loop {
        let sent = sync.read();
        let response = sync.send(&sent).await?;
        if sync.read() == sent {
            return Ok((sent, response));
        }

        let count = follow_ups.fetch_add(1, Ordering::SeqCst) + 1;
        if count > limit {
            warn!(%key, limit, "follow-up limit exceeded");
            return Err(Failure::fatal(ProtocolViolation::FollowUpLimit {
                key: key.clone(),
                limit,
            }));
        }
        debug!(%key, follow_up = count, "value changed while sending");
    }
}
