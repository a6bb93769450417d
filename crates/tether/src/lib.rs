//! # Tether
//!
//! Keyed coordination for side-effecting client actions, and optimistic
//! state that stays consistent with the server.
//!
//! ## Core Concepts
//!
//! Every action is identified by an [`ActionKey`]. Calls with equal keys
//! interact; calls with different keys never do. A [`Features`] set says how
//! calls for a key are coordinated:
//!
//! - **non-reentrant**: a second call while one runs is dropped
//! - **sequential**: calls run one at a time, in submission order
//! - **throttle / debounce / freshness**: rate and staleness control
//! - **retry**: exponential backoff, optionally fused with a connectivity probe
//!
//! A call that a gate turns away is not an error. It returns
//! [`Outcome::Skipped`] with the [`SkipReason`].
//!
//! ## Architecture
//!
//! ```text
//!                    Tether (builder-wired, Arc-shared)
//!                         │
//!         ┌───────────────┼─────────────────┬──────────────────┐
//!         ▼               ▼                 ▼                  ▼
//!   ActionPipeline   CommandCoordinator  SyncCoordinator   PushSyncCoordinator
//!         │               │                 │                  │
//!         │               └───────┬─────────┴──────────────────┘
//!         │                       │  run their sends through
//!         │◄──────────────────────┘
//!         │
//!         ├─► debounce ─► connectivity ─► queue ─► exclusion ─► throttle ─► freshness
//!         │
//!         ├─► before ─► RetryExecutor(action) ─► after ─► classify
//!         │
//!         ▼
//!   KeyedStateRegistry  (locks, queues, expiries, revisions, failures)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **At most one gated execution per key** for non-reentrant and sequential calls
//! 2. **FIFO per key** for sequential calls, except evicted waiters, which never run
//! 3. **`server_revision` never decreases**
//! 4. **One outstanding request per key** for each sync coordinator
//! 5. **Cleanup always runs**, including when the caller's future is dropped
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tether::{Failure, Features, RetryPolicy, Tether};
//!
//! let tether = Tether::builder()
//!     .with_connectivity(Arc::new(NetworkProbe::new()))
//!     .build();
//!
//! let outcome = tether
//!     .execute(
//!         ("load_profile", user_id),
//!         Features::new()
//!             .non_reentrant()
//!             .freshness(Duration::from_secs(30))
//!             .retry(RetryPolicy::default()),
//!         |_ctx| async { Ok::<_, Failure>(api.load_profile(user_id).await?) },
//!     )
//!     .await?;
//!
//! if let Some(profile) = outcome.completed() {
//!     store.set_profile(profile);
//! }
//! ```
//!
//! ## What This Is Not
//!
//! Tether is **not**:
//! - A pub/sub system
//! - A cache (it tracks freshness, not payloads)
//! - A network client
//!
//! The transport, the connectivity probe and the UI belong to the host.

// Core modules
mod config;
mod connectivity;
mod error;
mod hooks;
mod key;
mod outcome;
mod queue;
mod registry;
mod retry;

// Pipeline and coordinators
mod command;
mod pipeline;
mod push;
mod sync;
mod tether;


// Re-export configuration
pub use crate::config::{
    ConnectivityCheck, Debounce, Features, Freshness, NonReentrant, RetryPolicy, Sequential,
    Throttle, DEFAULT_FOLLOW_UP_LIMIT, DEFAULT_OFFLINE_RETRY_DELAY,
};

// Re-export error types
pub use crate::error::{
    ActionError, ConfigError, ErrorCategory, Failure, ProtocolViolation, UserFacingError,
};

// Re-export keys, outcomes and hooks
pub use crate::connectivity::{AlwaysOnline, Connectivity};
pub use crate::hooks::{
    ActionContext, ActionHooks, Disposition, ErrorClassifier, NoHooks, PassThrough,
};
pub use crate::key::{ActionKey, KeyPart};
pub use crate::outcome::{Outcome, SkipReason};

// Re-export registry and execution
pub use crate::pipeline::ActionPipeline;
pub use crate::registry::{FailureRecord, KeyedStateRegistry, RevisionEntry};
pub use crate::retry::{RetryError, RetryExecutor};

// Re-export coordinators
pub use crate::command::{OptimisticCommand, OptimisticCommandCoordinator, ReloadPolicy};
pub use crate::push::{
    DeviceId, PushDisposition, PushRequest, PushSync, PushSyncCoordinator, PushTarget, PushUpdate,
    RevisionAck, RevisionStore,
};
pub use crate::sync::{OptimisticSync, OptimisticSyncCoordinator};
pub use crate::tether::{Tether, TetherBuilder};

// Re-export async_trait for implementing the hook and coordinator traits
pub use async_trait::async_trait;
