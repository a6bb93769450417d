//! Failure signals, caller-facing errors and configuration errors.
//!
//! Two layers, mirroring the two sides of an action:
//!
//! - [`Failure`] is what an action (or a `before` hook) returns. It makes the
//!   control flow explicit: [`Failure::Abort`] stops silently,
//!   [`Failure::Retriable`] goes through the retry loop, [`Failure::Fatal`]
//!   skips it. Any `E: Into<anyhow::Error>` converts into `Retriable`, so `?`
//!   works inside actions.
//! - [`ActionError`] is what the caller of the pipeline receives after retry
//!   exhaustion and classification.
//!
//! # Example
//!
//! ```ignore
//! use tether::{Failure, UserFacingError};
//!
//! async fn save(ctx: ActionContext) -> Result<Profile, Failure> {
//!     if ctx.attempt() > 0 && !still_wanted() {
//!         return Err(Failure::Abort);
//!     }
//!     let profile = api.save().await?; // Retriable on error
//!     if profile.is_locked() {
//!         return Err(Failure::fatal(UserFacingError::new("Profile is locked")));
//!     }
//!     Ok(profile)
//! }
//! ```

use std::fmt;

use thiserror::Error;

use crate::key::ActionKey;

// =============================================================================
// Failure (action side)
// =============================================================================

/// Outcome of a failed action attempt.
#[derive(Debug)]
pub enum Failure {
    /// Stop now, silently. Never retried, never classified.
    Abort,
    /// An ordinary failure; subject to the retry policy.
    Retriable(anyhow::Error),
    /// A failure that must not be retried.
    Fatal(anyhow::Error),
}

impl Failure {
    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        Failure::Fatal(error.into())
    }

    pub fn retriable(error: impl Into<anyhow::Error>) -> Self {
        Failure::Retriable(error.into())
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Failure::Abort)
    }
}

impl<E> From<E> for Failure
where
    E: Into<anyhow::Error>,
{
    fn from(error: E) -> Self {
        Failure::Retriable(error.into())
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Abort => write!(f, "aborted"),
            Failure::Retriable(e) => write!(f, "{e}"),
            Failure::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}

// =============================================================================
// User-facing errors
// =============================================================================

/// An error meant to be shown to the user.
///
/// The presentation itself (dialog, toast, translation) belongs to the host
/// UI. When `show_dialog` is set, the pipeline queues the error on the
/// registry for the UI to drain with
/// [`KeyedStateRegistry::take_user_errors`](crate::KeyedStateRegistry::take_user_errors).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct UserFacingError {
    pub message: String,
    pub reason: Option<String>,
    pub show_dialog: bool,
}

impl UserFacingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reason: None,
            show_dialog: true,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Record the error against the key without queueing it for a dialog.
    pub fn silent(mut self) -> Self {
        self.show_dialog = false;
        self
    }

    /// The distinguished "no connectivity" error.
    pub fn offline() -> Self {
        Self::new("There is no Internet connection")
            .with_reason("Please, verify your connection.")
    }
}

// =============================================================================
// Protocol violations
// =============================================================================

/// Programmer-contract violations. Fatal, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// A push-aware sender returned without reporting the server revision.
    #[error("sender for {key} returned without reporting a server revision")]
    MissingServerRevision { key: ActionKey },

    /// A coalescing loop kept seeing new local values past its safety cap.
    #[error("follow-up loop for {key} exceeded {limit} requests")]
    FollowUpLimit { key: ActionKey, limit: u32 },
}

// =============================================================================
// Action Error (caller side)
// =============================================================================

/// Error returned to callers of the pipeline and the coordinators.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Application error, after retries were exhausted.
    #[error("action failed: {0}")]
    Failed(#[source] anyhow::Error),

    /// Non-retriable application error.
    #[error("action failed fatally: {0}")]
    Fatal(#[source] anyhow::Error),

    /// Connectivity probe failed (and kept failing through any retries).
    #[error("offline: {0}")]
    Offline(UserFacingError),

    /// A classified, user-presentable error.
    #[error(transparent)]
    UserFacing(UserFacingError),

    #[error(transparent)]
    Protocol(ProtocolViolation),
}

impl ActionError {
    /// The user-presentable view of this error, if it has one.
    ///
    /// Application errors that carry a [`UserFacingError`] anywhere in their
    /// chain are surfaced as well.
    pub fn user_facing(&self) -> Option<&UserFacingError> {
        match self {
            ActionError::Offline(e) | ActionError::UserFacing(e) => Some(e),
            ActionError::Failed(e) | ActionError::Fatal(e) => e.downcast_ref::<UserFacingError>(),
            ActionError::Protocol(_) => None,
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, ActionError::Offline(_))
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ActionError::Failed(_) => ErrorCategory::Application,
            ActionError::Fatal(_) => ErrorCategory::Fatal,
            ActionError::Offline(_) => ErrorCategory::Connectivity,
            ActionError::UserFacing(_) => ErrorCategory::UserFacing,
            ActionError::Protocol(_) => ErrorCategory::Protocol,
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, ActionError::Protocol(_))
    }
}

impl From<ProtocolViolation> for ActionError {
    fn from(violation: ProtocolViolation) -> Self {
        ActionError::Protocol(violation)
    }
}

impl From<UserFacingError> for ActionError {
    fn from(error: UserFacingError) -> Self {
        ActionError::UserFacing(error)
    }
}

/// Coarse category of an [`ActionError`], safe to log or report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Application,
    Fatal,
    Connectivity,
    UserFacing,
    Protocol,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Application => write!(f, "application_error"),
            ErrorCategory::Fatal => write!(f, "fatal_error"),
            ErrorCategory::Connectivity => write!(f, "offline"),
            ErrorCategory::UserFacing => write!(f, "user_facing"),
            ErrorCategory::Protocol => write!(f, "protocol_violation"),
        }
    }
}

// =============================================================================
// Configuration errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("retry multiplier must be at least 2, got {0}")]
    InvalidMultiplier(f64),

    #[error("retry initial delay must be greater than zero")]
    ZeroInitialDelay,

    #[error("max_delay ({max_ms}ms) is shorter than initial_delay ({initial_ms}ms)")]
    MaxDelayBelowInitial { initial_ms: u128, max_ms: u128 },

    #[error("max_queue_size must be greater than zero")]
    ZeroQueueSize,

    #[error("invalid feature configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_mark_yields_retriable() {
        fn fails() -> Result<(), Failure> {
            let _n: u32 = "nope".parse()?;
            Ok(())
        }
        assert!(matches!(fails(), Err(Failure::Retriable(_))));
    }

    #[test]
    fn test_user_facing_found_in_anyhow_chain() {
        let err = ActionError::Fatal(UserFacingError::new("Profile is locked").into());
        assert_eq!(err.user_facing().unwrap().message, "Profile is locked");

        let plain = ActionError::Failed(anyhow::anyhow!("boom"));
        assert!(plain.user_facing().is_none());
    }

    #[test]
    fn test_offline_is_user_facing() {
        let err = ActionError::Offline(UserFacingError::offline());
        assert!(err.is_offline());
        assert!(err.user_facing().unwrap().show_dialog);
        assert!(err.to_string().contains("no Internet"));
    }

    #[test]
    fn test_protocol_violation_display() {
        let err: ActionError = ProtocolViolation::MissingServerRevision {
            key: ActionKey::name("like"),
        }
        .into();
        assert!(err.is_protocol_violation());
        assert!(err.to_string().contains("server revision"));
    }

    #[test]
    fn test_category_display() {
        let err = ActionError::Failed(anyhow::anyhow!("boom"));
        assert_eq!(err.category(), ErrorCategory::Application);
        assert_eq!(
            ActionError::from(ProtocolViolation::MissingServerRevision {
                key: ActionKey::name("k")
            })
            .category()
            .to_string(),
            "protocol_violation"
        );
    }

    #[test]
    fn test_silent_user_error_has_no_dialog() {
        let err = UserFacingError::new("Name taken").silent();
        assert!(!err.show_dialog);
    }
}
