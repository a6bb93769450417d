//! Non-error results of a coordinated call.

use std::fmt;

/// Why a call finished without running (or without producing a value).
///
/// None of these are errors: they are the expected result of a policy doing
/// its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// A newer call for the same key arrived during the debounce wait.
    Debounced,
    /// Connectivity probe failed and the call was configured to abort silently.
    Offline,
    /// The sequential queue was full.
    QueueFull,
    /// Evicted from the sequential queue by a newer call (`drop_oldest`).
    Evicted,
    /// Waited in the sequential queue longer than `queue_timeout`.
    QueueTimeout,
    /// Another non-reentrant execution for the key is active.
    AlreadyRunning,
    /// The throttle lock from a previous call's start is still valid.
    Throttled,
    /// The freshness window from a previous success is still valid.
    Fresh,
    /// The action or its `before` hook returned [`Failure::Abort`](crate::Failure::Abort).
    Aborted,
    /// The error classifier suppressed the failure.
    Handled,
    /// The value was applied locally and folded into the request already in flight.
    Coalesced,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::Debounced => "debounced",
            SkipReason::Offline => "offline",
            SkipReason::QueueFull => "queue_full",
            SkipReason::Evicted => "evicted",
            SkipReason::QueueTimeout => "queue_timeout",
            SkipReason::AlreadyRunning => "already_running",
            SkipReason::Throttled => "throttled",
            SkipReason::Fresh => "fresh",
            SkipReason::Aborted => "aborted",
            SkipReason::Handled => "handled",
            SkipReason::Coalesced => "coalesced",
        };
        write!(f, "{s}")
    }
}

/// Result of a call that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T> {
    Completed(T),
    Skipped(SkipReason),
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Outcome::Completed(_) => None,
            Outcome::Skipped(reason) => Some(*reason),
        }
    }

    /// The value, or `None` for a skipped call.
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Skipped(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Skipped(reason) => Outcome::Skipped(reason),
        }
    }
}
