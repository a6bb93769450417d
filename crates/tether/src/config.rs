//! Feature configuration.
//!
//! A [`Features`] set is the per-call policy handed to the pipeline. Every
//! feature is optional and independently composable. Features can be built
//! fluently or loaded from JSON (durations are expressed in milliseconds):
//!
//! ```ignore
//! let features = Features::new()
//!     .non_reentrant()
//!     .retry(RetryPolicy::default().max_retries(5))
//!     .freshness(Duration::from_secs(30));
//!
//! let features = Features::from_json(r#"{
//!     "retry": { "max_retries": 5, "initial_delay_ms": 350, "multiplier": 2.0, "max_delay_ms": 5000 },
//!     "freshness": { "duration_ms": 30000 }
//! }"#)?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::key::ActionKey;

/// Default safety cap on follow-up requests in the coalescing coordinators.
pub const DEFAULT_FOLLOW_UP_LIMIT: u32 = 32;

/// Default delay cap while retrying because the device is offline.
pub const DEFAULT_OFFLINE_RETRY_DELAY: Duration = Duration::from_secs(1);

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&(d.as_millis() as u64)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Exponential backoff policy.
///
/// Delay for retry `n` (1-indexed) is
/// `min(initial_delay * multiplier^(n-1), max_delay)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `None` retries forever.
    #[serde(default = "RetryPolicy::default_max_retries")]
    pub max_retries: Option<u32>,
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    pub multiplier: f64,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            initial_delay: Duration::from_millis(350),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn default_max_retries() -> Option<u32> {
        Some(3)
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn unlimited(mut self) -> Self {
        self.max_retries = None;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry `retry` (1-indexed).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            self.max_delay
        } else {
            Duration::from_millis(millis.round() as u64)
        }
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn allows(&self, retries_done: u32) -> bool {
        self.max_retries.map_or(true, |max| retries_done < max)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier.is_nan() || self.multiplier < 2.0 {
            return Err(ConfigError::InvalidMultiplier(self.multiplier));
        }
        if self.initial_delay.is_zero() {
            return Err(ConfigError::ZeroInitialDelay);
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::MaxDelayBelowInitial {
                initial_ms: self.initial_delay.as_millis(),
                max_ms: self.max_delay.as_millis(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Gates
// =============================================================================

/// Rate limit measured from each call's start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Throttle {
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    /// Run even when locked (the lock is still refreshed).
    #[serde(default)]
    pub ignore_lock: bool,
    /// Drop the lock when the call fails, so it can be retried at once.
    #[serde(default)]
    pub remove_lock_on_error: bool,
}

impl Throttle {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            ignore_lock: false,
            remove_lock_on_error: false,
        }
    }

    pub fn ignore_lock(mut self) -> Self {
        self.ignore_lock = true;
        self
    }

    pub fn remove_lock_on_error(mut self) -> Self {
        self.remove_lock_on_error = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Debounce {
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
}

/// Freshness window measured from each call's successful completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Freshness {
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    /// Run even when fresh (the window is still renewed).
    #[serde(default)]
    pub ignore_freshness: bool,
}

impl Freshness {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            ignore_freshness: false,
        }
    }

    pub fn ignore_freshness(mut self) -> Self {
        self.ignore_freshness = true;
        self
    }
}

/// Per-key FIFO ordering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequential {
    /// Queue under this key instead of the action key.
    #[serde(default)]
    pub key: Option<ActionKey>,
    /// Maximum number of waiting (not running) calls.
    #[serde(default)]
    pub max_queue_size: Option<usize>,
    #[serde(default, rename = "queue_timeout_ms", with = "millis::option")]
    pub queue_timeout: Option<Duration>,
    /// When full, evict the oldest waiter instead of dropping the newcomer.
    #[serde(default)]
    pub drop_oldest: bool,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<ActionKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    pub fn drop_oldest(mut self) -> Self {
        self.drop_oldest = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NonReentrant {
    /// Exclude under this key instead of the action key.
    #[serde(default)]
    pub key: Option<ActionKey>,
}

/// Connectivity gate. Fused into the retry loop when retry is also enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityCheck {
    /// Skip silently instead of failing with the offline error.
    #[serde(default)]
    pub abort_silently: bool,
    /// Queue the offline error for a dialog.
    #[serde(default = "default_true")]
    pub opens_dialog: bool,
    #[serde(
        default = "default_offline_delay",
        rename = "max_retry_delay_when_offline_ms",
        with = "millis"
    )]
    pub max_retry_delay_when_offline: Duration,
}

fn default_true() -> bool {
    true
}

fn default_offline_delay() -> Duration {
    DEFAULT_OFFLINE_RETRY_DELAY
}

impl Default for ConnectivityCheck {
    fn default() -> Self {
        Self {
            abort_silently: false,
            opens_dialog: true,
            max_retry_delay_when_offline: DEFAULT_OFFLINE_RETRY_DELAY,
        }
    }
}

impl ConnectivityCheck {
    pub fn abort_silently(mut self) -> Self {
        self.abort_silently = true;
        self
    }

    pub fn without_dialog(mut self) -> Self {
        self.opens_dialog = false;
        self
    }

    pub fn max_retry_delay_when_offline(mut self, delay: Duration) -> Self {
        self.max_retry_delay_when_offline = delay;
        self
    }
}

// =============================================================================
// Features
// =============================================================================

/// The full set of per-call policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub retry: Option<RetryPolicy>,
    pub throttle: Option<Throttle>,
    pub debounce: Option<Debounce>,
    pub freshness: Option<Freshness>,
    pub sequential: Option<Sequential>,
    pub non_reentrant: Option<NonReentrant>,
    pub connectivity: Option<ConnectivityCheck>,
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let features: Features = serde_json::from_str(json)?;
        features.validate()?;
        Ok(features)
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn throttle(self, duration: Duration) -> Self {
        self.throttle_with(Throttle::new(duration))
    }

    pub fn throttle_with(mut self, throttle: Throttle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn debounce(mut self, duration: Duration) -> Self {
        self.debounce = Some(Debounce { duration });
        self
    }

    pub fn freshness(self, duration: Duration) -> Self {
        self.freshness_with(Freshness::new(duration))
    }

    pub fn freshness_with(mut self, freshness: Freshness) -> Self {
        self.freshness = Some(freshness);
        self
    }

    pub fn sequential(self) -> Self {
        self.sequential_with(Sequential::new())
    }

    pub fn sequential_with(mut self, sequential: Sequential) -> Self {
        self.sequential = Some(sequential);
        self
    }

    pub fn non_reentrant(mut self) -> Self {
        self.non_reentrant = Some(NonReentrant::default());
        self
    }

    pub fn non_reentrant_on(mut self, key: impl Into<ActionKey>) -> Self {
        self.non_reentrant = Some(NonReentrant {
            key: Some(key.into()),
        });
        self
    }

    pub fn check_connectivity(self) -> Self {
        self.connectivity_with(ConnectivityCheck::default())
    }

    pub fn connectivity_with(mut self, check: ConnectivityCheck) -> Self {
        self.connectivity = Some(check);
        self
    }

    /// Connectivity is probed inside the retry loop rather than up front.
    pub fn connectivity_fused(&self) -> bool {
        self.connectivity.is_some() && self.retry.is_some()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(Sequential {
            max_queue_size: Some(0),
            ..
        }) = &self.sequential
        {
            return Err(ConfigError::ZeroQueueSize);
        }
        Ok(())
    }
}
