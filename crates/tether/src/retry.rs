//! Retry with exponential backoff.
//!
//! [`RetryExecutor`] runs one action until it succeeds, aborts, fails
//! fatally, or exhausts its [`RetryPolicy`]. Without a policy it makes a
//! single attempt, which is how the pipeline runs un-retried actions.
//!
//! When a [`ConnectivityCheck`] is fused in, the probe runs before every
//! attempt. An offline probe counts as a retriable failure whose delay is
//! capped at `max_retry_delay_when_offline` so reconnection is noticed
//! quickly; it only becomes [`RetryError::Offline`] once retries run out.
//!
//! Panics inside the action are caught and reported as fatal failures, so
//! callers always get to run their cleanup.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{error, warn};

use crate::config::{ConnectivityCheck, RetryPolicy};
use crate::connectivity::Connectivity;
use crate::error::{Failure, UserFacingError};
use crate::hooks::{ActionContext, ActionHooks, NoHooks};

/// Terminal result of a retried action.
#[derive(Debug)]
pub enum RetryError {
    /// The action returned [`Failure::Abort`].
    Aborted,
    /// Retriable failure that outlasted the policy.
    Exhausted(anyhow::Error),
    /// Non-retriable failure (including a caught panic).
    Fatal(anyhow::Error),
    /// The fused connectivity probe kept failing.
    Offline,
}

enum Trigger {
    Offline,
    Error(anyhow::Error),
}

pub struct RetryExecutor<'a> {
    policy: Option<&'a RetryPolicy>,
    connectivity: Option<(&'a dyn Connectivity, &'a ConnectivityCheck)>,
    hooks: &'a dyn ActionHooks,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(policy: Option<&'a RetryPolicy>) -> Self {
        Self {
            policy,
            connectivity: None,
            hooks: &NoHooks,
        }
    }

    /// Probe connectivity before every attempt.
    pub fn with_connectivity(
        mut self,
        probe: &'a dyn Connectivity,
        check: &'a ConnectivityCheck,
    ) -> Self {
        self.connectivity = Some((probe, check));
        self
    }

    pub fn with_hooks(mut self, hooks: &'a dyn ActionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub async fn run<T, F, Fut>(&self, ctx: &ActionContext, mut action: F) -> Result<T, RetryError>
    where
        F: FnMut(ActionContext) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let key = ctx.key();
        let mut retries: u32 = 0;

        loop {
            let trigger = if self.probe().await {
                match run_caught(action(ctx.with_attempt(retries))).await {
                    Ok(value) => return Ok(value),
                    Err(Failure::Abort) => return Err(RetryError::Aborted),
                    Err(Failure::Fatal(e)) => return Err(RetryError::Fatal(e)),
                    Err(Failure::Retriable(e)) => Trigger::Error(e),
                }
            } else {
                Trigger::Offline
            };

            let policy = match self.policy {
                Some(policy) if policy.allows(retries) => policy,
                _ => {
                    return Err(match trigger {
                        Trigger::Offline => RetryError::Offline,
                        Trigger::Error(e) => RetryError::Exhausted(e),
                    })
                }
            };

            retries += 1;
            let mut delay = policy.delay_for(retries);
            let error = match trigger {
                Trigger::Offline => {
                    if let Some((_, check)) = self.connectivity {
                        delay = delay.min(check.max_retry_delay_when_offline);
                    }
                    anyhow::Error::new(UserFacingError::offline())
                }
                Trigger::Error(e) => e,
            };

            warn!(%key, attempt = retries, ?delay, error = %error, "retrying action");
            self.hooks.on_retry(key, retries, delay, &error);
            tokio::time::sleep(delay).await;
        }
    }

    async fn probe(&self) -> bool {
        match self.connectivity {
            Some((probe, _)) => probe.is_online().await,
            None => true,
        }
    }
}

/// Await an action future, turning a panic into a fatal failure.
pub(crate) async fn run_caught<T, Fut>(fut: Fut) -> Result<T, Failure>
where
    Fut: Future<Output = Result<T, Failure>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = extract_panic_message(&panic);
            error!(panic = %message, "action panicked");
            Err(Failure::Fatal(anyhow::anyhow!("action panicked: {message}")))
        }
    }
}

fn extract_panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Features;
    use crate::key::ActionKey;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn ctx() -> ActionContext {
        ActionContext::new(ActionKey::name("retry"), Arc::new(Features::new()))
    }

    #[derive(Default)]
    struct RecordingHooks {
        retries: Mutex<Vec<(u32, Duration)>>,
    }

    #[async_trait]
    impl ActionHooks for RecordingHooks {
        fn on_retry(&self, _key: &ActionKey, attempt: u32, delay: Duration, _error: &anyhow::Error) {
            self.retries.lock().unwrap().push((attempt, delay));
        }
    }

    struct Flaky {
        online: AtomicBool,
    }

    #[async_trait]
    impl Connectivity for Flaky {
        async fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures_with_backoff() {
        let policy = RetryPolicy::default().max_retries(5);
        let hooks = RecordingHooks::default();
        let calls = AtomicU32::new(0);

        let result = RetryExecutor::new(Some(&policy))
            .with_hooks(&hooks)
            .run(&ctx(), |ctx| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(ctx.attempt(), n);
                async move {
                    if n < 4 {
                        Err(Failure::retriable(anyhow::anyhow!("flaky")))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 4);
        let recorded = hooks.retries.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![
                (1, Duration::from_millis(350)),
                (2, Duration::from_millis(700)),
                (3, Duration::from_millis(1400)),
                (4, Duration::from_millis(2800)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy::default().max_retries(2);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = RetryExecutor::new(Some(&policy))
            .run(&ctx(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::retriable(anyhow::anyhow!("down"))) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted(e)) if e.to_string() == "down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_and_fatal_are_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let aborted: Result<(), _> = RetryExecutor::new(Some(&policy))
            .run(&ctx(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::Abort) }
            })
            .await;
        assert!(matches!(aborted, Err(RetryError::Aborted)));

        let fatal: Result<(), _> = RetryExecutor::new(Some(&policy))
            .run(&ctx(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::fatal(anyhow::anyhow!("bad request"))) }
            })
            .await;
        assert!(matches!(fatal, Err(RetryError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_without_policy_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryExecutor::new(None)
            .run(&ctx(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::retriable(anyhow::anyhow!("once"))) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_fatal() {
        let result: Result<(), _> = RetryExecutor::new(Some(&RetryPolicy::default()))
            .run(&ctx(), |_| async {
                let missing: Option<()> = None;
                missing.expect("kaboom");
                Ok::<(), Failure>(())
            })
            .await;
        assert!(matches!(result, Err(RetryError::Fatal(e)) if e.to_string().contains("kaboom")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_uses_short_delay_and_exhausts_to_offline() {
        let policy = RetryPolicy::default().max_retries(3);
        let check = ConnectivityCheck::default().max_retry_delay_when_offline(Duration::from_millis(500));
        let probe = Flaky {
            online: AtomicBool::new(false),
        };
        let hooks = RecordingHooks::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = RetryExecutor::new(Some(&policy))
            .with_connectivity(&probe, &check)
            .with_hooks(&hooks)
            .run(&ctx(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Offline)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let delays: Vec<u64> = hooks
            .retries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, d)| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![350, 500, 500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_during_retries_runs_action() {
        let policy = RetryPolicy::default().max_retries(5);
        let check = ConnectivityCheck::default();
        let probe = Arc::new(Flaky {
            online: AtomicBool::new(false),
        });

        let p = probe.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            p.online.store(true, Ordering::SeqCst);
        });

        let result = RetryExecutor::new(Some(&policy))
            .with_connectivity(probe.as_ref(), &check)
            .run(&ctx(), |ctx| async move { Ok::<_, Failure>(ctx.attempt()) })
            .await;

        // Offline at 0ms, 350ms, 1050ms (capped at 1s); online by 2050ms.
        assert_eq!(result.unwrap(), 3);
    }
}
