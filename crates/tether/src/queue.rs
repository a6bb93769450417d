//! Per-key FIFO ordering.
//!
//! Each key has at most one turn holder. Later callers line up as waiters and
//! are woken strictly in arrival order when the holder's [`QueueTurn`] drops.
//!
//! ```text
//!   acquire(k) ──► holder free & no waiters ──► QueueTurn (runs now)
//!        │
//!        └──► push waiter ──► wait ──► Wake::Turn    ──► QueueTurn
//!                                 └──► Wake::Evicted ──► SkipReason::Evicted
//!
//!   QueueTurn::drop ──► pop front waiter ──► Wake::Turn
//!                  └──► no waiters      ──► remove key
//! ```
//!
//! With a `max_queue_size`, a full queue either drops the newcomer
//! ([`SkipReason::QueueFull`]) or, with `drop_oldest`, evicts the oldest
//! waiter so the newcomer can be admitted. The evicted caller is woken
//! immediately with [`SkipReason::Evicted`].

use dashmap::DashMap;
use smallvec::SmallVec;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::Sequential;
use crate::key::ActionKey;
use crate::outcome::SkipReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Turn,
    Evicted,
}

struct Waiter {
    id: Uuid,
    wake: oneshot::Sender<Wake>,
}

#[derive(Default)]
struct QueueState {
    held: bool,
    waiters: SmallVec<[Waiter; 4]>,
}

/// All per-key FIFO queues.
#[derive(Default)]
pub struct SequentialQueue {
    queues: DashMap<ActionKey, QueueState>,
}

impl SequentialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for this caller's turn on `key`.
    ///
    /// Returns a [`QueueTurn`] that releases the next waiter when dropped, or
    /// the reason the caller will never run.
    pub async fn acquire(
        &self,
        key: &ActionKey,
        config: &Sequential,
    ) -> Result<QueueTurn<'_>, SkipReason> {
        let enqueued_at = Instant::now();
        let (id, rx) = {
            let mut state = self.queues.entry(key.clone()).or_default();
            if !state.held && state.waiters.is_empty() {
                state.held = true;
                return Ok(QueueTurn::new(self, key.clone()));
            }

            // Waiters whose callers went away don't count against capacity.
            state.waiters.retain(|w| !w.wake.is_closed());

            if let Some(max) = config.max_queue_size {
                if state.waiters.len() >= max {
                    // With nothing to evict (max of zero) the newcomer is the one dropped.
                    if !config.drop_oldest || state.waiters.is_empty() {
                        debug!(%key, max, "queue full, dropping call");
                        return Err(SkipReason::QueueFull);
                    }
                    let oldest = state.waiters.remove(0);
                    debug!(%key, evicted = %oldest.id, "queue full, evicting oldest waiter");
                    let _ = oldest.wake.send(Wake::Evicted);
                }
            }

            let id = Uuid::new_v4();
            let (tx, rx) = oneshot::channel();
            state.waiters.push(Waiter { id, wake: tx });
            trace!(%key, waiter = %id, position = state.waiters.len(), "queued");
            (id, rx)
        };

        let mut pending = PendingWaiter {
            queue: self,
            key,
            rx: Some(rx),
        };
        let woken = match pending.rx.as_mut() {
            Some(rx) => rx.await,
            None => return Err(SkipReason::Evicted),
        };
        pending.rx = None;

        match woken {
            Ok(Wake::Turn) => {
                let turn = QueueTurn::new(self, key.clone());
                if let Some(timeout) = config.queue_timeout {
                    let waited = enqueued_at.elapsed();
                    if waited > timeout {
                        debug!(%key, waiter = %id, ?waited, "queue wait timed out");
                        // Dropping the turn hands it to the next waiter.
                        return Err(SkipReason::QueueTimeout);
                    }
                }
                trace!(%key, waiter = %id, "turn acquired");
                Ok(turn)
            }
            // A closed channel means the queue was reset under us.
            Ok(Wake::Evicted) | Err(_) => Err(SkipReason::Evicted),
        }
    }

    /// Number of callers waiting (not running) on `key`.
    pub fn waiting(&self, key: &ActionKey) -> usize {
        self.queues
            .get(key)
            .map(|state| state.waiters.iter().filter(|w| !w.wake.is_closed()).count())
            .unwrap_or(0)
    }

    /// Whether a turn is currently held on `key`.
    pub fn is_held(&self, key: &ActionKey) -> bool {
        self.queues.get(key).map(|state| state.held).unwrap_or(false)
    }

    pub fn clear(&self) {
        self.queues.clear();
    }

    fn release(&self, key: &ActionKey) {
        let mut remove = false;
        if let Some(mut state) = self.queues.get_mut(key) {
            loop {
                if state.waiters.is_empty() {
                    state.held = false;
                    remove = true;
                    break;
                }
                let next = state.waiters.remove(0);
                if next.wake.send(Wake::Turn).is_ok() {
                    trace!(%key, waiter = %next.id, "handing over turn");
                    break;
                }
            }
        }
        if remove {
            self.queues
                .remove_if(key, |_, state| !state.held && state.waiters.is_empty());
        }
    }
}

/// Held while a sequential call runs. Dropping it wakes the next waiter.
pub struct QueueTurn<'a> {
    queue: &'a SequentialQueue,
    key: ActionKey,
}

impl<'a> QueueTurn<'a> {
    fn new(queue: &'a SequentialQueue, key: ActionKey) -> Self {
        Self { queue, key }
    }
}

impl Drop for QueueTurn<'_> {
    fn drop(&mut self) {
        self.queue.release(&self.key);
    }
}

/// Releases a turn that was handed over after the waiting caller was
/// cancelled but before it observed the wake-up.
struct PendingWaiter<'a> {
    queue: &'a SequentialQueue,
    key: &'a ActionKey,
    rx: Option<oneshot::Receiver<Wake>>,
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if let Ok(Wake::Turn) = rx.try_recv() {
                self.queue.release(self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn key() -> ActionKey {
        ActionKey::name("queue")
    }

    #[tokio::test]
    async fn test_first_caller_runs_immediately() {
        let queue = SequentialQueue::new();
        let turn = queue.acquire(&key(), &Sequential::new()).await.unwrap();
        assert!(queue.is_held(&key()));
        drop(turn);
        assert!(!queue.is_held(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order() {
        let queue = Arc::new(SequentialQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = queue.acquire(&key(), &Sequential::new()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _turn = queue.acquire(&key(), &Sequential::new()).await.unwrap();
                order.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
            // Let each task enqueue before spawning the next.
            tokio::task::yield_now().await;
        }

        assert_eq!(queue.waiting(&key()), 5);
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(!queue.is_held(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_newcomer() {
        let queue = Arc::new(SequentialQueue::new());
        let config = Sequential::new().max_queue_size(1);
        let _held = queue.acquire(&key(), &config).await.unwrap();

        let q = queue.clone();
        let c = config.clone();
        let waiter = tokio::spawn(async move { q.acquire(&key(), &c).await.is_ok() });
        tokio::task::yield_now().await;

        let rejected = queue.acquire(&key(), &config).await;
        assert!(matches!(rejected, Err(SkipReason::QueueFull)));
        drop(_held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_oldest_evicts_waiter() {
        let queue = Arc::new(SequentialQueue::new());
        let config = Sequential::new().max_queue_size(1).drop_oldest();
        let held = queue.acquire(&key(), &config).await.unwrap();

        let q = queue.clone();
        let c = config.clone();
        let oldest = tokio::spawn(async move { q.acquire(&key(), &c).await.map(|_| ()) });
        tokio::task::yield_now().await;

        let q = queue.clone();
        let c = config.clone();
        let newest = tokio::spawn(async move { q.acquire(&key(), &c).await.map(|_| ()) });
        tokio::task::yield_now().await;

        assert_eq!(oldest.await.unwrap(), Err(SkipReason::Evicted));
        drop(held);
        assert_eq!(newest.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_oldest_with_zero_capacity_drops_newcomer() {
        let queue = SequentialQueue::new();
        let config = Sequential::new().max_queue_size(0).drop_oldest();
        let held = queue.acquire(&key(), &config).await.unwrap();

        let rejected = queue.acquire(&key(), &config).await;
        assert!(matches!(rejected, Err(SkipReason::QueueFull)));
        assert_eq!(queue.waiting(&key()), 0);

        drop(held);
        assert!(queue.acquire(&key(), &config).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_skips_and_passes_turn_on() {
        let queue = Arc::new(SequentialQueue::new());
        let timed = Sequential::new().queue_timeout(Duration::from_millis(100));
        let held = queue.acquire(&key(), &Sequential::new()).await.unwrap();

        let q = queue.clone();
        let c = timed.clone();
        let impatient = tokio::spawn(async move { q.acquire(&key(), &c).await.map(|_| ()) });
        tokio::task::yield_now().await;

        let q = queue.clone();
        let patient =
            tokio::spawn(async move { q.acquire(&key(), &Sequential::new()).await.map(|_| ()) });
        tokio::task::yield_now().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(held);

        assert_eq!(impatient.await.unwrap(), Err(SkipReason::QueueTimeout));
        assert_eq!(patient.await.unwrap(), Ok(()));
        assert!(!queue.is_held(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_wedge_queue() {
        let queue = Arc::new(SequentialQueue::new());
        let held = queue.acquire(&key(), &Sequential::new()).await.unwrap();

        let q = queue.clone();
        let cancelled =
            tokio::spawn(async move { q.acquire(&key(), &Sequential::new()).await.map(|_| ()) });
        tokio::task::yield_now().await;
        cancelled.abort();
        let _ = cancelled.await;

        drop(held);
        let again = queue.acquire(&key(), &Sequential::new()).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let queue = SequentialQueue::new();
        let _a = queue.acquire(&ActionKey::name("a"), &Sequential::new()).await.unwrap();
        let b = queue.acquire(&ActionKey::name("b"), &Sequential::new()).await;
        assert!(b.is_ok());
    }
}
