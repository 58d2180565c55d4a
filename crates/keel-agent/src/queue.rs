use crate::abort::AbortSignal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;

/// Queue used by tools that do not declare one.
pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("wait for queue '{0}' aborted")]
    Aborted(String),
}

/// Outcome of a successful `acquire`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueGrant {
    pub queued: bool,
    pub wait_ms: u64,
    /// Position in the waiter list at enqueue time (0 for immediate grants).
    pub depth: usize,
    pub capacity: usize,
}

struct Waiter {
    grant_tx: oneshot::Sender<()>,
    signal: AbortSignal,
}

struct QueueState {
    capacity: usize,
    in_use: usize,
    waiters: VecDeque<Waiter>,
}

impl QueueState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_use: 0,
            waiters: VecDeque::new(),
        }
    }
}

/// Bounds concurrently executing tool calls per named queue. Constructor
/// injected by whatever composes sessions; queue state is mutated only
/// through `acquire`/`release`.
///
/// Invariants: `in_use <= capacity` at every observable instant; waiters are
/// served strictly FIFO except that aborted waiters are discarded out of
/// order and never granted a slot.
pub struct ToolQueueManager {
    default_capacity: usize,
    queues: Mutex<HashMap<String, QueueState>>,
}

impl ToolQueueManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            default_capacity: default_capacity.max(1),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a slot, waiting FIFO behind earlier callers when the queue is
    /// saturated. An abort observed while waiting rejects the waiter; it is
    /// skipped at release time rather than granted.
    pub async fn acquire(
        &self,
        queue: &str,
        signal: &AbortSignal,
    ) -> Result<QueueGrant, QueueError> {
        if signal.is_aborted() {
            return Err(QueueError::Aborted(queue.to_string()));
        }

        let (mut grant_rx, depth, capacity) = {
            let mut queues = self.lock_queues();
            let state = queues
                .entry(queue.to_string())
                .or_insert_with(|| QueueState::new(self.default_capacity));
            if state.in_use < state.capacity {
                state.in_use += 1;
                return Ok(QueueGrant {
                    queued: false,
                    wait_ms: 0,
                    depth: 0,
                    capacity: state.capacity,
                });
            }
            let (grant_tx, grant_rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                grant_tx,
                signal: signal.clone(),
            });
            (grant_rx, state.waiters.len(), state.capacity)
        };

        let started = Instant::now();
        tracing::debug!(queue, depth, "tool queue saturated, waiting for slot");
        tokio::select! {
            granted = &mut grant_rx => match granted {
                Ok(()) => Ok(QueueGrant {
                    queued: true,
                    wait_ms: started.elapsed().as_millis() as u64,
                    depth,
                    capacity,
                }),
                Err(_) => Err(QueueError::Aborted(queue.to_string())),
            },
            _ = signal.aborted() => {
                // A grant can race the abort: close the channel so a later
                // send fails, then hand back any slot that already arrived.
                grant_rx.close();
                if grant_rx.try_recv().is_ok() {
                    self.release(queue);
                }
                Err(QueueError::Aborted(queue.to_string()))
            }
        }
    }

    /// Return a slot. The slot transfers to the oldest non-aborted waiter if
    /// one exists, otherwise the in-use count drops.
    pub fn release(&self, queue: &str) {
        let mut queues = self.lock_queues();
        let Some(state) = queues.get_mut(queue) else {
            return;
        };
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.signal.is_aborted() {
                continue;
            }
            if waiter.grant_tx.send(()).is_ok() {
                return;
            }
        }
        state.in_use = state.in_use.saturating_sub(1);
    }

    /// Reconfigure a queue's capacity. Raise-only: the requested value is
    /// clamped up to the current in-use count. Raising drains eligible
    /// waiters into the new headroom.
    pub fn configure(&self, queue: &str, capacity: usize) {
        let mut queues = self.lock_queues();
        let state = queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState::new(self.default_capacity));
        state.capacity = capacity.max(state.in_use).max(1);
        while state.in_use < state.capacity {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.signal.is_aborted() {
                continue;
            }
            if waiter.grant_tx.send(()).is_ok() {
                state.in_use += 1;
            }
        }
    }

    pub fn in_use(&self, queue: &str) -> usize {
        self.lock_queues()
            .get(queue)
            .map(|state| state.in_use)
            .unwrap_or(0)
    }

    pub fn capacity(&self, queue: &str) -> usize {
        self.lock_queues()
            .get(queue)
            .map(|state| state.capacity)
            .unwrap_or(self.default_capacity)
    }

    pub fn waiter_depth(&self, queue: &str) -> usize {
        self.lock_queues()
            .get(queue)
            .map(|state| state.waiters.len())
            .unwrap_or(0)
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "current_thread")]
    async fn acquire_under_capacity_grants_immediately() {
        let manager = ToolQueueManager::new(2);
        let signal = AbortSignal::new();

        let grant = manager
            .acquire("default", &signal)
            .await
            .expect("grant expected");
        assert!(!grant.queued);
        assert_eq!(grant.capacity, 2);
        assert_eq!(manager.in_use("default"), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn saturated_queue_serves_waiters_fifo() {
        let manager = Arc::new(ToolQueueManager::new(1));
        let signal = AbortSignal::new();
        manager
            .acquire("q", &signal)
            .await
            .expect("first grant expected");

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for label in ["a", "b", "c"] {
            let manager = manager.clone();
            let signal = signal.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let grant = manager.acquire("q", &signal).await.expect("grant expected");
                assert!(grant.queued);
                order.lock().expect("order mutex").push(label);
                manager.release("q");
            }));
            // let each waiter enqueue before the next
            tokio::task::yield_now().await;
        }

        manager.release("q");
        for task in tasks {
            task.await.expect("waiter task should finish");
        }
        assert_eq!(*order.lock().expect("order mutex"), vec!["a", "b", "c"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn aborted_waiter_is_skipped_and_rejected() {
        let manager = Arc::new(ToolQueueManager::new(1));
        let holder = AbortSignal::new();
        manager
            .acquire("q", &holder)
            .await
            .expect("holder grant expected");

        let doomed = AbortSignal::new();
        let doomed_task = {
            let manager = manager.clone();
            let doomed = doomed.clone();
            tokio::spawn(async move { manager.acquire("q", &doomed).await })
        };
        tokio::task::yield_now().await;

        let patient = AbortSignal::new();
        let patient_task = {
            let manager = manager.clone();
            let patient = patient.clone();
            tokio::spawn(async move { manager.acquire("q", &patient).await })
        };
        tokio::task::yield_now().await;

        doomed.abort();
        let rejected = doomed_task.await.expect("doomed task should finish");
        assert!(matches!(rejected, Err(QueueError::Aborted(_))));

        manager.release("q");
        let granted = patient_task
            .await
            .expect("patient task should finish")
            .expect("patient waiter should be granted");
        assert!(granted.queued);
        assert_eq!(manager.in_use("q"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_use_never_exceeds_capacity_under_load() {
        let manager = Arc::new(ToolQueueManager::new(3));
        let signal = AbortSignal::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let manager = manager.clone();
            let signal = signal.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _grant = manager.acquire("load", &signal).await.expect("grant");
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                manager.release("load");
            }));
        }
        for task in tasks {
            task.await.expect("load task should finish");
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(manager.in_use("load"), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn abort_racing_a_grant_returns_the_slot() {
        let manager = Arc::new(ToolQueueManager::new(1));
        for round in 0..64 {
            let holder = AbortSignal::new();
            manager.acquire("q", &holder).await.expect("holder grant");

            let waiter = AbortSignal::new();
            let waiter_task = {
                let manager = manager.clone();
                let waiter = waiter.clone();
                tokio::spawn(async move { manager.acquire("q", &waiter).await })
            };
            tokio::task::yield_now().await;
            assert_eq!(manager.waiter_depth("q"), 1);

            // Transfer the slot, then abort before the waiter polls again.
            manager.release("q");
            waiter.abort();

            if waiter_task.await.expect("waiter task should finish").is_ok() {
                manager.release("q");
            }
            assert_eq!(
                manager.in_use("q"),
                0,
                "round {round}: slot must come back whether the waiter \
                 accepted the grant or was rejected"
            );
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn configure_never_lowers_below_in_use_and_drains_waiters() {
        let manager = Arc::new(ToolQueueManager::new(2));
        let signal = AbortSignal::new();
        manager.acquire("q", &signal).await.expect("grant");
        manager.acquire("q", &signal).await.expect("grant");

        manager.configure("q", 1);
        assert_eq!(manager.capacity("q"), 2, "capacity clamped to in-use");

        let waiter_task = {
            let manager = manager.clone();
            let signal = signal.clone();
            tokio::spawn(async move { manager.acquire("q", &signal).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(manager.waiter_depth("q"), 1);

        manager.configure("q", 3);
        let grant = waiter_task
            .await
            .expect("waiter task should finish")
            .expect("raise should drain the waiter");
        assert!(grant.queued);
        assert_eq!(manager.in_use("q"), 3);
    }
}
