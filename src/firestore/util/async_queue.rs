use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{select, BoxFuture, Either};
use futures::FutureExt;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::platform::runtime;
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

type Task = BoxFuture<'static, ()>;
type RetryableOp = Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>;

/// Identifies the kind of a delayed operation so tests and shutdown can find
/// and accelerate or cancel it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    ListenStreamConnectionBackoff,
    WriteStreamConnectionBackoff,
    ListenStreamHealthy,
    WriteStreamHealthy,
    OnlineStateTimeout,
    AsyncQueueRetry,
}

/// Serial executor. Every task runs to completion on a single worker before
/// the next one starts, in enqueue order.
///
/// Tasks must never await another task on the same queue.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

struct AsyncQueueInner {
    sender: async_channel::Sender<Task>,
    state: Mutex<QueueState>,
    next_delayed_id: AtomicU64,
}

struct QueueState {
    shut_down: bool,
    delayed: Vec<Arc<DelayedState>>,
    retryable: VecDeque<RetryableOp>,
    retry_backoff: ExponentialBackoff,
}

impl AsyncQueue {
    pub fn new() -> Self {
        Self::with_retry_backoff(BackoffConfig::default())
    }

    pub fn with_retry_backoff(config: BackoffConfig) -> Self {
        let (sender, receiver) = async_channel::unbounded::<Task>();
        runtime::spawn_detached(async move {
            while let Ok(task) = receiver.recv().await {
                task.await;
            }
            log::debug!("async queue drained");
        });

        Self {
            inner: Arc::new(AsyncQueueInner {
                sender,
                state: Mutex::new(QueueState {
                    shut_down: false,
                    delayed: Vec::new(),
                    retryable: VecDeque::new(),
                    retry_backoff: ExponentialBackoff::new(config),
                }),
                next_delayed_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().unwrap().shut_down
    }

    fn push(&self, task: Task) -> bool {
        if self.is_shut_down() {
            return false;
        }
        self.inner.sender.try_send(task).is_ok()
    }

    /// Runs `operation` on the queue and returns its result.
    pub async fn enqueue<Fut, T>(&self, operation: Fut) -> FirestoreResult<T>
    where
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = async move {
            let _ = tx.send(operation.await);
        };
        if !self.push(task.boxed()) {
            return Err(cancelled("The operation queue has been shut down"));
        }
        rx.await
            .unwrap_or_else(|_| Err(cancelled("The queued operation was dropped")))
    }

    /// Runs `operation` on the queue without waiting for it. Errors are logged.
    pub fn enqueue_and_forget<Fut>(&self, operation: Fut)
    where
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let task = async move {
            if let Err(err) = operation.await {
                log::warn!("queued operation failed: {err}");
            }
        };
        if !self.push(task.boxed()) {
            log::debug!("dropping operation enqueued after shutdown");
        }
    }

    /// Runs `operation` until it succeeds. Transient storage failures
    /// (`aborted`) are retried with backoff at the tail of the queue; other
    /// failures are logged and the operation is dropped. Retryable operations
    /// run in the order they were enqueued.
    pub fn enqueue_retryable<F, Fut>(&self, operation: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let operation: RetryableOp = Arc::new(move || operation().boxed());
        let start = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shut_down {
                return;
            }
            state.retryable.push_back(operation);
            state.retryable.len() == 1
        };
        if start {
            self.run_retryable_head();
        }
    }

    /// Retryable variant of [`enqueue`](Self::enqueue). Transient storage
    /// failures are retried and never reach the caller; any other outcome is
    /// returned once.
    pub async fn enqueue_retryable_and_wait<F, Fut, T>(&self, operation: F) -> FirestoreResult<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let sender = Arc::new(Mutex::new(Some(tx)));
        self.enqueue_retryable(move || {
            let attempt = operation();
            let sender = Arc::clone(&sender);
            async move {
                let result = attempt.await;
                if let Err(err) = &result {
                    if err.is_transient_storage_error() {
                        return Err(err.clone());
                    }
                }
                if let Some(tx) = sender.lock().unwrap().take() {
                    let _ = tx.send(result);
                }
                Ok(())
            }
        });
        rx.await
            .unwrap_or_else(|_| Err(cancelled("The queued operation was dropped")))
    }

    fn run_retryable_head(&self) {
        let Some(operation) = self.inner.state.lock().unwrap().retryable.front().cloned() else {
            return;
        };
        let queue = self.clone();
        self.enqueue_and_forget(async move {
            let result = operation().await;
            let retry_delay = {
                let mut state = queue.inner.state.lock().unwrap();
                match &result {
                    Err(err) if err.is_transient_storage_error() => {
                        Some(state.retry_backoff.next_delay())
                    }
                    _ => {
                        state.retry_backoff.reset();
                        state.retryable.pop_front();
                        None
                    }
                }
            };

            match (result, retry_delay) {
                (Err(err), Some(delay)) => {
                    log::debug!("retrying operation in {delay:?} after transient failure: {err}");
                    let retry_queue = queue.clone();
                    queue.enqueue_after_delay(TimerId::AsyncQueueRetry, delay, async move {
                        retry_queue.run_retryable_head();
                        Ok(())
                    });
                }
                (Err(err), None) => {
                    log::error!("retryable operation failed permanently: {err}");
                    queue.run_retryable_head();
                }
                (Ok(()), _) => queue.run_retryable_head(),
            }
            Ok(())
        });
    }

    /// Schedules `operation` to run on the queue after `delay`. The returned
    /// handle cancels it or runs it early.
    pub fn enqueue_after_delay<Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        operation: Fut,
    ) -> DelayedOperation
    where
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let (skip_tx, skip_rx) = oneshot::channel::<()>();
        let delayed = Arc::new(DelayedState {
            id: self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst),
            timer_id,
            cancelled: AtomicBool::new(false),
            skip: Mutex::new(Some(skip_tx)),
        });

        {
            let mut state = self.inner.state.lock().unwrap();
            if state.shut_down {
                delayed.cancelled.store(true, Ordering::SeqCst);
                return DelayedOperation { state: delayed };
            }
            state.delayed.push(Arc::clone(&delayed));
        }

        let queue = self.clone();
        let timer_state = Arc::clone(&delayed);
        runtime::spawn_detached(async move {
            let sleep = runtime::sleep(delay).boxed();
            match select(sleep, skip_rx).await {
                Either::Left(_) | Either::Right((Ok(()), _)) => {}
                // The handle was dropped without skipping; keep waiting.
                Either::Right((Err(_), sleep)) => sleep.await,
            }

            let run_state = Arc::clone(&timer_state);
            let forget_queue = queue.clone();
            forget_queue.enqueue_and_forget(async move {
                queue.remove_delayed(run_state.id);
                if run_state.cancelled.load(Ordering::SeqCst) {
                    return Ok(());
                }
                operation.await
            });
        });

        DelayedOperation { state: delayed }
    }

    fn remove_delayed(&self, id: u64) {
        self.inner
            .state
            .lock()
            .unwrap()
            .delayed
            .retain(|entry| entry.id != id);
    }

    /// Fires every pending delayed operation with a matching timer id (all of
    /// them for `None`) without waiting for its delay.
    pub fn run_delayed_operations_early(&self, timer_id: Option<TimerId>) {
        let pending: Vec<Arc<DelayedState>> = self
            .inner
            .state
            .lock()
            .unwrap()
            .delayed
            .iter()
            .filter(|entry| timer_id.map_or(true, |id| entry.timer_id == id))
            .cloned()
            .collect();
        for entry in pending {
            entry.skip_delay();
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .delayed
            .iter()
            .any(|entry| entry.timer_id == timer_id && !entry.cancelled.load(Ordering::SeqCst))
    }

    /// Runs every task enqueued so far, then stops accepting work and cancels
    /// pending delayed operations. Must not be awaited from a queue task.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel::<()>();
        let accepted = self.push(
            async move {
                let _ = tx.send(());
            }
            .boxed(),
        );

        let delayed = {
            let mut state = self.inner.state.lock().unwrap();
            state.shut_down = true;
            state.retryable.clear();
            std::mem::take(&mut state.delayed)
        };
        for entry in delayed {
            entry.cancel();
        }
        self.inner.sender.close();

        if accepted {
            let _ = rx.await;
        }
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct DelayedState {
    id: u64,
    timer_id: TimerId,
    cancelled: AtomicBool,
    skip: Mutex<Option<oneshot::Sender<()>>>,
}

impl DelayedState {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.skip_delay();
    }

    fn skip_delay(&self) {
        if let Some(sender) = self.skip.lock().unwrap().take() {
            let _ = sender.send(());
        }
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone)]
pub struct DelayedOperation {
    state: Arc<DelayedState>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.state.timer_id
    }

    /// Prevents the operation from running if it has not started yet.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Queues the operation immediately instead of waiting for the delay.
    pub fn skip_delay(&self) {
        self.state.skip_delay();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("timer_id", &self.state.timer_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{aborted, internal_error};
    use crate::firestore::test_support::spin_until;
    use std::sync::atomic::AtomicUsize;

    fn fast_queue() -> AsyncQueue {
        AsyncQueue::with_retry_backoff(BackoffConfig {
            initial_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(5),
        })
    }

    #[tokio::test]
    async fn runs_tasks_in_enqueue_order() {
        let queue = fast_queue();
        let log = Arc::new(Mutex::new(Vec::new()));
        for index in 0..5 {
            let log = Arc::clone(&log);
            queue.enqueue_and_forget(async move {
                runtime::sleep(Duration::from_millis(1)).await;
                log.lock().unwrap().push(index);
                Ok(())
            });
        }
        let value = queue.enqueue(async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let queue = fast_queue();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        queue.enqueue_retryable(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(aborted("store locked"))
                } else {
                    Ok(())
                }
            }
        });
        assert!(spin_until(|| attempts.load(Ordering::SeqCst) == 3).await);
    }

    #[tokio::test]
    async fn retryable_result_hides_transient_failures() {
        let queue = fast_queue();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let value = queue
            .enqueue_retryable_and_wait(move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(aborted("store locked"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 1);

        let err = queue
            .enqueue_retryable_and_wait(|| async { Err::<(), _>(internal_error("broken")) })
            .await
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");
    }

    #[tokio::test]
    async fn cancelled_delayed_operation_does_not_run() {
        let queue = fast_queue();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let operation = queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            Duration::from_millis(20),
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
        );
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        operation.cancel();
        runtime::sleep(Duration::from_millis(40)).await;
        queue.enqueue(async { Ok(()) }).await.unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn skipping_delay_runs_early() {
        let queue = fast_queue();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        queue.enqueue_after_delay(
            TimerId::ListenStreamConnectionBackoff,
            Duration::from_secs(60),
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
        );
        queue.run_delayed_operations_early(Some(TimerId::ListenStreamConnectionBackoff));
        assert!(spin_until(|| ran.load(Ordering::SeqCst)).await);
    }

    #[tokio::test]
    async fn rejects_work_after_shutdown() {
        let queue = fast_queue();
        queue.shutdown().await;
        let err = queue.enqueue(async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/cancelled");
    }
}
