//! Bounded-concurrency worker pool
//!
//! The pool lifecycle is a small state machine (`Accepting -> Draining -> Stopped`)
//! guarded by a single mutex together with the live-task count. A task is only
//! admitted while the pool is `Accepting`, and admission increments the live count
//! under the same lock that `stop` uses to flip the state, so `stop` can never
//! finish its drain wait while an admitted task is still unaccounted for.

use crate::error::{ReplicationError, Result};
use crate::logging::Logger;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::{Notify, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a [`WorkerPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Accepting,
    Draining,
    Stopped,
}

#[derive(Debug)]
struct Lifecycle {
    state: PoolState,
    live: usize,
}

#[derive(Debug)]
struct PoolInner {
    lifecycle: Mutex<Lifecycle>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    idle: Notify,
    max_concurrency: usize,
    output: Logger,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish_task(&self) {
        let mut lifecycle = self.lock();
        lifecycle.live -= 1;
        if lifecycle.live == 0 {
            self.idle.notify_waiters();
        }
    }
}

/// Generic bounded-concurrency task executor
#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Start a pool that runs at most `max_concurrency` tasks at once
    pub fn start(max_concurrency: usize, output: Logger) -> Self {
        let max_concurrency = max_concurrency.max(1);
        output.detail(&format!(
            "Starting worker pool with {} slots",
            max_concurrency
        ));

        Self {
            inner: Arc::new(PoolInner {
                lifecycle: Mutex::new(Lifecycle {
                    state: PoolState::Accepting,
                    live: 0,
                }),
                slots: Arc::new(Semaphore::new(max_concurrency)),
                shutdown: CancellationToken::new(),
                idle: Notify::new(),
                max_concurrency,
                output,
            }),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    pub fn state(&self) -> PoolState {
        self.inner.lock().state
    }

    /// Number of admitted tasks that have not finished yet
    pub fn live_tasks(&self) -> usize {
        self.inner.lock().live
    }

    /// Submit a task, waiting for a free slot.
    ///
    /// Fails immediately with [`ReplicationError::PoolClosed`] once shutdown has
    /// begun, and with [`ReplicationError::Cancelled`] if `context` is cancelled
    /// while waiting for a slot. The task receives a token that is cancelled when
    /// either `context` is cancelled or the pool is stopped without draining.
    pub async fn submit<F, Fut, T>(
        &self,
        context: &CancellationToken,
        task: F,
    ) -> Result<TaskHandle<T>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.state() != PoolState::Accepting {
            return Err(ReplicationError::PoolClosed);
        }

        let permit = tokio::select! {
            biased;
            _ = context.cancelled() => return Err(ReplicationError::Cancelled),
            acquired = self.inner.slots.clone().acquire_owned() => {
                acquired.map_err(|_| ReplicationError::PoolClosed)?
            }
        };

        {
            let mut lifecycle = self.inner.lock();
            if lifecycle.state != PoolState::Accepting {
                return Err(ReplicationError::PoolClosed);
            }
            lifecycle.live += 1;
        }

        let (sender, receiver) = oneshot::channel();
        let task_token = context.child_token();
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let shutdown = inner.shutdown.clone();
            let mut run = std::pin::pin!(AssertUnwindSafe(task(task_token.clone())).catch_unwind());

            let outcome = tokio::select! {
                outcome = &mut run => outcome,
                _ = shutdown.cancelled() => {
                    task_token.cancel();
                    run.await
                }
            };

            let result = outcome.unwrap_or_else(|panic| {
                Err(ReplicationError::TaskPanicked(panic_message(panic.as_ref())))
            });

            // Resolve the handle before releasing the slot so a drained stop
            // observes every result as available.
            let _ = sender.send(result);
            drop(permit);
            inner.finish_task();
        });

        Ok(TaskHandle { receiver })
    }

    /// Stop accepting tasks and wait for admitted tasks to finish.
    ///
    /// With `drain == false` the in-flight tasks' tokens are cancelled first.
    /// Calling `stop` more than once, or concurrently, is harmless.
    pub async fn stop(&self, drain: bool) {
        {
            let mut lifecycle = self.inner.lock();
            if lifecycle.state == PoolState::Accepting {
                lifecycle.state = PoolState::Draining;
                self.inner.output.detail(&format!(
                    "Worker pool stopping ({}), {} tasks in flight",
                    if drain { "drain" } else { "cancel" },
                    lifecycle.live
                ));
            }
        }

        if !drain {
            self.inner.shutdown.cancel();
        }

        loop {
            let notified = self.inner.idle.notified();
            if self.inner.lock().live == 0 {
                break;
            }
            notified.await;
        }

        let mut lifecycle = self.inner.lock();
        if lifecycle.state != PoolState::Stopped {
            lifecycle.state = PoolState::Stopped;
            self.inner.slots.close();
            self.inner.output.detail("Worker pool stopped");
        }
    }
}

/// Future resolving to the result of a submitted task
#[derive(Debug)]
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ReplicationError::TaskPanicked(
                    "task dropped before completion".to_string(),
                ))
            })
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let pool = WorkerPool::start(5, Logger::new_quiet());
        let context = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..100usize {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let finished = Arc::clone(&finished);
            let handle = pool
                .submit(&context, move |_token| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(i)
                })
                .await
                .unwrap();
            handles.push(handle);
        }

        pool.stop(true).await;
        assert_eq!(finished.load(Ordering::SeqCst), 100);
        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(pool.state(), PoolState::Stopped);

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails_with_pool_closed() {
        let pool = WorkerPool::start(2, Logger::new_quiet());
        pool.stop(true).await;

        let result = pool
            .submit(&CancellationToken::new(), |_token| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(ReplicationError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let pool = WorkerPool::start(2, Logger::new_quiet());
        let context = CancellationToken::new();

        let bad = pool
            .submit(&context, |_token| async {
                if true {
                    panic!("boom");
                }
                Ok(0u32)
            })
            .await
            .unwrap();
        let good = pool
            .submit(&context, |_token| async { Ok(7u32) })
            .await
            .unwrap();

        match bad.await {
            Err(ReplicationError::TaskPanicked(message)) => assert!(message.contains("boom")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(good.await.unwrap(), 7);
        pool.stop(true).await;
    }

    #[tokio::test]
    async fn test_task_errors_surface_through_handle() {
        let pool = WorkerPool::start(1, Logger::new_quiet());
        let handle = pool
            .submit(&CancellationToken::new(), |_token| async {
                Err::<(), _>(ReplicationError::AuthFailure("denied".into()))
            })
            .await
            .unwrap();
        assert!(matches!(handle.await, Err(ReplicationError::AuthFailure(_))));
        pool.stop(true).await;
    }

    #[tokio::test]
    async fn test_stop_without_drain_cancels_in_flight_tasks() {
        let pool = WorkerPool::start(2, Logger::new_quiet());
        let context = CancellationToken::new();

        let handle = pool
            .submit(&context, |token| async move {
                token.cancelled().await;
                Err::<(), _>(ReplicationError::Cancelled)
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), pool.stop(false))
            .await
            .expect("stop(false) should return once the task observes cancellation");
        assert!(matches!(handle.await, Err(ReplicationError::Cancelled)));
        assert!(!context.is_cancelled());
    }

    #[tokio::test]
    async fn test_submit_waiting_for_slot_observes_cancellation() {
        let pool = WorkerPool::start(1, Logger::new_quiet());
        let context = CancellationToken::new();

        let blocker = pool
            .submit(&context, |token| async move {
                token.cancelled().await;
                Ok(())
            })
            .await
            .unwrap();

        let waiting_context = CancellationToken::new();
        let canceller = waiting_context.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = pool
            .submit(&waiting_context, |_token| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(ReplicationError::Cancelled)));

        context.cancel();
        blocker.await.unwrap();
        pool.stop(true).await;
    }

    #[tokio::test]
    async fn test_concurrent_stop_calls_are_idempotent() {
        let pool = WorkerPool::start(3, Logger::new_quiet());
        let context = CancellationToken::new();
        let handle = pool
            .submit(&context, |_token| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(1)
            })
            .await
            .unwrap();

        let first = pool.clone();
        let second = pool.clone();
        tokio::join!(first.stop(true), second.stop(true));
        pool.stop(false).await;

        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(pool.live_tasks(), 0);
        assert_eq!(handle.await.unwrap(), 1);
    }
}
