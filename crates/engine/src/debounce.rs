//! Trailing-edge debounce around an async operation.
//!
//! Every call replaces the pending arguments and restarts the quiet period.
//! When the period elapses without another call, the operation runs once with
//! the latest arguments and every caller from that window receives its
//! outcome. [`Debouncer::cancel`] drops the pending invocation instead.
//!
//! Fire and cancel race under one lock and a generation counter: whichever
//! takes the lock first wins, the loser observes a stale generation and does
//! nothing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebounceError<E> {
    #[error("debounced call was cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(E),
}

type Operation<A, T, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type Waiter<T, E> = oneshot::Sender<Result<T, DebounceError<E>>>;

struct Slot<A, T, E> {
    generation: u64,
    args: Option<A>,
    waiters: Vec<Waiter<T, E>>,
    timer: Option<JoinHandle<()>>,
}

pub struct Debouncer<A, T, E> {
    wait: Duration,
    op: Operation<A, T, E>,
    slot: Arc<Mutex<Slot<A, T, E>>>,
}

impl<A, T, E> Debouncer<A, T, E>
where
    A: Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new<F, Fut>(wait: Duration, op: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let op: Operation<A, T, E> =
            Arc::new(move |args: A| -> BoxFuture<'static, Result<T, E>> { Box::pin(op(args)) });
        Self {
            wait,
            op,
            slot: Arc::new(Mutex::new(Slot {
                generation: 0,
                args: None,
                waiters: Vec::new(),
                timer: None,
            })),
        }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Schedule the operation after the default quiet period.
    pub fn call(
        &self,
        args: A,
    ) -> impl Future<Output = Result<T, DebounceError<E>>> + Send + 'static + use<A, T, E> {
        self.call_after(args, self.wait)
    }

    /// Schedule the operation after `wait`, replacing any pending schedule.
    ///
    /// Scheduling happens immediately; the returned future only observes the
    /// outcome and may be dropped. Must be called within a tokio runtime.
    pub fn call_after(
        &self,
        args: A,
        wait: Duration,
    ) -> impl Future<Output = Result<T, DebounceError<E>>> + Send + 'static + use<A, T, E> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.slot.lock();
            slot.generation += 1;
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
            slot.args = Some(args);
            slot.waiters.push(tx);

            let generation = slot.generation;
            let state = Arc::clone(&self.slot);
            let op = Arc::clone(&self.op);
            slot.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                let (args, waiters) = {
                    let mut slot = state.lock();
                    if slot.generation != generation {
                        return;
                    }
                    // Detach: once fired, later calls must not abort the running op.
                    slot.timer = None;
                    let Some(args) = slot.args.take() else {
                        return;
                    };
                    (args, std::mem::take(&mut slot.waiters))
                };
                let outcome = op(args).await.map_err(DebounceError::Failed);
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
            }));
        }
        async move { rx.await.unwrap_or(Err(DebounceError::Cancelled)) }
    }

    /// Drop the pending invocation, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.args = None;
        let pending = match slot.timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        };
        for waiter in slot.waiters.drain(..) {
            let _ = waiter.send(Err(DebounceError::Cancelled));
        }
        pending
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().timer.is_some()
    }
}

impl<A, T, E> Drop for Debouncer<A, T, E> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
    }
}
