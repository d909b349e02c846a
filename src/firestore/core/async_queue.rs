use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use tokio_util::sync::CancellationToken;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::firestore::remote::ExponentialBackoff;
use crate::platform::runtime::{self, until_cancelled};

type Operation<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Serial executor that owns a piece of state.
///
/// Operations run one at a time, in the order they were enqueued, on a single
/// detached task that holds `S`. Nothing else can reach the state, so operations
/// take `&mut S` and need no locking.
pub struct AsyncQueue<S> {
    sender: Sender<Operation<S>>,
}

impl<S> Clone for AsyncQueue<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone, Debug)]
pub struct DelayedOperation {
    token: CancellationToken,
}

impl DelayedOperation {
    /// Stops the operation from running if it has not started yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<S: Send + 'static> AsyncQueue<S> {
    /// Builds the state with access to the queue itself, then starts the worker.
    pub fn spawn_with<F>(init: F) -> Self
    where
        F: FnOnce(&AsyncQueue<S>) -> S,
    {
        let (sender, receiver) = async_channel::unbounded();
        let queue = Self { sender };
        let state = init(&queue);
        runtime::spawn_detached(run_worker(receiver, state));
        queue
    }

    /// Runs `operation` after everything already queued and returns its result.
    pub async fn enqueue<R, F>(&self, operation: F) -> FirestoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.push(Box::new(move |state| {
            let _ = tx.send(operation(state));
        }))?;
        rx.await
            .map_err(|_| cancelled("the operation was dropped because the client is shutting down"))
    }

    /// Queues `operation` without waiting for it.
    pub fn enqueue_and_forget<F>(&self, operation: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.push(Box::new(operation)).is_err() {
            log::debug!("firestore: operation dropped, the queue is shut down");
        }
    }

    /// Queues `operation` once `delay` has passed, unless cancelled first.
    pub fn enqueue_after_delay<F>(&self, delay: Duration, operation: F) -> DelayedOperation
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = DelayedOperation { token: token.clone() };
        let queue = self.clone();
        runtime::spawn_detached(async move {
            if until_cancelled(&token, runtime::sleep(delay)).await.is_none() {
                return;
            }
            queue.enqueue_and_forget(move |state| {
                // Cancelled between the timer firing and the operation running.
                if !token.is_cancelled() {
                    operation(state);
                }
            });
        });
        handle
    }

    /// Runs `operation` until it succeeds or fails with a non-retryable error.
    ///
    /// Retries wait out `backoff` on a timer, so other operations keep running in
    /// between attempts.
    pub fn enqueue_retryable<F>(&self, backoff: ExponentialBackoff, operation: F)
    where
        F: FnMut(&mut S) -> FirestoreResult<()> + Send + 'static,
    {
        self.schedule_attempt(backoff, operation, Duration::ZERO);
    }

    fn schedule_attempt<F>(&self, mut backoff: ExponentialBackoff, mut operation: F, delay: Duration)
    where
        F: FnMut(&mut S) -> FirestoreResult<()> + Send + 'static,
    {
        let queue = self.clone();
        self.enqueue_after_delay(delay, move |state| match operation(state) {
            Ok(()) => {}
            Err(err) if err.is_retryable() => {
                let delay = backoff.next_delay(false);
                log::debug!("firestore: retrying operation in {delay:?} after: {err}");
                queue.schedule_attempt(backoff, operation, delay);
            }
            Err(err) => log::warn!("firestore: operation failed and will not be retried: {err}"),
        });
    }

    /// Stops accepting operations. Anything already queued still runs, then the
    /// worker drops the state.
    pub fn shutdown(&self) {
        self.sender.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.is_closed()
    }

    fn push(&self, operation: Operation<S>) -> FirestoreResult<()> {
        self.sender
            .try_send(operation)
            .map_err(|_| cancelled("the client has been terminated"))
    }
}

async fn run_worker<S>(receiver: Receiver<Operation<S>>, mut state: S) {
    while let Ok(operation) = receiver.recv().await {
        operation(&mut state);
    }
    log::debug!("firestore: async queue drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, unavailable, FirestoreErrorCode};
    use crate::firestore::settings::RemoteSettings;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn quick_backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(&RemoteSettings {
            initial_backoff_delay: Duration::from_millis(1),
            max_backoff_delay: Duration::from_millis(5),
            ..RemoteSettings::default()
        })
    }

    #[tokio::test]
    async fn operations_run_in_order() {
        let queue = AsyncQueue::spawn_with(|_| Vec::new());
        for n in 0..5 {
            queue.enqueue_and_forget(move |log: &mut Vec<i32>| log.push(n));
        }
        let seen = queue.enqueue(|log| log.clone()).await.unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    struct Counter {
        queue: AsyncQueue<Counter>,
        hits: u32,
    }

    #[tokio::test]
    async fn state_can_post_back_to_its_queue() {
        let queue = AsyncQueue::spawn_with(|queue| Counter {
            queue: queue.clone(),
            hits: 0,
        });
        queue.enqueue_and_forget(|counter: &mut Counter| {
            counter.hits += 1;
            counter
                .queue
                .enqueue_and_forget(|counter: &mut Counter| counter.hits += 10);
        });
        queue.enqueue_and_forget(|counter: &mut Counter| counter.hits += 100);

        // The follow-up was queued behind the second operation.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.enqueue(|counter| counter.hits).await.unwrap(), 111);
    }

    #[tokio::test]
    async fn cancelled_delayed_operation_never_runs() {
        let queue = AsyncQueue::spawn_with(|_| 0u32);
        let delayed = queue.enqueue_after_delay(Duration::from_millis(20), |count| *count += 1);
        queue.enqueue_after_delay(Duration::from_millis(1), |count| *count += 10);
        delayed.cancel();
        assert!(delayed.is_cancelled());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.enqueue(|count| *count).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn retryable_operation_retries_unavailable_only() {
        let queue = AsyncQueue::spawn_with(|_| 0u32);
        queue.enqueue_retryable(quick_backoff(), |attempts| {
            *attempts += 1;
            if *attempts < 3 {
                Err(unavailable("flaky"))
            } else {
                Ok(())
            }
        });

        let permanent = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&permanent);
        queue.enqueue_retryable(quick_backoff(), move |_| {
            *counter.lock().unwrap() += 1;
            Err(permission_denied("no"))
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.enqueue(|attempts| *attempts).await.unwrap(), 3);
        assert_eq!(*permanent.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn shut_down_queue_rejects_new_work() {
        let queue = AsyncQueue::spawn_with(|_| ());
        queue.enqueue_and_forget(|_| ());
        queue.shutdown();
        assert!(queue.is_shut_down());
        let err = queue.enqueue(|_| ()).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
    }
}
