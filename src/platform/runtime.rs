use std::future::Future;
use std::pin::pin;
use std::sync::mpsc;
use std::sync::LazyLock;
use std::time::Duration;

use futures::future::{select, Either};
use tokio::runtime::{Builder, Handle};
use tokio_util::sync::CancellationToken;

/// Runtime used when a task is spawned from outside any tokio context.
static BACKGROUND_RUNTIME: LazyLock<Handle> = LazyLock::new(|| {
    let (handle_tx, handle_rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("firestore-background".to_string())
        .spawn(move || {
            let runtime = Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build background tokio runtime");
            let _ = handle_tx.send(runtime.handle().clone());
            runtime.block_on(std::future::pending::<()>());
        })
        .expect("failed to spawn background runtime thread");
    handle_rx
        .recv()
        .expect("background runtime thread exited before starting")
});

/// Spawns `future` on the current tokio runtime, or on a shared background runtime
/// when called from synchronous code.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => {
            BACKGROUND_RUNTIME.spawn(future);
        }
    }
}

/// Waits for `duration`; zero durations return immediately.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

/// Runs `future` unless `cancel` fires first.
pub async fn until_cancelled<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
    let cancelled = pin!(cancel.cancelled());
    let future = pin!(future);
    match select(future, cancelled).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawns_outside_a_runtime() {
        let (tx, rx) = mpsc::channel();
        spawn_detached(async move {
            sleep(Duration::from_millis(1)).await;
            let _ = tx.send(7);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[tokio::test]
    async fn spawns_on_the_current_runtime() {
        let (tx, rx) = futures::channel::oneshot::channel();
        spawn_detached(async move {
            let _ = tx.send("done");
        });
        assert_eq!(rx.await.unwrap(), "done");
    }
}
