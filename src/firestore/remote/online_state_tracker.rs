use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::firestore::error::FirestoreError;
use crate::platform::runtime;

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OnlineState {
    /// Not yet known; listeners wait a little before reporting cached results as final.
    #[default]
    Unknown,
    Online,
    /// Reads are served from the cache and snapshots are marked `from_cache`.
    Offline,
}

/// Watch stream failures tolerated before the client is considered offline.
pub const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Derives [`OnlineState`] from the health of the watch stream.
///
/// A freshly started stream has `online_state_timeout` to prove itself; after that,
/// or after [`MAX_WATCH_STREAM_FAILURES`] failed attempts, the client reports
/// `Offline`. Every method returns the new state when it changed.
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    timeout: Duration,
    timer: Option<(u64, CancellationToken)>,
    next_timer_id: u64,
    should_warn_client_is_offline: bool,
    post_timeout: Arc<dyn Fn(u64) + Send + Sync>,
}

impl OnlineStateTracker {
    /// `post_timeout` must route the timer id back to [`handle_timeout`](Self::handle_timeout).
    pub fn new(timeout: Duration, post_timeout: Arc<dyn Fn(u64) + Send + Sync>) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            timeout,
            timer: None,
            next_timer_id: 0,
            should_warn_client_is_offline: true,
            post_timeout,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called each time the watch stream is (re)started.
    pub fn handle_watch_stream_start(&mut self) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.set_and_broadcast(OnlineState::Unknown);
        self.clear_timer();
        self.next_timer_id += 1;
        let id = self.next_timer_id;
        let token = CancellationToken::new();
        let post = Arc::clone(&self.post_timeout);
        let cancel = token.clone();
        let timeout = self.timeout;
        runtime::spawn_detached(async move {
            runtime::sleep(timeout).await;
            if !cancel.is_cancelled() {
                post(id);
            }
        });
        self.timer = Some((id, token));
        changed
    }

    pub fn handle_timeout(&mut self, timer_id: u64) -> Option<OnlineState> {
        match &self.timer {
            Some((id, _)) if *id == timer_id => {}
            _ => return None,
        }
        self.timer = None;
        self.log_offline_warning(&format!(
            "backend didn't respond within {} seconds",
            self.timeout.as_secs()
        ));
        self.set_and_broadcast(OnlineState::Offline)
    }

    /// Called when the watch stream fails while the client still wants to listen.
    pub fn handle_watch_stream_failure(&mut self, error: &FirestoreError) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // Reconnect without reporting Offline, which would flash cached results.
            return self.set_and_broadcast(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            self.clear_timer();
            self.log_offline_warning(&format!(
                "connection failed {} times, most recent error: {error}",
                self.watch_stream_failures
            ));
            return self.set_and_broadcast(OnlineState::Offline);
        }
        None
    }

    /// Explicit transitions: Online on watch traffic, Offline or Unknown when the
    /// network is disabled or no longer needed.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.clear_timer();
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_client_is_offline = false;
        }
        self.set_and_broadcast(state)
    }

    fn set_and_broadcast(&mut self, state: OnlineState) -> Option<OnlineState> {
        if state == self.state {
            return None;
        }
        self.state = state;
        Some(state)
    }

    fn log_offline_warning(&mut self, details: &str) {
        let message = format!(
            "firestore: could not reach the backend, {details}. The client will operate in offline mode until it can connect"
        );
        if self.should_warn_client_is_offline {
            log::warn!("{message}");
            self.should_warn_client_is_offline = false;
        } else {
            log::debug!("{message}");
        }
    }

    fn clear_timer(&mut self) {
        if let Some((_, token)) = self.timer.take() {
            token.cancel();
        }
    }
}

impl Drop for OnlineStateTracker {
    fn drop(&mut self) {
        self.clear_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    fn tracker(timeout: Duration) -> (OnlineStateTracker, async_channel::Receiver<u64>) {
        let (tx, rx) = async_channel::unbounded();
        let tracker = OnlineStateTracker::new(
            timeout,
            Arc::new(move |id| {
                let _ = tx.try_send(id);
            }),
        );
        (tracker, rx)
    }

    #[tokio::test]
    async fn goes_offline_when_the_stream_never_connects() {
        let (mut tracker, timeouts) = tracker(Duration::from_millis(5));
        assert_eq!(tracker.handle_watch_stream_start(), None);
        let id = timeouts.recv().await.unwrap();
        assert_eq!(tracker.handle_timeout(id), Some(OnlineState::Offline));
        assert_eq!(tracker.handle_timeout(id), None);
    }

    #[tokio::test]
    async fn first_failure_reports_offline() {
        let (mut tracker, _timeouts) = tracker(Duration::from_secs(60));
        tracker.handle_watch_stream_start();
        assert_eq!(
            tracker.handle_watch_stream_failure(&unavailable("down")),
            Some(OnlineState::Offline)
        );
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        assert_eq!(
            tracker.handle_watch_stream_failure(&unavailable("blip")),
            Some(OnlineState::Unknown)
        );
    }

    #[tokio::test]
    async fn stale_timer_is_ignored_after_going_online() {
        let (mut tracker, timeouts) = tracker(Duration::from_millis(5));
        tracker.handle_watch_stream_start();
        tracker.set(OnlineState::Online);
        // The timer was cancelled; any id it might still report no longer matches.
        assert_eq!(tracker.handle_timeout(1), None);
        assert!(tokio::time::timeout(Duration::from_millis(30), timeouts.recv())
            .await
            .is_err());
        assert_eq!(tracker.state(), OnlineState::Online);
    }
}
