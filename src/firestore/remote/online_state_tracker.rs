use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::firestore::constants::MAX_WATCH_STREAM_FAILURES;
use crate::firestore::core::OnlineState;
use crate::firestore::error::FirestoreError;
use crate::firestore::util::{AsyncQueue, DelayedOperation, TimerId};

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

/// Derives the client's [`OnlineState`] from the health of the listen
/// stream.
///
/// The state turns `Offline` after `MAX_WATCH_STREAM_FAILURES` failed
/// connection attempts, or when a connection attempt neither succeeds nor
/// fails within the online-state timeout. The first message received turns it
/// `Online`. Changes are reported to the handler on the queue.
#[derive(Clone)]
pub struct OnlineStateTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    timeout: Duration,
    state: Mutex<TrackerState>,
}

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    timer: Option<DelayedOperation>,
    should_warn_offline: bool,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, timeout: Duration, handler: OnlineStateHandler) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                queue,
                handler,
                timeout,
                state: Mutex::new(TrackerState {
                    state: OnlineState::Unknown,
                    watch_stream_failures: 0,
                    timer: None,
                    should_warn_offline: true,
                }),
            }),
        }
    }

    pub fn state(&self) -> OnlineState {
        self.inner.state.lock().unwrap().state
    }

    /// A listen stream connection attempt is starting.
    pub fn handle_watch_stream_start(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.watch_stream_failures != 0 {
                return;
            }
            let tracker = self.clone();
            state.timer = Some(self.inner.queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                self.inner.timeout,
                async move {
                    tracker.on_timeout();
                    Ok(())
                },
            ));
        }
        self.set_and_broadcast(OnlineState::Unknown);
    }

    pub fn handle_watch_stream_failure(&self, error: &FirestoreError) {
        let next = {
            let mut state = self.inner.state.lock().unwrap();
            if state.state == OnlineState::Online {
                Some(OnlineState::Unknown)
            } else {
                state.watch_stream_failures += 1;
                if state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
                    if let Some(timer) = state.timer.take() {
                        timer.cancel();
                    }
                    Self::warn_offline(
                        &mut state,
                        &format!("Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {error}"),
                    );
                    Some(OnlineState::Offline)
                } else {
                    None
                }
            }
        };
        if let Some(next) = next {
            self.set_and_broadcast(next);
        }
    }

    /// Forces `new_state`, for example `Online` on the first watch message
    /// or `Offline` when the network is disabled.
    pub fn set(&self, new_state: OnlineState) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            state.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                state.should_warn_offline = false;
            }
        }
        self.set_and_broadcast(new_state);
    }

    fn on_timeout(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.timer.take().is_none() {
                return;
            }
            Self::warn_offline(
                &mut state,
                &format!("Backend didn't respond within {:?}", self.inner.timeout),
            );
        }
        self.set_and_broadcast(OnlineState::Offline);
    }

    fn warn_offline(state: &mut TrackerState, details: &str) {
        if state.should_warn_offline {
            log::warn!(
                "Could not reach the backend. {details}. The client will operate in offline mode until it can connect."
            );
            state.should_warn_offline = false;
        } else {
            log::debug!("{details}");
        }
    }

    fn set_and_broadcast(&self, new_state: OnlineState) {
        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            let changed = state.state != new_state;
            state.state = new_state;
            changed
        };
        if changed {
            (self.inner.handler)(new_state);
        }
    }
}
