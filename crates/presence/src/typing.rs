//! Remote typing indicator.
//!
//! One slot holds whoever the hub last reported as typing. A signal starts a
//! quiet-window timer that clears the slot; a newer signal replaces the timer
//! rather than adding a second one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use huddle_core::config::TypingConfig;
use huddle_core::event::{EventBus, EventPayload, EventSource, emit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub username: String,
    pub expires_at: Instant,
}

#[derive(Default)]
struct Slot {
    signal: Option<TypingSignal>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every change so a timer that already fired cannot clear a
    /// newer signal.
    epoch: u64,
}

struct Shared {
    quiet_window: Duration,
    scope: CancellationToken,
    event_bus: Option<Arc<dyn EventBus>>,
    slot: Mutex<Slot>,
    changes: watch::Sender<Option<String>>,
}

#[derive(Clone)]
pub struct TypingTracker {
    shared: Arc<Shared>,
}

impl TypingTracker {
    /// Timers run until the signal expires or `scope` is cancelled.
    pub fn new(
        quiet_window: Duration,
        scope: CancellationToken,
        event_bus: Option<Arc<dyn EventBus>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                quiet_window,
                scope,
                event_bus,
                slot: Mutex::new(Slot::default()),
                changes: watch::Sender::new(None),
            }),
        }
    }

    pub fn from_config(
        config: &TypingConfig,
        scope: CancellationToken,
        event_bus: Option<Arc<dyn EventBus>>,
    ) -> Self {
        Self::new(config.quiet_window(), scope, event_bus)
    }

    /// Shows `username` as typing until the quiet window passes without
    /// another signal. Must be called within a tokio runtime.
    pub fn on_typing_signal(&self, username: impl Into<String>) {
        if self.shared.scope.is_cancelled() {
            return;
        }
        let username = username.into();
        let expires_at = Instant::now() + self.shared.quiet_window;

        let mut slot = self.shared.lock();
        slot.epoch = slot.epoch.wrapping_add(1);
        if let Some(previous) = slot.timer.take() {
            previous.abort();
        }
        slot.timer = Some(tokio::spawn(expire(
            self.shared.clone(),
            slot.epoch,
            expires_at,
        )));
        let changed = slot
            .signal
            .as_ref()
            .is_none_or(|signal| signal.username != username);
        trace!(%username, "typing signal");
        slot.signal = Some(TypingSignal {
            username: username.clone(),
            expires_at,
        });
        drop(slot);

        if changed {
            self.shared.announce(Some(username));
        }
    }

    /// Clears the slot immediately.
    pub fn on_stop_typing(&self) {
        let cleared = {
            let mut slot = self.shared.lock();
            slot.epoch = slot.epoch.wrapping_add(1);
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
            slot.signal.take().is_some()
        };
        if cleared {
            self.shared.announce(None);
        }
    }

    pub fn typing_user(&self) -> Option<String> {
        self.signal().map(|signal| signal.username)
    }

    pub fn signal(&self) -> Option<TypingSignal> {
        self.shared.lock().signal.clone()
    }

    /// Follows the typing user as it changes.
    pub fn watch(&self) -> watch::Receiver<Option<String>> {
        self.shared.changes.subscribe()
    }

    /// Stops the pending timer without touching the slot.
    pub fn shutdown(&self) {
        self.shared.scope.cancel();
        if let Some(timer) = self.shared.lock().timer.take() {
            timer.abort();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, username: Option<String>) {
        self.changes.send_replace(username.clone());
        if let Some(event_bus) = &self.event_bus {
            emit(
                event_bus.as_ref(),
                "hub.typing.changed",
                EventSource::Hub,
                EventPayload::TypingChanged { username },
            );
        }
    }
}

async fn expire(shared: Arc<Shared>, epoch: u64, expires_at: Instant) {
    tokio::select! {
        _ = shared.scope.cancelled() => return,
        _ = tokio::time::sleep_until(expires_at) => {}
    }

    let expired = {
        let mut slot = shared.lock();
        if slot.epoch != epoch {
            return;
        }
        slot.timer = None;
        slot.signal.take()
    };
    if let Some(signal) = expired {
        debug!(username = %signal.username, "typing signal expired");
        shared.announce(None);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use huddle_core::event::BroadcastEventBus;

    use super::*;

    const QUIET: Duration = Duration::from_millis(3000);

    fn tracker() -> TypingTracker {
        TypingTracker::new(QUIET, CancellationToken::new(), None)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn signal_clears_after_the_quiet_window() {
        let typing = tracker();
        let mut changes = typing.watch();
        let started = Instant::now();

        typing.on_typing_signal("bob");
        assert_eq!(typing.typing_user().as_deref(), Some("bob"));

        changes
            .wait_for(Option::is_none)
            .await
            .expect("tracker dropped");
        assert!(started.elapsed() >= QUIET);
        assert_eq!(typing.typing_user(), None);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn newer_signal_restarts_the_window() {
        let typing = tracker();
        let mut changes = typing.watch();

        typing.on_typing_signal("bob");
        tokio::time::sleep(Duration::from_secs(2)).await;
        typing.on_typing_signal("carol");
        let restarted = Instant::now();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(typing.typing_user().as_deref(), Some("carol"));

        changes
            .wait_for(Option::is_none)
            .await
            .expect("tracker dropped");
        assert!(restarted.elapsed() >= QUIET);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn repeated_signal_from_the_same_user_extends_it() {
        let typing = tracker();
        typing.on_typing_signal("bob");
        let first = typing.signal().expect("signal set");

        tokio::time::sleep(Duration::from_secs(1)).await;
        typing.on_typing_signal("bob");
        let second = typing.signal().expect("signal set");

        assert!(second.expires_at >= first.expires_at + Duration::from_secs(1));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stop_typing_clears_at_once() {
        let typing = tracker();
        typing.on_typing_signal("bob");
        typing.on_stop_typing();
        assert_eq!(typing.typing_user(), None);

        // The aborted timer must not clear a later signal early.
        typing.on_typing_signal("carol");
        tokio::time::sleep(QUIET - Duration::from_millis(1)).await;
        assert_eq!(typing.typing_user().as_deref(), Some("carol"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn cancelled_scope_stops_timers_and_signals() {
        let scope = CancellationToken::new();
        let typing = TypingTracker::new(QUIET, scope.clone(), None);
        typing.on_typing_signal("bob");

        scope.cancel();
        tokio::time::sleep(QUIET * 2).await;
        assert_eq!(typing.typing_user().as_deref(), Some("bob"));

        typing.on_typing_signal("carol");
        assert_eq!(typing.typing_user().as_deref(), Some("bob"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn changes_are_published_on_the_bus() {
        let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let mut typing_events = event_bus
            .subscribe("hub.typing.*")
            .expect("failed to subscribe typing events");
        let typing = TypingTracker::new(QUIET, CancellationToken::new(), Some(event_bus));

        typing.on_typing_signal("bob");
        typing.on_typing_signal("bob");
        typing.on_stop_typing();

        assert_matches!(
            typing_events.try_recv().map(|event| event.payload),
            Some(EventPayload::TypingChanged { username: Some(name) }) if name == "bob"
        );
        assert_matches!(
            typing_events.try_recv().map(|event| event.payload),
            Some(EventPayload::TypingChanged { username: None })
        );
        assert!(typing_events.try_recv().is_none());
    }
}
