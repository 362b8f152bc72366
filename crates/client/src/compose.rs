//! Outbound typing notifications for what the local user is composing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Where typing notifications go.
pub trait TypingSink: Send + Sync + 'static {
    fn typing(&self, peer: &str);
    fn stop_typing(&self, peer: &str);
}

struct IdleTimer {
    epoch: u64,
    handle: JoinHandle<()>,
}

type TimerMap = Mutex<HashMap<String, IdleTimer>>;

/// Tells a peer we are typing on every keystroke and that we stopped once
/// the input has been idle for a while, or at once when the message is sent.
pub struct ComposeTracker<S: TypingSink> {
    sink: Arc<S>,
    idle: Duration,
    scope: CancellationToken,
    timers: Arc<TimerMap>,
    epoch: Mutex<u64>,
}

impl<S: TypingSink> ComposeTracker<S> {
    pub fn new(sink: Arc<S>, idle: Duration, scope: CancellationToken) -> Self {
        Self {
            sink,
            idle,
            scope,
            timers: Arc::new(Mutex::new(HashMap::new())),
            epoch: Mutex::new(0),
        }
    }

    /// Must be called within a tokio runtime.
    pub fn keystroke(&self, peer: &str) {
        if self.scope.is_cancelled() {
            return;
        }
        self.sink.typing(peer);

        let epoch = {
            let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
            *epoch = epoch.wrapping_add(1);
            *epoch
        };
        let handle = tokio::spawn(idle_stop(
            self.sink.clone(),
            self.timers.clone(),
            self.scope.clone(),
            peer.to_string(),
            epoch,
            self.idle,
        ));
        let timer = IdleTimer { epoch, handle };
        if let Some(previous) = lock(&self.timers).insert(peer.to_string(), timer) {
            previous.handle.abort();
        }
    }

    /// The message went out: stop typing now instead of waiting for idle.
    pub fn finish(&self, peer: &str) {
        if let Some(timer) = lock(&self.timers).remove(peer) {
            timer.handle.abort();
        }
        if !self.scope.is_cancelled() {
            self.sink.stop_typing(peer);
        }
    }

    pub fn composing(&self, peer: &str) -> bool {
        lock(&self.timers).contains_key(peer)
    }

    pub fn shutdown(&self) {
        self.scope.cancel();
        for (_, timer) in lock(&self.timers).drain() {
            timer.handle.abort();
        }
    }
}

fn lock(timers: &TimerMap) -> MutexGuard<'_, HashMap<String, IdleTimer>> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn idle_stop<S: TypingSink>(
    sink: Arc<S>,
    timers: Arc<TimerMap>,
    scope: CancellationToken,
    peer: String,
    epoch: u64,
    idle: Duration,
) {
    tokio::select! {
        _ = scope.cancelled() => return,
        _ = tokio::time::sleep(idle) => {}
    }

    let current = {
        let mut timers = lock(&timers);
        let current = timers.get(&peer).is_some_and(|timer| timer.epoch == epoch);
        if current {
            timers.remove(&peer);
        }
        current
    };
    if current {
        trace!(%peer, "compose idle");
        sink.stop_typing(&peer);
    }
}
