use std::collections::VecDeque;
use std::sync::Arc;

use uuid::Uuid;

use huddle_core::config::StoreConfig;
use huddle_core::event::{EventBus, EventPayload, EventSource, emit};
use huddle_core::types::Identity;
use huddle_hub::protocol::{GroupMessagePayload, PrivateMessagePayload};
use huddle_messaging::{MessageStore, UnreadCounter};
use huddle_presence::PresenceTracker;

/// Live messages held back while no identity is known.
pub(crate) const DEFERRED_LIVE_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub(crate) enum LiveMessage {
    Private(PrivateMessagePayload),
    Group(GroupMessagePayload),
}

/// Everything the facade reads, behind one lock so an inbound message and the
/// unread count it bumps change together.
#[derive(Debug)]
pub(crate) struct SyncState {
    pub session_id: Option<Uuid>,
    pub identity: Option<Identity>,
    pub store: MessageStore,
    pub presence: PresenceTracker,
    pub unread: UnreadCounter,
    deferred: VecDeque<LiveMessage>,
}

impl SyncState {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            session_id: None,
            identity: None,
            store: MessageStore::from_config(config),
            presence: PresenceTracker::new(),
            unread: UnreadCounter::new(),
            deferred: VecDeque::new(),
        }
    }

    /// Holds `message` until an identity arrives. Returns `true` when the
    /// oldest held message had to be dropped to make room.
    pub fn defer(&mut self, message: LiveMessage) -> bool {
        let overflow = self.deferred.len() >= DEFERRED_LIVE_LIMIT;
        if overflow {
            self.deferred.pop_front();
        }
        self.deferred.push_back(message);
        overflow
    }

    pub fn take_deferred(&mut self) -> Vec<LiveMessage> {
        self.deferred.drain(..).collect()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Forgets whatever belonged to the connection generation that just ended.
    pub fn end_session(&mut self) {
        self.session_id = None;
        self.identity = None;
        self.presence.clear();
    }
}

/// A bus announcement prepared under the state lock and published after it
/// is released.
pub(crate) struct Notice {
    channel: &'static str,
    source: EventSource,
    payload: EventPayload,
}

impl Notice {
    pub fn hub(channel: &'static str, payload: EventPayload) -> Self {
        Self {
            channel,
            source: EventSource::Hub,
            payload,
        }
    }

    pub fn ui(channel: &'static str, payload: EventPayload) -> Self {
        Self {
            channel,
            source: EventSource::Ui,
            payload,
        }
    }
}

pub(crate) fn publish(event_bus: Option<&Arc<dyn EventBus>>, notices: Vec<Notice>) {
    let Some(event_bus) = event_bus else {
        return;
    };
    for notice in notices {
        emit(
            event_bus.as_ref(),
            notice.channel,
            notice.source,
            notice.payload,
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn group_message(id: &str) -> LiveMessage {
        LiveMessage::Group(GroupMessagePayload {
            id: id.to_string(),
            from_user_id: "u2".to_string(),
            from_username: "bob".to_string(),
            group_id: "g1".to_string(),
            body: "hello".to_string(),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn deferral_is_bounded_and_drops_oldest() {
        let mut state = SyncState::new(&StoreConfig::default());
        for index in 0..DEFERRED_LIVE_LIMIT {
            assert!(!state.defer(group_message(&format!("m{index}"))));
        }
        assert!(state.defer(group_message("newest")));

        let deferred = state.take_deferred();
        assert_eq!(deferred.len(), DEFERRED_LIVE_LIMIT);
        assert!(matches!(&deferred[0], LiveMessage::Group(payload) if payload.id == "m1"));
        assert!(matches!(
            deferred.last(),
            Some(LiveMessage::Group(payload)) if payload.id == "newest"
        ));
        assert_eq!(state.deferred_len(), 0);
    }
}
