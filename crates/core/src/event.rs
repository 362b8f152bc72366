use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;
use crate::types::ConversationKey;

/// Hierarchical channel name, e.g. `system.connection.established`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Lowercase dotted segments (`a-z`, `0-9`, `_`) under a known domain.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.' | '_'))
        {
            return false;
        }

        matches!(name.split('.').next(), Some("system" | "hub" | "ui"))
    }

    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Envelope for every notification published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    pub id: Uuid,

    /// Links related events, e.g. a failed send to the request that caused it.
    pub correlation_id: Option<Uuid>,

    pub source: EventSource,

    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    pub fn with_correlation(
        channel: Channel,
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(channel, source, payload)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Core component, named
    System(String),
    /// Connection manager and inbound dispatcher
    Hub,
    /// Facade calls made on behalf of the rendering layer
    Ui,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Connection lifecycle ──────────────────────────────────────
    ConnectionEstablished {
        session_id: Uuid,
        generation: u64,
    },
    ConnectionLost {
        reason: String,
        will_retry: bool,
    },
    ConnectionReconnecting {
        attempt: u32,
    },
    ConnectionFailed {
        reason: String,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Synchronized state ───────────────────────────────────────
    IdentityEstablished {
        user_id: String,
        username: String,
    },
    MessageStored {
        conversation_key: ConversationKey,
        message_id: String,
    },
    HistoryMerged {
        conversation_key: ConversationKey,
        added: usize,
    },
    RosterChanged {
        online: usize,
    },
    OnlineCountChanged {
        count: u64,
    },
    TypingChanged {
        username: Option<String>,
    },
    UnreadChanged {
        conversation_key: Option<ConversationKey>,
        total: u64,
    },

    // ── Facade ───────────────────────────────────────────────────
    ActiveConversationChanged {
        conversation_key: ConversationKey,
    },
    SendFailed {
        conversation_key: ConversationKey,
        reason: String,
    },
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

/// Publishes `payload` on `channel_name` if the name is valid, ignoring
/// delivery failures. Publishing with no subscribers is not an error for the
/// publisher.
pub fn emit(bus: &dyn EventBus, channel_name: &str, source: EventSource, payload: EventPayload) {
    match Channel::new(channel_name) {
        Ok(channel) => {
            let _ = bus.publish(Event::new(channel, source, payload));
        }
        Err(error) => tracing::error!(%error, "refusing to publish on invalid channel"),
    }
}

/// Single broadcast channel shared by all domains; subscriptions filter by
/// glob pattern on the receiving side.
#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        if !Channel::is_valid(event.channel.as_str()) {
            return Err(EventBusError::InvalidChannel(event.channel.to_string()));
        }

        // No receivers is fine: nobody is observing yet.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let domain = pattern.split('.').next().unwrap_or_default();
        if domain.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }
        if !has_glob_meta(domain) && !matches!(domain, "system" | "hub" | "ui") {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();

        Ok(EventSubscription {
            matcher,
            receiver: self.sender.subscribe(),
        })
    }
}

#[derive(Debug)]
pub struct EventSubscription {
    matcher: GlobMatcher,
    receiver: broadcast::Receiver<Event>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(EventBusError::ChannelClosed),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }

    /// Next already-queued matching event, if any.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', ']', '{', '}', '!'])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_channel_validation() {
        assert!(Channel::is_valid("system.connection.established"));
        assert!(Channel::is_valid("hub.message.stored"));
        assert!(Channel::is_valid("ui.notice.send_failed"));

        assert!(!Channel::is_valid("rtc.message.received"));
        assert!(!Channel::is_valid("system..double.dot"));
        assert!(!Channel::is_valid(".starts.with.dot"));
        assert!(!Channel::is_valid("ends.with.dot."));
        assert!(!Channel::is_valid("UpperCase"));
        assert!(!Channel::is_valid("hub.with-hyphen"));
        assert!(!Channel::is_valid(""));
    }

    #[test]
    fn test_channel_domain() {
        let c = Channel::new("hub.typing.changed").unwrap();
        assert_eq!(c.domain(), "hub");
    }

    #[test]
    fn subscribe_rejects_unknown_domain() {
        let bus = BroadcastEventBus::default();
        assert_matches!(
            bus.subscribe("plugin.**"),
            Err(EventBusError::InvalidPattern(_))
        );
    }

    #[tokio::test]
    async fn subscription_filters_by_pattern() {
        let bus = BroadcastEventBus::default();
        let mut connection = bus.subscribe("system.connection.*").unwrap();

        emit(
            &bus,
            "hub.typing.changed",
            EventSource::Hub,
            EventPayload::TypingChanged { username: None },
        );
        emit(
            &bus,
            "system.connection.reconnecting",
            EventSource::Hub,
            EventPayload::ConnectionReconnecting { attempt: 2 },
        );

        let event = tokio::time::timeout(Duration::from_millis(100), connection.recv())
            .await
            .expect("timed out")
            .expect("should receive event");
        assert_eq!(event.channel.as_str(), "system.connection.reconnecting");
        assert_matches!(
            event.payload,
            EventPayload::ConnectionReconnecting { attempt: 2 }
        );
        assert!(connection.try_recv().is_none());
    }

    #[tokio::test]
    async fn wildcard_domain_sees_everything() {
        let bus = BroadcastEventBus::default();
        let mut all = bus.subscribe("**").unwrap();

        emit(
            &bus,
            "ui.conversation.activated",
            EventSource::Ui,
            EventPayload::ActiveConversationChanged {
                conversation_key: "u2".into(),
            },
        );

        let event = all.try_recv().expect("event should be queued");
        assert_eq!(event.channel.domain(), "ui");
    }

    #[test]
    fn correlated_event_keeps_correlation_id() {
        let correlation = Uuid::new_v4();
        let event = Event::with_correlation(
            Channel::new("ui.notice.send_failed").unwrap(),
            EventSource::Ui,
            EventPayload::SendFailed {
                conversation_key: "u2".into(),
                reason: "rejected".to_string(),
            },
            correlation,
        );
        assert_eq!(event.correlation_id, Some(correlation));
    }
}
