use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use huddle_core::event::{EventBus, EventPayload};
use huddle_core::types::{ConversationKey, Identity, Message};
use huddle_hub::protocol::HistoryEntry;
use huddle_hub::{InboundEvent, InboundHandler, Lifecycle};
use huddle_messaging::resolve_private_key;
use huddle_presence::TypingTracker;

use crate::state::{LiveMessage, Notice, SyncState, publish};

/// Applies hub events to the shared state. Registered with the connection
/// manager before it is built; inert once the client's scope is cancelled.
pub(crate) struct Dispatcher {
    state: Arc<Mutex<SyncState>>,
    typing: TypingTracker,
    scope: CancellationToken,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl Dispatcher {
    pub fn new(
        state: Arc<Mutex<SyncState>>,
        typing: TypingTracker,
        scope: CancellationToken,
        event_bus: Option<Arc<dyn EventBus>>,
    ) -> Self {
        Self {
            state,
            typing,
            scope,
            event_bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InboundHandler for Dispatcher {
    fn on_event(&self, event: InboundEvent) {
        if self.scope.is_cancelled() {
            trace!(event = event.target(), "client shut down; ignoring hub event");
            return;
        }

        let mut notices = Vec::new();
        {
            let mut state = self.lock();
            match event {
                InboundEvent::IdentityEstablished(payload) => {
                    let identity = Identity {
                        session_id: state.session_id.unwrap_or_default(),
                        user_id: payload.user_id,
                        username: payload.username,
                    };
                    info!(
                        user_id = %identity.user_id,
                        username = %identity.username,
                        "identity established"
                    );
                    notices.push(Notice::hub(
                        "hub.identity.established",
                        EventPayload::IdentityEstablished {
                            user_id: identity.user_id.clone(),
                            username: identity.username.clone(),
                        },
                    ));
                    state.identity = Some(identity);

                    let deferred = state.take_deferred();
                    if !deferred.is_empty() {
                        debug!(count = deferred.len(), "applying deferred live messages");
                    }
                    for message in deferred {
                        apply_live(&mut state, message, &mut notices);
                    }
                }
                InboundEvent::PrivateMessage(payload) => {
                    apply_live(&mut state, LiveMessage::Private(payload), &mut notices);
                }
                InboundEvent::GroupMessage(payload) => {
                    apply_live(&mut state, LiveMessage::Group(payload), &mut notices);
                }
                InboundEvent::ConversationHistory(page) => {
                    let key = ConversationKey::from(page.with_user_id);
                    merge_page(&mut state, key, page.messages, &mut notices);
                }
                InboundEvent::GroupHistory(page) => {
                    let key = ConversationKey::from(page.group_id);
                    merge_page(&mut state, key, page.messages, &mut notices);
                }
                InboundEvent::UserOnline(user) => {
                    if state.presence.mark_online(user) {
                        notices.push(roster_changed(&state));
                    }
                }
                InboundEvent::UserOffline(user) => {
                    if state.presence.mark_offline(&user.user_id) {
                        notices.push(roster_changed(&state));
                    }
                }
                InboundEvent::FullRoster(users) => {
                    state.presence.set_full_roster(users);
                    notices.push(roster_changed(&state));
                }
                InboundEvent::PresenceCount(count) => {
                    if state.presence.set_online_count(count) {
                        notices.push(Notice::hub(
                            "hub.presence.count",
                            EventPayload::OnlineCountChanged { count },
                        ));
                    }
                }
                InboundEvent::UnreadSnapshot(counts) => {
                    state.unread.replace_all(
                        counts
                            .into_iter()
                            .map(|(key, count)| (ConversationKey::from(key), count)),
                    );
                    notices.push(Notice::hub(
                        "hub.unread.changed",
                        EventPayload::UnreadChanged {
                            conversation_key: None,
                            total: state.unread.total(),
                        },
                    ));
                }
                InboundEvent::Typing { username } => self.typing.on_typing_signal(username),
                InboundEvent::StopTyping => self.typing.on_stop_typing(),
            }
        }
        publish(self.event_bus.as_ref(), notices);
    }

    fn on_lifecycle(&self, lifecycle: Lifecycle) {
        if self.scope.is_cancelled() {
            return;
        }

        match lifecycle {
            Lifecycle::Connected {
                session_id,
                generation,
            } => {
                debug!(%session_id, generation, "awaiting identity for new session");
                let mut state = self.lock();
                state.session_id = Some(session_id);
                state.identity = None;
            }
            Lifecycle::Reconnecting { .. } | Lifecycle::Disconnected { .. } => {
                self.lock().end_session();
                self.typing.on_stop_typing();
            }
        }
    }
}

fn apply_live(state: &mut SyncState, live: LiveMessage, notices: &mut Vec<Notice>) {
    let Some(local_user_id) = state
        .identity
        .as_ref()
        .map(|identity| identity.user_id.clone())
    else {
        if state.defer(live) {
            warn!("deferred message buffer full; dropped the oldest");
        }
        debug!(deferred = state.deferred_len(), "no identity yet; deferring live message");
        return;
    };

    let message = match live {
        LiveMessage::Private(payload) => Message {
            conversation_key: resolve_private_key(
                &local_user_id,
                &payload.from_user_id,
                &payload.to_user_id,
            ),
            id: payload.id,
            sender_user_id: payload.from_user_id,
            sender_username: payload.from_username,
            body: payload.body,
            timestamp: payload.timestamp,
        },
        LiveMessage::Group(payload) => Message {
            conversation_key: ConversationKey::from(payload.group_id),
            id: payload.id,
            sender_user_id: payload.from_user_id,
            sender_username: payload.from_username,
            body: payload.body,
            timestamp: payload.timestamp,
        },
    };

    let key = message.conversation_key.clone();
    let message_id = message.id.clone();
    let from_self = message.sender_user_id == local_user_id;
    if !state.store.append(message) {
        return;
    }

    notices.push(Notice::hub(
        "hub.message.stored",
        EventPayload::MessageStored {
            conversation_key: key.clone(),
            message_id,
        },
    ));
    if state.unread.record_inbound(&key, from_self) {
        notices.push(Notice::hub(
            "hub.unread.changed",
            EventPayload::UnreadChanged {
                conversation_key: Some(key),
                total: state.unread.total(),
            },
        ));
    }
}

fn merge_page(
    state: &mut SyncState,
    key: ConversationKey,
    entries: Vec<HistoryEntry>,
    notices: &mut Vec<Notice>,
) {
    let page = entries
        .into_iter()
        .map(|entry| Message {
            id: entry.id,
            sender_user_id: entry.from_user_id,
            sender_username: entry.from_username,
            body: entry.body,
            timestamp: entry.timestamp,
            conversation_key: key.clone(),
        })
        .collect();
    let added = state.store.merge_history(&key, page);
    notices.push(Notice::hub(
        "hub.history.merged",
        EventPayload::HistoryMerged {
            conversation_key: key,
            added,
        },
    ));
}

fn roster_changed(state: &SyncState) -> Notice {
    Notice::hub(
        "hub.roster.changed",
        EventPayload::RosterChanged {
            online: state.presence.users().len(),
        },
    )
}
