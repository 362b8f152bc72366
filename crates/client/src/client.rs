use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use huddle_core::config::Config;
use huddle_core::credentials::{Credential, CredentialStore};
use huddle_core::event::{EventBus, EventPayload};
use huddle_core::types::{ConversationKey, Identity, Message, OnlineUser};
use huddle_hub::{
    ConnectionConfig, ConnectionManager, ConnectionState, HubCall, HubConnector, HubError,
    WebSocketConnector,
};
use huddle_presence::TypingTracker;

use crate::compose::{ComposeTracker, TypingSink};
use crate::dispatcher::Dispatcher;
use crate::state::{Notice, SyncState, publish};

/// The one interface a front end talks to. It owns the hub connection and
/// every synchronized store; reads return snapshots, and every change is
/// also announced on the event bus when one is attached.
pub struct ChatClient<C: HubConnector = WebSocketConnector> {
    hub: Arc<ConnectionManager<C>>,
    state: Arc<Mutex<SyncState>>,
    typing: TypingTracker,
    compose: ComposeTracker<ConnectionManager<C>>,
    credentials: Arc<dyn CredentialStore>,
    credential: Mutex<Option<Credential>>,
    event_bus: Option<Arc<dyn EventBus>>,
    scope: CancellationToken,
}

impl<C: HubConnector> ChatClient<C> {
    pub fn new(
        config: &Config,
        connector: C,
        credentials: Arc<dyn CredentialStore>,
        event_bus: Option<Arc<dyn EventBus>>,
    ) -> Self {
        let scope = CancellationToken::new();
        let state = Arc::new(Mutex::new(SyncState::new(&config.store)));
        let typing =
            TypingTracker::from_config(&config.typing, scope.child_token(), event_bus.clone());
        let dispatcher = Dispatcher::new(
            state.clone(),
            typing.clone(),
            scope.clone(),
            event_bus.clone(),
        );

        let mut builder =
            ConnectionManager::builder(ConnectionConfig::from_config(config), connector)
                .cancellation_scope(scope.child_token());
        if let Some(event_bus) = &event_bus {
            builder = builder.event_bus(event_bus.clone());
        }
        let hub = Arc::new(builder.on_event(Arc::new(dispatcher)).build());
        let compose = ComposeTracker::new(
            hub.clone(),
            config.typing.local_idle(),
            scope.child_token(),
        );

        Self {
            hub,
            state,
            typing,
            compose,
            credentials,
            credential: Mutex::new(None),
            event_bus,
            scope,
        }
    }

    /// Reads the credential store and connects with what it holds. Without a
    /// credential the client stays disconnected.
    pub async fn start(&self) -> ConnectionState {
        let Some(credential) = self.credentials.get() else {
            info!("no stored credential; staying disconnected");
            return self.hub.state();
        };
        *lock(&self.credential) = Some(credential.clone());
        self.hub.connect(&credential).await
    }

    /// Puts `key` on screen and clears its unread count. If the connection
    /// is down, starts reconnecting in the background. Must be called within
    /// a tokio runtime.
    pub fn set_active_conversation(&self, key: impl Into<ConversationKey>) {
        let key = key.into();
        let notices = {
            let mut state = self.lock();
            let cleared = state.unread.count(&key) > 0;
            let changed = state.unread.activate(key.clone());
            let mut notices = Vec::new();
            if changed || cleared {
                notices.push(Notice::hub(
                    "hub.unread.changed",
                    EventPayload::UnreadChanged {
                        conversation_key: Some(key.clone()),
                        total: state.unread.total(),
                    },
                ));
            }
            if changed {
                notices.push(Notice::ui(
                    "ui.conversation.activated",
                    EventPayload::ActiveConversationChanged {
                        conversation_key: key,
                    },
                ));
            }
            notices
        };
        publish(self.event_bus.as_ref(), notices);
        self.connect_if_idle();
    }

    pub async fn send_private_message(&self, to_user_id: &str, body: &str) -> Result<(), HubError> {
        if !self.ready_to_send() {
            debug!(to_user_id, "not connected with an identity; message not sent");
            return Ok(());
        }
        // The peer stops seeing us type as soon as the message leaves, not
        // once the hub acknowledges it.
        self.compose.finish(to_user_id);
        let result = self
            .hub
            .invoke(HubCall::SendPrivateMessage {
                to_user_id: to_user_id.to_string(),
                body: body.to_string(),
            })
            .await;
        self.report_send(ConversationKey::from(to_user_id), result)
    }

    pub async fn send_group_message(&self, group_id: &str, body: &str) -> Result<(), HubError> {
        if !self.ready_to_send() {
            debug!(group_id, "not connected with an identity; message not sent");
            return Ok(());
        }
        let result = self
            .hub
            .invoke(HubCall::SendGroupMessage {
                group_id: group_id.to_string(),
                body: body.to_string(),
            })
            .await;
        self.report_send(ConversationKey::from(group_id), result)
    }

    /// Asks for a page of 1:1 history. The page is merged when the hub
    /// delivers it; without a connection this does nothing.
    pub async fn load_conversation_history(
        &self,
        with_user_id: &str,
        page: u32,
    ) -> Result<(), HubError> {
        if !self.hub.state().is_connected() {
            return Ok(());
        }
        self.hub
            .invoke(HubCall::RequestConversationHistory {
                with_user_id: with_user_id.to_string(),
                page,
            })
            .await
            .map(|_| ())
    }

    pub async fn load_group_history(&self, group_id: &str, page: u32) -> Result<(), HubError> {
        if !self.hub.state().is_connected() {
            return Ok(());
        }
        self.hub
            .invoke(HubCall::RequestGroupHistory {
                group_id: group_id.to_string(),
                page,
            })
            .await
            .map(|_| ())
    }

    pub fn notify_typing(&self, to_user_id: &str) {
        if self.has_identity() {
            self.hub.typing(to_user_id);
        }
    }

    pub fn notify_stop_typing(&self, to_user_id: &str) {
        if self.has_identity() {
            self.hub.stop_typing(to_user_id);
        }
    }

    /// Input changed in the compose box for `to_user_id`. Must be called
    /// within a tokio runtime.
    pub fn keystroke(&self, to_user_id: &str) {
        if self.has_identity() {
            self.compose.keystroke(to_user_id);
        }
    }

    pub fn messages(&self, key: &ConversationKey) -> Vec<Message> {
        self.lock().store.messages(key)
    }

    pub fn conversations(&self) -> Vec<ConversationKey> {
        self.lock().store.conversations()
    }

    pub fn online_users(&self) -> Vec<OnlineUser> {
        self.lock().presence.users()
    }

    pub fn online_count(&self) -> u64 {
        self.lock().presence.online_count()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.hub.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.hub.watch_state()
    }

    pub fn current_user(&self) -> Option<Identity> {
        self.lock().identity.clone()
    }

    pub fn typing_user(&self) -> Option<String> {
        self.typing.typing_user()
    }

    pub fn watch_typing(&self) -> watch::Receiver<Option<String>> {
        self.typing.watch()
    }

    pub fn unread_counts(&self) -> HashMap<ConversationKey, u32> {
        self.lock().unread.counts()
    }

    pub fn unread(&self, key: &ConversationKey) -> u32 {
        self.lock().unread.count(key)
    }

    pub fn total_unread(&self) -> u64 {
        self.lock().unread.total()
    }

    pub fn active_conversation(&self) -> Option<ConversationKey> {
        self.lock().unread.active().cloned()
    }

    /// Stops every timer and the connection. Nothing the hub sent before
    /// this returns mutates state afterwards.
    pub async fn shutdown(&self) {
        info!("shutting down chat client");
        self.scope.cancel();
        self.typing.shutdown();
        self.compose.shutdown();
        self.hub.shutdown().await;
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        lock(&self.state)
    }

    fn has_identity(&self) -> bool {
        self.lock().identity.is_some()
    }

    fn ready_to_send(&self) -> bool {
        self.hub.state().is_connected() && self.has_identity()
    }

    fn connect_if_idle(&self) {
        if !matches!(
            self.hub.state(),
            ConnectionState::Disconnected | ConnectionState::ConnectionFailed
        ) || self.scope.is_cancelled()
        {
            return;
        }
        let Some(credential) = lock(&self.credential).clone() else {
            return;
        };

        debug!("connection is down; reconnecting in the background");
        let hub = self.hub.clone();
        tokio::spawn(async move {
            let state = hub.connect(&credential).await;
            debug!(?state, "background connect finished");
        });
    }

    fn report_send(
        &self,
        conversation_key: ConversationKey,
        result: Result<serde_json::Value, HubError>,
    ) -> Result<(), HubError> {
        let Err(error) = result else {
            return Ok(());
        };
        warn!(%conversation_key, %error, "message send failed");
        publish(
            self.event_bus.as_ref(),
            vec![Notice::ui(
                "ui.notice.send_failed",
                EventPayload::SendFailed {
                    conversation_key,
                    reason: error.to_string(),
                },
            )],
        );
        Err(error)
    }
}

impl<C: HubConnector> TypingSink for ConnectionManager<C> {
    fn typing(&self, peer: &str) {
        let call = HubCall::NotifyTyping {
            to_user_id: peer.to_string(),
        };
        if let Err(error) = self.notify(call) {
            debug!(peer, %error, "typing notification not sent");
        }
    }

    fn stop_typing(&self, peer: &str) {
        let call = HubCall::NotifyStopTyping {
            to_user_id: peer.to_string(),
        };
        if let Err(error) = self.notify(call) {
            debug!(peer, %error, "stop-typing notification not sent");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{DateTime, Utc};
    use serde_json::Value;

    use huddle_core::credentials::MemoryCredentialStore;
    use huddle_core::error::CredentialError;
    use huddle_core::event::BroadcastEventBus;
    use huddle_hub::protocol::{
        ConversationHistoryPayload, HistoryEntry, IdentityPayload, PrivateMessagePayload,
    };
    use huddle_hub::testing::{FakeConnector, FakeHub, eventually};
    use huddle_hub::InboundEvent;

    use super::*;

    mockall::mock! {
        Credentials {}

        impl CredentialStore for Credentials {
            fn get(&self) -> Option<Credential>;
            fn set(&self, credential: Credential) -> Result<(), CredentialError>;
            fn clear(&self) -> Result<(), CredentialError>;
        }
    }

    fn stored_credential() -> Arc<dyn CredentialStore> {
        Arc::new(MemoryCredentialStore::new(Some(Credential::new(
            "token-1",
            Some("u1".to_string()),
        ))))
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).expect("valid timestamp")
    }

    fn private(id: &str, from: &str, to: &str, body: &str, seconds: i64) -> InboundEvent {
        InboundEvent::PrivateMessage(PrivateMessagePayload {
            id: id.to_string(),
            from_user_id: from.to_string(),
            from_username: format!("{from}-name"),
            to_user_id: to.to_string(),
            body: body.to_string(),
            timestamp: at(seconds),
        })
    }

    fn identity() -> InboundEvent {
        InboundEvent::IdentityEstablished(IdentityPayload {
            user_id: "u1".to_string(),
            username: "alice".to_string(),
        })
    }

    struct Harness {
        client: ChatClient<FakeConnector>,
        connector: FakeConnector,
        event_bus: Arc<dyn EventBus>,
    }

    fn harness(credentials: Arc<dyn CredentialStore>) -> Harness {
        let connector = FakeConnector::new();
        let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let client = ChatClient::new(
            &Config::default(),
            connector.clone(),
            credentials,
            Some(event_bus.clone()),
        );
        Harness {
            client,
            connector,
            event_bus,
        }
    }

    /// Connected as u1 with the roster request already consumed.
    async fn signed_in() -> (Harness, FakeHub) {
        let h = harness(stored_credential());
        assert_eq!(h.client.start().await, ConnectionState::Connected);
        let mut hub = h.connector.accept().await;
        assert_eq!(hub.expect_call().await, (None, HubCall::RequestOnlineUsers));
        hub.push(identity());
        eventually(|| h.client.current_user().is_some()).await;
        (h, hub)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sent_message_is_stored_once_from_the_echo() {
        let (h, mut hub) = signed_in().await;

        let (sent, _) = tokio::join!(h.client.send_private_message("u2", "hi"), async {
            // Sending ends the compose state for that peer.
            assert_eq!(
                hub.expect_call().await,
                (
                    None,
                    HubCall::NotifyStopTyping {
                        to_user_id: "u2".to_string()
                    }
                )
            );
            let (id, call) = hub.expect_call().await;
            assert_eq!(
                call,
                HubCall::SendPrivateMessage {
                    to_user_id: "u2".to_string(),
                    body: "hi".to_string()
                }
            );
            hub.push(private("m1", "u1", "u2", "hi", 10));
            hub.complete(id.expect("send should carry an id"), Value::Null);
        });
        assert_eq!(sent, Ok(()));

        let u2 = ConversationKey::from("u2");
        let messages = h.client.messages(&u2);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "hi");
        assert_eq!(messages[0].conversation_key, u2);
        assert_eq!(h.client.unread(&u2), 0);
        assert!(hub.try_next_call().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stop_typing_goes_out_before_the_send_completes() {
        let (h, mut hub) = signed_in().await;
        h.client.keystroke("u2");
        assert_matches!(hub.expect_call().await, (None, HubCall::NotifyTyping { .. }));

        let (sent, _) = tokio::join!(h.client.send_private_message("u2", "hi"), async {
            assert_eq!(
                hub.expect_call().await,
                (
                    None,
                    HubCall::NotifyStopTyping {
                        to_user_id: "u2".to_string()
                    }
                )
            );
            let (send_id, call) = hub.expect_call().await;
            assert_matches!(call, HubCall::SendPrivateMessage { .. });
            // Only now does the hub acknowledge the send.
            hub.complete(send_id.expect("send should carry an id"), Value::Null);
        });
        assert_eq!(sent, Ok(()));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reactivating_the_same_conversation_is_silent() {
        let (h, hub) = signed_in().await;
        let mut unread = h
            .event_bus
            .subscribe("hub.unread.*")
            .expect("failed to subscribe unread events");

        h.client.set_active_conversation("u2");
        assert_matches!(
            unread.try_recv().map(|event| event.payload),
            Some(EventPayload::UnreadChanged { total: 0, .. })
        );

        h.client.set_active_conversation("u2");
        assert!(unread.try_recv().is_none());

        hub.push(private("m1", "u3", "u1", "psst", 10));
        eventually(|| h.client.unread(&ConversationKey::from("u3")) == 1).await;
        while unread.try_recv().is_some() {}

        // Opening a conversation with unread messages still announces the clear.
        h.client.set_active_conversation("u3");
        assert_matches!(
            unread.try_recv().map(|event| event.payload),
            Some(EventPayload::UnreadChanged { total: 0, .. })
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sends_and_loads_are_no_ops_while_disconnected() {
        let h = harness(Arc::new(MemoryCredentialStore::new(None)));

        assert_eq!(h.client.start().await, ConnectionState::Disconnected);
        assert_eq!(h.client.send_private_message("u2", "hi").await, Ok(()));
        assert_eq!(h.client.send_group_message("g1", "hi").await, Ok(()));
        assert_eq!(h.client.load_conversation_history("u2", 1).await, Ok(()));
        assert_eq!(h.client.load_group_history("g1", 1).await, Ok(()));
        h.client.notify_typing("u2");
        h.client.keystroke("u2");

        assert_eq!(h.connector.connect_calls(), 0);
        assert!(h.client.conversations().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unread_counts_only_conversations_off_screen() {
        let (h, hub) = signed_in().await;
        h.client.set_active_conversation("u2");

        hub.push(private("m1", "u3", "u1", "psst", 10));
        hub.push(private("m2", "u2", "u1", "hello", 11));
        eventually(|| h.client.messages(&ConversationKey::from("u2")).len() == 1).await;

        assert_eq!(h.client.unread(&ConversationKey::from("u3")), 1);
        assert_eq!(h.client.unread(&ConversationKey::from("u2")), 0);
        assert_eq!(h.client.total_unread(), 1);

        h.client.set_active_conversation("u3");
        assert_eq!(h.client.total_unread(), 0);
        assert_eq!(
            h.client.active_conversation(),
            Some(ConversationKey::from("u3"))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn messages_before_identity_are_attributed_once_it_arrives() {
        let h = harness(stored_credential());
        h.client.start().await;
        let mut hub = h.connector.accept().await;
        hub.expect_call().await;

        hub.push(private("m1", "u2", "u1", "early", 10));
        hub.push(identity());
        eventually(|| h.client.current_user().is_some()).await;

        let u2 = ConversationKey::from("u2");
        assert_eq!(h.client.messages(&u2).len(), 1);
        assert_eq!(h.client.unread(&u2), 1);
        assert_eq!(h.client.conversations(), vec![u2]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn history_page_is_merged_in_front() {
        let (h, mut hub) = signed_in().await;
        hub.push(private("m3", "u2", "u1", "latest", 30));

        let (loaded, _) = tokio::join!(h.client.load_conversation_history("u2", 1), async {
            let (id, call) = hub.expect_call().await;
            assert_eq!(
                call,
                HubCall::RequestConversationHistory {
                    with_user_id: "u2".to_string(),
                    page: 1
                }
            );
            hub.push(InboundEvent::ConversationHistory(ConversationHistoryPayload {
                with_user_id: "u2".to_string(),
                messages: ["m2", "m1", "m3"]
                    .into_iter()
                    .zip([20, 10, 30])
                    .map(|(id, seconds)| HistoryEntry {
                        id: id.to_string(),
                        from_user_id: "u2".to_string(),
                        from_username: "bob".to_string(),
                        body: id.to_string(),
                        timestamp: at(seconds),
                    })
                    .collect(),
                page: 1,
            }));
            hub.complete(id.expect("load should carry an id"), Value::Null);
        });
        assert_eq!(loaded, Ok(()));

        let ids: Vec<_> = h
            .client
            .messages(&ConversationKey::from("u2"))
            .into_iter()
            .map(|message| message.id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_send_is_returned_and_announced() {
        let (h, mut hub) = signed_in().await;
        let mut notices = h
            .event_bus
            .subscribe("ui.notice.*")
            .expect("failed to subscribe notices");

        let (sent, _) = tokio::join!(h.client.send_group_message("g1", "hi"), async {
            let (id, _) = hub.expect_call().await;
            hub.reject(id.expect("send should carry an id"), "muted");
        });
        assert_matches!(
            sent,
            Err(HubError::RemoteInvocationFailed { reason, .. }) if reason == "muted"
        );
        assert_matches!(
            notices.try_recv().map(|event| event.payload),
            Some(EventPayload::SendFailed { conversation_key, .. })
                if conversation_key == ConversationKey::from("g1")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn keystrokes_notify_the_peer() {
        let (h, mut hub) = signed_in().await;

        h.client.keystroke("u2");
        assert_eq!(
            hub.expect_call().await,
            (
                None,
                HubCall::NotifyTyping {
                    to_user_id: "u2".to_string()
                }
            )
        );

        h.client.notify_stop_typing("u2");
        assert_eq!(
            hub.expect_call().await,
            (
                None,
                HubCall::NotifyStopTyping {
                    to_user_id: "u2".to_string()
                }
            )
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn remote_typing_and_presence_are_exposed() {
        let (h, hub) = signed_in().await;

        hub.push(InboundEvent::FullRoster(vec![
            OnlineUser::new("u2", "bob"),
            OnlineUser::new("u3", "carol"),
        ]));
        hub.push(InboundEvent::PresenceCount(12));
        hub.push(InboundEvent::Typing {
            username: "bob".to_string(),
        });
        eventually(|| h.client.typing_user().is_some()).await;

        assert_eq!(h.client.online_users().len(), 2);
        assert_eq!(h.client.online_count(), 12);
        assert_eq!(h.client.typing_user().as_deref(), Some("bob"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn activating_a_conversation_reconnects_with_the_stored_credential() {
        let mut credentials = MockCredentials::new();
        credentials
            .expect_get()
            .times(1)
            .return_const(Some(Credential::new("token-1", Some("u1".to_string()))));
        let h = harness(Arc::new(credentials));
        h.connector
            .script([Err(HubError::TransportUnavailable("offline".to_string()))]);
        let mut activated = h
            .event_bus
            .subscribe("ui.conversation.*")
            .expect("failed to subscribe conversation events");

        assert_eq!(h.client.start().await, ConnectionState::ConnectionFailed);
        h.client.set_active_conversation("u2");

        let mut hub = h.connector.accept().await;
        assert_eq!(hub.expect_call().await, (None, HubCall::RequestOnlineUsers));
        assert_eq!(h.client.connection_state(), ConnectionState::Connected);
        assert_eq!(h.connector.tokens(), vec!["token-1", "token-1"]);
        assert_matches!(
            activated.try_recv().map(|event| event.payload),
            Some(EventPayload::ActiveConversationChanged { conversation_key })
                if conversation_key == ConversationKey::from("u2")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shutdown_closes_the_connection_for_good() {
        let (h, hub) = signed_in().await;
        let mut states = h.client.watch_connection_state();

        h.client.shutdown().await;
        assert!(hub.client_closed());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

        h.client.set_active_conversation("u2");
        tokio::task::yield_now().await;
        assert_eq!(h.connector.connect_calls(), 1);
        assert_eq!(h.client.connection_state(), ConnectionState::Disconnected);
    }
}
