//! The single owner of the hub connection.
//!
//! A connect spawns one session task that owns the transport. It writes calls
//! submitted through [`ConnectionManager::invoke`] and
//! [`ConnectionManager::notify`], hands decoded events to the registered
//! [`InboundHandler`], and reconnects on its own after the link drops. State
//! transitions are serialized through the session slot so a stale task can
//! never overwrite the state of a newer one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use huddle_core::credentials::Credential;
use huddle_core::event::{EventBus, EventPayload, EventSource, emit};

use crate::error::HubError;
use crate::protocol::{ClientFrame, HubCall, InboundEvent, ServerFrame};
use crate::transport::{ConnectionConfig, HubConnector, HubTransport};

const CLIENT_DISCONNECT: &str = "disconnected by client";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// The last explicit connect did not succeed. Nothing retries from here.
    ConnectionFailed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Session boundaries, delivered to the handler in order with events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// A transport is up. `generation` increases with every (re)connect, so
    /// anything keyed on the previous one is stale.
    Connected { session_id: Uuid, generation: u64 },
    Reconnecting { attempt: u32 },
    Disconnected { reason: String },
}

/// Receives every decoded hub event. Calls arrive one at a time, in wire
/// order, from the session task; implementations must not block.
pub trait InboundHandler: Send + Sync + 'static {
    fn on_event(&self, event: InboundEvent);

    fn on_lifecycle(&self, _lifecycle: Lifecycle) {}
}

pub struct Unregistered;

pub struct Registered(Arc<dyn InboundHandler>);

/// Two-phase construction: the handler must be registered before the manager
/// exists, so no event can arrive without somewhere to go.
pub struct ConnectionBuilder<C, H> {
    config: ConnectionConfig,
    connector: C,
    event_bus: Option<Arc<dyn EventBus>>,
    scope: Option<CancellationToken>,
    handler: H,
}

impl<C, H> ConnectionBuilder<C, H> {
    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Parent scope; cancelling it tears down every session of this manager.
    pub fn cancellation_scope(mut self, scope: CancellationToken) -> Self {
        self.scope = Some(scope);
        self
    }
}

impl<C: HubConnector> ConnectionBuilder<C, Unregistered> {
    pub fn on_event(self, handler: Arc<dyn InboundHandler>) -> ConnectionBuilder<C, Registered> {
        ConnectionBuilder {
            config: self.config,
            connector: self.connector,
            event_bus: self.event_bus,
            scope: self.scope,
            handler: Registered(handler),
        }
    }
}

impl<C: HubConnector> ConnectionBuilder<C, Registered> {
    pub fn build(self) -> ConnectionManager<C> {
        let Registered(handler) = self.handler;
        ConnectionManager {
            inner: Arc::new(Inner {
                config: self.config,
                connector: self.connector,
                handler,
                event_bus: self.event_bus,
                scope: self.scope.unwrap_or_default(),
                state: watch::Sender::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                session_seq: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                invocation_seq: AtomicU64::new(0),
            }),
        }
    }
}

pub struct ConnectionManager<C: HubConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: HubConnector> ConnectionManager<C> {
    pub fn builder(config: ConnectionConfig, connector: C) -> ConnectionBuilder<C, Unregistered> {
        ConnectionBuilder {
            config,
            connector,
            event_bus: None,
            scope: None,
            handler: Unregistered,
        }
    }

    /// Opens a session unless one is already open or being opened. Never
    /// fails: a refused or timed-out attempt settles at
    /// [`ConnectionState::ConnectionFailed`], which is returned.
    pub async fn connect(&self, credential: &Credential) -> ConnectionState {
        let Some((seq, cancel)) = self.inner.claim() else {
            debug!(state = ?self.state(), "connect ignored");
            return self.state();
        };

        let inner = &self.inner;
        info!(url = %inner.config.url, "connecting to hub");
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(
                inner.config.connect_timeout,
                inner.connector.connect(&inner.config, credential),
            ) => Some(result),
        };

        let mut transport = match attempt {
            None => {
                inner.settle_disconnected(Some(seq), CLIENT_DISCONNECT);
                return self.state();
            }
            Some(Err(_elapsed)) => {
                inner.fail(
                    seq,
                    HubError::TransportUnavailable(format!(
                        "connect timed out after {:?}",
                        inner.config.connect_timeout
                    )),
                );
                return self.state();
            }
            Some(Ok(Err(error))) => {
                inner.fail(seq, error);
                return self.state();
            }
            Some(Ok(Ok(transport))) => transport,
        };

        let (commands, receiver) = mpsc::unbounded_channel();
        let (session_id, generation) = inner.begin_generation();
        if !inner.install(seq, commands) {
            if let Err(error) = transport.close().await {
                debug!(%error, "closing abandoned transport");
            }
            inner.settle_disconnected(Some(seq), CLIENT_DISCONNECT);
            return self.state();
        }
        inner.announce_connected(session_id, generation);

        let task = tokio::spawn(run_session(
            inner.clone(),
            seq,
            transport,
            receiver,
            cancel,
            credential.clone(),
        ));
        if let Some(session) = inner.lock_session().as_mut().filter(|s| s.seq == seq) {
            session.task = Some(task);
        }
        self.state()
    }

    /// Sends `call` and waits for the hub to complete it.
    pub async fn invoke(&self, call: HubCall) -> Result<Value, HubError> {
        let operation = call.target();
        let id = self.inner.invocation_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply, response) = oneshot::channel();
        self.inner.submit(Command::Invoke { id, call, reply })?;

        match tokio::time::timeout(self.inner.config.invoke_timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(HubError::invocation(operation, "session ended before completion")),
            Err(_) => Err(HubError::invocation(operation, "timed out waiting for completion")),
        }
    }

    /// Queues `call` without asking for a completion.
    pub fn notify(&self, call: HubCall) -> Result<(), HubError> {
        self.inner.submit(Command::Notify(call))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Ends the current session, if any, and waits for its task to finish.
    /// A later [`connect`](Self::connect) starts afresh.
    pub async fn disconnect(&self) {
        let session = self.inner.lock_session().take();
        if let Some(session) = session {
            session.cancel.cancel();
            if let Some(task) = session.task {
                if let Err(error) = task.await {
                    error!(%error, "hub session task failed");
                }
            }
        }
        self.inner.settle_disconnected(None, CLIENT_DISCONNECT);
    }

    /// Disconnects and refuses any further connect.
    pub async fn shutdown(&self) {
        self.inner.scope.cancel();
        self.disconnect().await;
    }
}

impl<C: HubConnector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(session) = self.inner.lock_session().take() {
            session.cancel.cancel();
        }
    }
}

struct Inner<C> {
    config: ConnectionConfig,
    connector: C,
    handler: Arc<dyn InboundHandler>,
    event_bus: Option<Arc<dyn EventBus>>,
    scope: CancellationToken,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    session_seq: AtomicU64,
    generation: AtomicU64,
    invocation_seq: AtomicU64,
}

struct Session {
    seq: u64,
    cancel: CancellationToken,
    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
}

enum Command {
    Invoke {
        id: u64,
        call: HubCall,
        reply: oneshot::Sender<Result<Value, HubError>>,
    },
    Notify(HubCall),
}

impl<C: HubConnector> Inner<C> {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `Connecting` and reserves the session slot, if no session is
    /// open or being opened.
    fn claim(&self) -> Option<(u64, CancellationToken)> {
        let mut slot = self.lock_session();
        if self.scope.is_cancelled() {
            return None;
        }
        let claimed = self.state.send_if_modified(|state| {
            if matches!(
                state,
                ConnectionState::Disconnected | ConnectionState::ConnectionFailed
            ) {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return None;
        }

        let seq = self.session_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.scope.child_token();
        *slot = Some(Session {
            seq,
            cancel: cancel.clone(),
            commands: None,
            task: None,
        });
        Some((seq, cancel))
    }

    fn begin_generation(&self) -> (Uuid, u64) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        (Uuid::new_v4(), generation)
    }

    fn owns_slot(slot: &Option<Session>, seq: u64) -> bool {
        slot.as_ref()
            .is_some_and(|session| session.seq == seq && !session.cancel.is_cancelled())
    }

    fn install(&self, seq: u64, commands: mpsc::UnboundedSender<Command>) -> bool {
        let mut slot = self.lock_session();
        if !Self::owns_slot(&slot, seq) {
            return false;
        }
        if let Some(session) = slot.as_mut() {
            session.commands = Some(commands);
        }
        self.state.send_replace(ConnectionState::Connected);
        true
    }

    fn resume(&self, seq: u64) -> bool {
        let slot = self.lock_session();
        if !Self::owns_slot(&slot, seq) {
            return false;
        }
        self.state.send_replace(ConnectionState::Connected);
        true
    }

    fn reconnecting(&self, seq: u64, attempt: u32) -> bool {
        {
            let slot = self.lock_session();
            if !Self::owns_slot(&slot, seq) {
                return false;
            }
            self.state
                .send_replace(ConnectionState::Reconnecting { attempt });
        }
        info!(attempt, "reconnecting to hub");
        self.handler
            .on_lifecycle(Lifecycle::Reconnecting { attempt });
        self.emit(
            "system.connection.reconnecting",
            EventPayload::ConnectionReconnecting { attempt },
        );
        true
    }

    fn announce_connected(&self, session_id: Uuid, generation: u64) {
        info!(%session_id, generation, "hub connection established");
        self.handler.on_lifecycle(Lifecycle::Connected {
            session_id,
            generation,
        });
        self.emit(
            "system.connection.established",
            EventPayload::ConnectionEstablished {
                session_id,
                generation,
            },
        );
    }

    /// Settles at `Disconnected`. A session task passes its own `seq` and only
    /// acts while it still owns the slot; an explicit caller passes `None` and
    /// only acts while no newer session has claimed it.
    fn settle_disconnected(&self, seq: Option<u64>, reason: &str) {
        let changed = {
            let mut slot = self.lock_session();
            match seq {
                Some(seq) if slot.as_ref().map(|session| session.seq) == Some(seq) => {
                    *slot = None;
                }
                Some(_) => return,
                None if slot.is_some() => return,
                None => {}
            }
            self.state.send_if_modified(|state| {
                if *state == ConnectionState::Disconnected {
                    false
                } else {
                    *state = ConnectionState::Disconnected;
                    true
                }
            })
        };
        if !changed {
            return;
        }

        info!(reason, "hub connection closed");
        self.handler.on_lifecycle(Lifecycle::Disconnected {
            reason: reason.to_string(),
        });
        self.emit(
            "system.connection.lost",
            EventPayload::ConnectionLost {
                reason: reason.to_string(),
                will_retry: false,
            },
        );
    }

    fn fail(&self, seq: u64, error: HubError) {
        {
            let mut slot = self.lock_session();
            if slot.as_ref().map(|session| session.seq) != Some(seq) {
                return;
            }
            *slot = None;
            self.state.send_replace(ConnectionState::ConnectionFailed);
        }
        warn!(%error, "hub connection failed");
        self.emit(
            "system.connection.failed",
            EventPayload::ConnectionFailed {
                reason: error.to_string(),
            },
        );
        self.emit_error(&error);
    }

    fn submit(&self, command: Command) -> Result<(), HubError> {
        if !self.state.borrow().is_connected() {
            return Err(HubError::NotConnected);
        }
        let slot = self.lock_session();
        let commands = slot
            .as_ref()
            .and_then(|session| session.commands.as_ref())
            .ok_or(HubError::NotConnected)?;
        commands.send(command).map_err(|_| HubError::NotConnected)
    }

    /// Routes one inbound frame. Returns the reason when the hub announced it
    /// is closing the connection.
    fn dispatch(&self, raw: &str, pending: &mut PendingCalls) -> Option<String> {
        let frame = match ServerFrame::from_json(raw) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "dropping malformed hub frame");
                return None;
            }
        };

        match frame {
            ServerFrame::Event { target, arguments } => {
                match InboundEvent::decode(&target, arguments) {
                    Ok(event) => {
                        trace!(event = event.target(), "hub event");
                        self.handler.on_event(event);
                    }
                    Err(error) => warn!(%target, %error, "dropping malformed hub event"),
                }
            }
            ServerFrame::Completion {
                invocation_id,
                result,
                error,
            } => pending.complete(invocation_id, result, error),
            ServerFrame::Close { error } => {
                return Some(error.unwrap_or_else(|| "hub closed the connection".to_string()));
            }
        }
        None
    }

    fn emit_error(&self, error: &HubError) {
        self.emit(
            "system.error.occurred",
            EventPayload::ErrorOccurred {
                component: "connection".to_string(),
                message: error.to_string(),
                recoverable: error.is_retryable(),
            },
        );
    }

    fn emit(&self, channel_name: &str, payload: EventPayload) {
        if let Some(event_bus) = &self.event_bus {
            emit(event_bus.as_ref(), channel_name, EventSource::Hub, payload);
        }
    }
}

struct PendingCall {
    operation: &'static str,
    reply: oneshot::Sender<Result<Value, HubError>>,
}

#[derive(Default)]
struct PendingCalls(HashMap<u64, PendingCall>);

impl PendingCalls {
    fn insert(&mut self, id: u64, call: PendingCall) {
        // Callers that timed out have dropped their receiver.
        self.0.retain(|_, pending| !pending.reply.is_closed());
        self.0.insert(id, call);
    }

    fn complete(&mut self, id: u64, result: Option<Value>, error: Option<String>) {
        let Some(pending) = self.0.remove(&id) else {
            debug!(invocation_id = id, "completion for unknown or abandoned invocation");
            return;
        };
        let outcome = match error {
            Some(reason) => Err(HubError::invocation(pending.operation, reason)),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = pending.reply.send(outcome);
    }

    fn fail_all(&mut self, reason: &str) {
        for (_, pending) in self.0.drain() {
            let _ = pending
                .reply
                .send(Err(HubError::invocation(pending.operation, reason)));
        }
    }
}

enum SessionEnd {
    Closed,
    Lost(String),
}

async fn run_session<C: HubConnector>(
    inner: Arc<Inner<C>>,
    seq: u64,
    mut transport: C::Transport,
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    credential: Credential,
) {
    let mut pending = PendingCalls::default();
    loop {
        let end = drive(&inner, &mut transport, &mut commands, &cancel, &mut pending).await;
        let reason = match end {
            SessionEnd::Closed => {
                pending.fail_all("session closed");
                if let Err(error) = transport.close().await {
                    debug!(%error, "closing hub transport");
                }
                inner.settle_disconnected(Some(seq), CLIENT_DISCONNECT);
                return;
            }
            SessionEnd::Lost(reason) => reason,
        };

        pending.fail_all("connection lost before completion");
        warn!(%reason, "hub connection lost");
        inner.emit(
            "system.connection.lost",
            EventPayload::ConnectionLost {
                reason,
                will_retry: true,
            },
        );
        match reconnect(&inner, seq, &cancel, &credential).await {
            Some(next) => transport = next,
            None => return,
        }
    }
}

/// Runs one connection generation until it is lost or the session is closed.
async fn drive<C: HubConnector>(
    inner: &Inner<C>,
    transport: &mut C::Transport,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    cancel: &CancellationToken,
    pending: &mut PendingCalls,
) -> SessionEnd {
    // Every generation starts from a fresh roster.
    let roster = Command::Notify(HubCall::RequestOnlineUsers);
    if let Err(error) = execute(transport, roster, pending).await {
        return SessionEnd::Lost(error.to_string());
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionEnd::Closed,
            command = commands.recv() => {
                let Some(command) = command else {
                    return SessionEnd::Closed;
                };
                if let Err(error) = execute(transport, command, pending).await {
                    if error.is_retryable() {
                        return SessionEnd::Lost(error.to_string());
                    }
                    warn!(%error, "dropping hub call");
                }
            }
            frame = transport.recv() => match frame {
                Ok(Some(raw)) => {
                    if let Some(reason) = inner.dispatch(&raw, pending) {
                        return SessionEnd::Lost(reason);
                    }
                }
                Ok(None) => return SessionEnd::Lost("hub closed the connection".to_string()),
                Err(error) => return SessionEnd::Lost(error.to_string()),
            },
        }
    }
}

async fn execute<T: HubTransport>(
    transport: &mut T,
    command: Command,
    pending: &mut PendingCalls,
) -> Result<(), HubError> {
    match command {
        Command::Notify(call) => {
            let frame = ClientFrame::invocation(None, &call).to_json()?;
            transport.send(frame).await
        }
        Command::Invoke { id, call, reply } => {
            let frame = match ClientFrame::invocation(Some(id), &call).to_json() {
                Ok(frame) => frame,
                Err(error) => {
                    let _ = reply.send(Err(error));
                    return Ok(());
                }
            };
            pending.insert(
                id,
                PendingCall {
                    operation: call.target(),
                    reply,
                },
            );
            // On failure the caller is answered by `fail_all`.
            transport.send(frame).await
        }
    }
}

/// Retries until a transport is up, the window is used up, the credential is
/// refused, or the session is cancelled. Only the first case returns.
async fn reconnect<C: HubConnector>(
    inner: &Inner<C>,
    seq: u64,
    cancel: &CancellationToken,
    credential: &Credential,
) -> Option<C::Transport> {
    let lost_at = Instant::now();
    let mut retries = 0_u32;

    loop {
        let Some(delay) = inner.config.reconnect.next_delay(retries, lost_at.elapsed()) else {
            inner.settle_disconnected(Some(seq), "reconnect window exhausted");
            return None;
        };
        retries = retries.saturating_add(1);
        if !inner.reconnecting(seq, retries) {
            return None;
        }

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = async {
                tokio::time::sleep(delay).await;
                tokio::time::timeout(
                    inner.config.connect_timeout,
                    inner.connector.connect(&inner.config, credential),
                )
                .await
            } => Some(result),
        };

        match attempt {
            None => {
                inner.settle_disconnected(Some(seq), CLIENT_DISCONNECT);
                return None;
            }
            Some(Ok(Ok(transport))) => {
                let (session_id, generation) = inner.begin_generation();
                if !inner.resume(seq) {
                    return None;
                }
                inner.announce_connected(session_id, generation);
                return Some(transport);
            }
            Some(Ok(Err(error))) if !error.is_retryable() => {
                warn!(attempt = retries, %error, "reconnect refused");
                inner.emit_error(&error);
                inner.settle_disconnected(Some(seq), &error.to_string());
                return None;
            }
            Some(Ok(Err(error))) => warn!(attempt = retries, %error, "reconnect attempt failed"),
            Some(Err(_elapsed)) => warn!(attempt = retries, "reconnect attempt timed out"),
        }
    }
}
