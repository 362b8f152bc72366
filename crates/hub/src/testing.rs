//! In-process stand-in for the hub, for tests in this and downstream crates.
//!
//! [`FakeConnector`] hands out [`FakeTransport`]s; for every successful
//! connect the test side gets the matching [`FakeHub`] from
//! [`FakeConnector::accept`] and plays the server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use huddle_core::credentials::Credential;

use crate::connection::{InboundHandler, Lifecycle};
use crate::error::HubError;
use crate::protocol::{ClientFrame, HubCall, InboundEvent, ServerFrame};
use crate::transport::{ConnectionConfig, HubConnector, HubTransport};

const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ConnectorState {
    outcomes: VecDeque<Result<(), HubError>>,
    connect_calls: u32,
    tokens: Vec<String>,
    accepted: VecDeque<FakeHub>,
}

/// Cloneable: keep one clone in the test to script outcomes and accept hubs.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
    accepted: Arc<Notify>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for upcoming connects; once drained, connects succeed.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<(), HubError>>) {
        self.lock().outcomes.extend(outcomes);
    }

    pub fn connect_calls(&self) -> u32 {
        self.lock().connect_calls
    }

    pub fn tokens(&self) -> Vec<String> {
        self.lock().tokens.clone()
    }

    /// The hub side of the next successful connect.
    pub async fn accept(&self) -> FakeHub {
        let wait = async {
            loop {
                let notified = self.accepted.notified();
                if let Some(hub) = self.lock().accepted.pop_front() {
                    return hub;
                }
                notified.await;
            }
        };
        tokio::time::timeout(EXPECT_TIMEOUT, wait)
            .await
            .expect("timed out waiting for a connection")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HubConnector for FakeConnector {
    type Transport = FakeTransport;

    async fn connect(
        &self,
        _config: &ConnectionConfig,
        credential: &Credential,
    ) -> Result<FakeTransport, HubError> {
        let (transport, hub) = {
            let mut state = self.lock();
            state.connect_calls += 1;
            state.tokens.push(credential.token.clone());
            state.outcomes.pop_front().unwrap_or(Ok(()))?;
            let (transport, hub) = FakeTransport::pair();
            (transport, hub)
        };
        self.lock().accepted.push_back(hub);
        self.accepted.notify_one();
        Ok(transport)
    }
}

pub struct FakeTransport {
    to_hub: mpsc::UnboundedSender<String>,
    from_hub: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

impl FakeTransport {
    fn pair() -> (Self, FakeHub) {
        let (to_hub, from_client) = mpsc::unbounded_channel();
        let (to_client, from_hub) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Self {
            to_hub,
            from_hub,
            closed: closed.clone(),
        };
        let hub = FakeHub {
            from_client,
            to_client: Some(to_client),
            closed,
        };
        (transport, hub)
    }
}

impl HubTransport for FakeTransport {
    async fn send(&mut self, frame: String) -> Result<(), HubError> {
        self.to_hub
            .send(frame)
            .map_err(|_| HubError::TransportUnavailable("fake hub went away".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, HubError> {
        Ok(self.from_hub.recv().await)
    }

    async fn close(&mut self) -> Result<(), HubError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Server end of one fake connection.
pub struct FakeHub {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<String>>,
    closed: Arc<AtomicBool>,
}

impl FakeHub {
    /// Next invocation from the client, panicking after a timeout.
    pub async fn expect_call(&mut self) -> (Option<u64>, HubCall) {
        tokio::time::timeout(EXPECT_TIMEOUT, self.next_call())
            .await
            .expect("timed out waiting for a client call")
            .expect("client connection closed")
    }

    pub async fn next_call(&mut self) -> Option<(Option<u64>, HubCall)> {
        let raw = self.from_client.recv().await?;
        Some(decode_call(&raw))
    }

    pub fn try_next_call(&mut self) -> Option<(Option<u64>, HubCall)> {
        let raw = self.from_client.try_recv().ok()?;
        Some(decode_call(&raw))
    }

    pub fn push(&self, event: InboundEvent) {
        let frame = event.to_frame().expect("event should encode");
        self.send_frame(&frame);
    }

    pub fn push_raw(&self, raw: impl Into<String>) {
        if let Some(sender) = &self.to_client {
            let _ = sender.send(raw.into());
        }
    }

    pub fn complete(&self, invocation_id: u64, result: Value) {
        self.send_frame(&ServerFrame::Completion {
            invocation_id,
            result: Some(result),
            error: None,
        });
    }

    pub fn reject(&self, invocation_id: u64, error: impl Into<String>) {
        self.send_frame(&ServerFrame::Completion {
            invocation_id,
            result: None,
            error: Some(error.into()),
        });
    }

    /// Simulates the network dropping: the client sees the stream end.
    pub fn drop_connection(&mut self) {
        self.to_client = None;
    }

    /// Whether the client closed its end deliberately.
    pub fn client_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send_frame(&self, frame: &ServerFrame) {
        self.push_raw(frame.to_json().expect("frame should encode"));
    }
}

fn decode_call(raw: &str) -> (Option<u64>, HubCall) {
    let ClientFrame::Invocation {
        invocation_id,
        target,
        arguments,
    } = ClientFrame::from_json(raw).expect("client sent a malformed frame");
    let call = HubCall::decode(&target, arguments).expect("client sent an unknown call");
    (invocation_id, call)
}

/// Polls `condition` until it holds, panicking after a timeout.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(EXPECT_TIMEOUT, poll)
        .await
        .expect("condition never held");
}

/// Handler that records everything it is given.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<InboundEvent>>,
    lifecycle: Mutex<Vec<Lifecycle>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<InboundEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lifecycle(&self) -> Vec<Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl InboundHandler for RecordingHandler {
    fn on_event(&self, event: InboundEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn on_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(lifecycle);
    }
}
