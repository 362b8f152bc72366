use std::future::Future;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use huddle_core::config::Config;
use huddle_core::credentials::Credential;

use crate::backoff::ReconnectPolicy;
use crate::error::HubError;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub invoke_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.hub.url.clone(),
            connect_timeout: config.hub.connect_timeout(),
            invoke_timeout: config.hub.invoke_timeout(),
            reconnect: ReconnectPolicy::from(&config.reconnect),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One established, bidirectional hub connection carrying JSON text frames.
pub trait HubTransport: Send + 'static {
    fn send(&mut self, frame: String) -> impl Future<Output = Result<(), HubError>> + Send;

    /// Next text frame; `Ok(None)` once the hub has closed the stream. Must be
    /// cancel-safe: it is polled inside `select!`.
    fn recv(&mut self) -> impl Future<Output = Result<Option<String>, HubError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), HubError>> + Send;
}

/// Opens transports. Owned by the connection manager, which is the only thing
/// allowed to call it.
pub trait HubConnector: Send + Sync + 'static {
    type Transport: HubTransport;

    fn connect(
        &self,
        config: &ConnectionConfig,
        credential: &Credential,
    ) -> impl Future<Output = Result<Self::Transport, HubError>> + Send;
}

/// Dials the hub over WebSocket, presenting the credential as a bearer token.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl HubConnector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn connect(
        &self,
        config: &ConnectionConfig,
        credential: &Credential,
    ) -> Result<WebSocketTransport, HubError> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|error| HubError::TransportUnavailable(format!("invalid hub url: {error}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token))
            .map_err(|_| HubError::Unauthorized("token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        match connect_async(request).await {
            Ok((stream, response)) => {
                debug!(url = %config.url, status = %response.status(), "hub websocket established");
                Ok(WebSocketTransport { stream })
            }
            Err(WsError::Http(response))
                if matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) =>
            {
                Err(HubError::Unauthorized(format!(
                    "handshake refused with {}",
                    response.status()
                )))
            }
            Err(error) => Err(HubError::TransportUnavailable(error.to_string())),
        }
    }
}

impl HubTransport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> Result<(), HubError> {
        self.stream
            .send(Message::text(frame))
            .await
            .map_err(|error| HubError::TransportUnavailable(error.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, HubError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(error)) => return Err(HubError::TransportUnavailable(error.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => warn!(len = bytes.len(), "dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "hub closed the websocket");
                    return Ok(None);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), HubError> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(error) => Err(HubError::TransportUnavailable(error.to_string())),
        }
    }
}
