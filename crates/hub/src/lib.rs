pub mod backoff;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backoff::ReconnectPolicy;
pub use connection::{
    ConnectionBuilder, ConnectionManager, ConnectionState, InboundHandler, Lifecycle,
};
pub use error::HubError;
pub use protocol::{HubCall, InboundEvent};
pub use transport::{ConnectionConfig, HubConnector, HubTransport, WebSocketConnector};
