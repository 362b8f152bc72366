#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("hub transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The hub refused the credential. Retrying with the same one is pointless.
    #[error("hub rejected the credential: {0}")]
    Unauthorized(String),

    #[error("not connected to the hub")]
    NotConnected,

    #[error("hub call {operation} failed: {reason}")]
    RemoteInvocationFailed {
        operation: &'static str,
        reason: String,
    },

    #[error("malformed hub payload: {0}")]
    MalformedPayload(String),
}

impl HubError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportUnavailable(_))
    }

    pub(crate) fn invocation(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::RemoteInvocationFailed {
            operation,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(error: serde_json::Error) -> Self {
        Self::MalformedPayload(error.to_string())
    }
}
