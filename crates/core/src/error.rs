use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, HuddleError>;

#[derive(Debug, thiserror::Error)]
pub enum HuddleError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("credential store error: {0}")]
    Credentials(#[from] CredentialError),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("no platform config directory available")]
    NoConfigDir,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential file i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(String),

    #[error("event bus closed")]
    ChannelClosed,

    #[error("subscriber lagged, {0} events dropped")]
    Lagged(u64),
}
