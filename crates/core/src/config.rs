use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Environment variable overriding `hub.url`.
pub const HUB_URL_ENV: &str = "HUDDLE_HUB_URL";

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hub: HubConfig,
    pub reconnect: ReconnectConfig,
    pub typing: TypingConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub url: String,
    pub connect_timeout_seconds: u64,
    pub invoke_timeout_seconds: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: "wss://localhost:7001/chatHub".to_string(),
            connect_timeout_seconds: 15,
            invoke_timeout_seconds: 30,
        }
    }
}

impl HubConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_seconds)
    }
}

/// Linear backoff: retry `n` waits `min(increment * (n + 1), ceiling)`, and
/// no retry starts once `window` has elapsed since the connection was lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub increment_ms: u64,
    pub ceiling_ms: u64,
    pub window_seconds: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            increment_ms: 1_000,
            ceiling_ms: 5_000,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingConfig {
    /// How long a remote typing indicator stays up without a new signal.
    pub quiet_window_ms: u64,
    /// Local inactivity after which we tell the peer we stopped typing.
    pub local_idle_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            quiet_window_ms: 3_000,
            local_idle_ms: 1_000,
        }
    }
}

impl TypingConfig {
    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }

    pub fn local_idle(&self) -> Duration {
        Duration::from_millis(self.local_idle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Live messages kept per conversation; `0` keeps everything.
    pub max_messages_per_conversation: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_messages_per_conversation: 2_000,
        }
    }
}

impl StoreConfig {
    pub fn retention(&self) -> Option<usize> {
        (self.max_messages_per_conversation > 0).then_some(self.max_messages_per_conversation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_toml_str(&raw)
    }

    /// Loads `path` if given, otherwise the platform config file if it
    /// exists, otherwise defaults; then applies environment overrides.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => match default_config_path() {
                Ok(path) if path.exists() => Self::load(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(HUB_URL_ENV).filter(|url| !url.is_empty()) {
            debug!(%url, "hub url overridden from environment");
            self.hub.url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.hub.url.starts_with("ws://") || self.hub.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                field: "hub.url",
                reason: format!("expected a ws:// or wss:// url, got {:?}", self.hub.url),
            });
        }
        if self.reconnect.increment_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "reconnect.increment_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.reconnect.ceiling_ms < self.reconnect.increment_ms {
            return Err(ConfigError::Invalid {
                field: "reconnect.ceiling_ms",
                reason: "must not be smaller than reconnect.increment_ms".to_string(),
            });
        }
        Ok(())
    }
}

pub fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("chat", "huddle", "huddle").ok_or(ConfigError::NoConfigDir)
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.config_dir().join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_match_hub_client_behaviour() {
        let config = Config::default();
        assert_eq!(config.hub.connect_timeout(), Duration::from_secs(15));
        assert_eq!(config.reconnect.increment_ms, 1_000);
        assert_eq!(config.reconnect.ceiling_ms, 5_000);
        assert_eq!(config.reconnect.window_seconds, 60);
        assert_eq!(config.typing.quiet_window(), Duration::from_secs(3));
        assert_eq!(config.store.retention(), Some(2_000));
        config.validate().expect("defaults should validate");
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let config = Config::from_toml_str(
            r#"
            [hub]
            url = "ws://127.0.0.1:9000/hub"

            [typing]
            quiet_window_ms = 500
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.hub.url, "ws://127.0.0.1:9000/hub");
        assert_eq!(config.hub.invoke_timeout_seconds, 30);
        assert_eq!(config.typing.quiet_window_ms, 500);
        assert_eq!(config.typing.local_idle_ms, 1_000);
    }

    #[test]
    fn zero_retention_disables_the_cap() {
        let config = Config::from_toml_str("[store]\nmax_messages_per_conversation = 0\n").unwrap();
        assert_eq!(config.store.retention(), None);
    }

    #[test]
    fn rejects_non_websocket_url() {
        let result = Config::from_toml_str("[hub]\nurl = \"https://example.com/hub\"\n");
        assert_matches!(result, Err(ConfigError::Invalid { field: "hub.url", .. }));
    }

    #[test]
    fn rejects_ceiling_below_increment() {
        let result =
            Config::from_toml_str("[reconnect]\nincrement_ms = 2000\nceiling_ms = 1000\n");
        assert_matches!(
            result,
            Err(ConfigError::Invalid {
                field: "reconnect.ceiling_ms",
                ..
            })
        );
    }

    #[test]
    fn env_override_replaces_hub_url() {
        let mut config = Config::default();
        config.apply_env_overrides(|name| {
            (name == HUB_URL_ENV).then(|| "ws://override:1234/hub".to_string())
        });
        assert_eq!(config.hub.url, "ws://override:1234/hub");
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nfilter = \"huddle=debug\"").unwrap();

        let config = Config::load(file.path()).expect("config should load");
        assert_eq!(config.logging.filter, "huddle=debug");
    }

    #[test]
    fn load_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert_matches!(Config::load(&path), Err(ConfigError::Read { path: p, .. }) if p == path);
    }
}
