//! Configuration for relays, clients and logging.
//!
//! Every section deserializes with defaults, so a TOML file only needs the
//! values it changes:
//!
//! ```toml
//! [server]
//! max_sessions = 10
//!
//! [logging]
//! level = "debug"
//! ```

use crate::error::{Error, Result};
use crate::frame::MAX_FRAME_PAYLOAD;
use crate::mux::BASE_WINDOW;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay settings
    pub server: ServerConfig,
    /// Client settings
    pub client: ClientConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Stream multiplexer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Bytes a peer may send on one stream before waiting for credit
    pub receive_window: u32,
    /// Largest data frame payload this side sends
    pub max_frame_payload: usize,
    /// Incoming streams queued before `accept_stream` picks them up
    pub accept_backlog: usize,
}

/// Relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Advertised session capacity (soft limit)
    pub max_sessions: usize,
    /// Session handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,
    /// Per-call discovery timeout in milliseconds
    pub discovery_timeout_ms: u64,
    /// Time allowed for reading a stream request or awaiting its response,
    /// in milliseconds
    pub request_timeout_ms: u64,
    /// Retry policy for discovery entry updates
    pub update_retry: RetryConfig,
    /// Multiplexer settings for accepted sessions
    pub mux: MuxConfig,
}

/// Client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay sessions to establish on startup
    pub min_sessions: usize,
    /// Session handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,
    /// Per-call discovery timeout in milliseconds
    pub discovery_timeout_ms: u64,
    /// Time to wait for a stream response in milliseconds
    pub request_timeout_ms: u64,
    /// Streams queued per listener before new requests are refused
    pub accept_queue_len: usize,
    /// Retry policy for `dial_with_retry`
    pub dial_retry: RetryConfig,
    /// Multiplexer settings for relay sessions
    pub mux: MuxConfig,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Colored output
    pub ansi: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            receive_window: BASE_WINDOW,
            max_frame_payload: 16 * 1024,
            accept_backlog: 64,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 2048,
            handshake_timeout_ms: 10_000,
            discovery_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            update_retry: RetryConfig::default(),
            mux: MuxConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            handshake_timeout_ms: 10_000,
            discovery_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            accept_queue_len: 20,
            dial_retry: RetryConfig::default(),
            mux: MuxConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::Config(msg.into().into())
}

fn require_nonzero(value: u64, name: &str) -> Result<()> {
    if value == 0 {
        return Err(invalid(format!("{name} must be greater than zero")));
    }
    Ok(())
}

impl MuxConfig {
    /// Check multiplexer limits
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.receive_window < BASE_WINDOW {
            return Err(invalid(format!(
                "mux receive_window must be at least {BASE_WINDOW}"
            )));
        }
        if self.max_frame_payload == 0 || self.max_frame_payload > MAX_FRAME_PAYLOAD {
            return Err(invalid(format!(
                "mux max_frame_payload must be between 1 and {MAX_FRAME_PAYLOAD}"
            )));
        }
        require_nonzero(self.accept_backlog as u64, "mux accept_backlog")
    }
}

impl ServerConfig {
    /// Session handshake timeout
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Per-call discovery timeout
    #[must_use]
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Request read and response timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Check relay settings
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on the first invalid field.
    pub fn validate(&self) -> Result<()> {
        require_nonzero(self.max_sessions as u64, "server max_sessions")?;
        require_nonzero(self.handshake_timeout_ms, "server handshake_timeout_ms")?;
        require_nonzero(self.discovery_timeout_ms, "server discovery_timeout_ms")?;
        require_nonzero(self.request_timeout_ms, "server request_timeout_ms")?;
        self.update_retry.validate()?;
        self.mux.validate()
    }
}

impl ClientConfig {
    /// Session handshake timeout
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Per-call discovery timeout
    #[must_use]
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Stream response timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Check client settings
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on the first invalid field.
    pub fn validate(&self) -> Result<()> {
        require_nonzero(self.min_sessions as u64, "client min_sessions")?;
        require_nonzero(self.handshake_timeout_ms, "client handshake_timeout_ms")?;
        require_nonzero(self.discovery_timeout_ms, "client discovery_timeout_ms")?;
        require_nonzero(self.request_timeout_ms, "client request_timeout_ms")?;
        require_nonzero(self.accept_queue_len as u64, "client accept_queue_len")?;
        self.dial_retry.validate()?;
        self.mux.validate()
    }
}

impl LoggingConfig {
    /// Build the filter, preferring `RUST_LOG` when set
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `level` is not a valid directive.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| invalid(format!("invalid log level '{}': {e}", self.level))),
        }
    }

    /// Install the global `tracing` subscriber
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the filter is invalid or a global
    /// subscriber is already installed.
    pub fn init(&self) -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter()?)
            .with_ansi(self.ansi)
            .try_init()
            .map_err(|e| invalid(format!("cannot install subscriber: {e}")))
    }
}

impl Config {
    /// Parse from TOML text
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if parsing or validation fails.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read, parsed or
    /// validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Validate every section
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.client.validate()?;
        self.logging.env_filter().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.max_sessions, 2048);
        assert_eq!(config.client.accept_queue_len, 20);
        assert_eq!(config.server.mux.receive_window, BASE_WINDOW);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
            [server]
            max_sessions = 10

            [client.dial_retry]
            max_retries = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.server.max_sessions, 10);
        assert_eq!(config.server.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.client.dial_retry.max_retries, 1);
        assert_eq!(config.client.dial_retry.initial_backoff_ms, 100);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_toml_str("[server]\nmax_sessions = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_toml_str("[client.mux]\nreceive_window = 1024\n").unwrap_err();
        assert!(err.to_string().contains("receive_window"));

        let err = Config::from_toml_str("[server.mux]\nmax_frame_payload = 1000000\n").unwrap_err();
        assert!(err.to_string().contains("max_frame_payload"));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        assert!(matches!(
            Config::from_toml_str("[server\nmax_sessions = 1"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\nmin_sessions = 3").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.client.min_sessions, 3);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path().join("absent.toml")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = Config::from_toml_str(&text).unwrap();
        assert_eq!(parsed.server.max_sessions, config.server.max_sessions);
        assert_eq!(parsed.client.mux, config.client.mux);
    }
}
