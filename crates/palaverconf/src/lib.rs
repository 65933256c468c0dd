//! Broker connection settings for Palaver services.
//!
//! This crate carries the full set of MQTT connection parameters a service
//! needs to reach its broker, plus three loaders for the places those
//! parameters actually live:
//!
//! - a `;`-separated connection string (`HostName=broker;TcpPort=1883;...`),
//! - environment variables with the `AIO_` prefix (`AIO_HOST_NAME`, ...),
//! - a file-mount directory with one file per setting, as produced by
//!   container secret mounts.
//!
//! Values are validated up front so misconfiguration fails at startup, not
//! mid-connection. Secrets are never held here directly; password, key,
//! and token settings are file paths read by the MQTT client at connect
//! time.
//!
//! # Usage
//!
//! ```rust
//! use palaverconf::ConnectionSettings;
//!
//! let settings = ConnectionSettings::from_connection_string(
//!     "HostName=broker.example;ClientId=oven-7;UseTls=true",
//! ).unwrap();
//! assert_eq!(settings.tcp_port, 8883);
//! assert_eq!(settings.keep_alive.as_secs(), 60);
//! ```

use std::path::PathBuf;
use std::time::Duration;

mod loader;

pub const DEFAULT_TCP_PORT: u16 = 8883;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
pub const DEFAULT_SESSION_EXPIRY: Duration = Duration::from_secs(3600);

/// Everything needed to open (and re-open) the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host_name: String,
    pub tcp_port: u16,
    pub use_tls: bool,
    pub ca_file: Option<PathBuf>,
    /// Applies to the first connect only; reconnects always resume the
    /// persistent session.
    pub clean_start: bool,
    pub keep_alive: Duration,
    pub client_id: String,
    pub session_expiry: Duration,
    pub username: Option<String>,
    pub password_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub key_password_file: Option<PathBuf>,
    /// Token-based auth; mutually exclusive with `password_file`.
    pub sat_auth_file: Option<PathBuf>,
}

/// Why settings failed to load.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("required setting {key} is missing")]
    MissingValue { key: &'static str },
    #[error("setting {key} has invalid value {value:?}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("unknown setting {key:?}")]
    UnknownKey { key: String },
    #[error("settings {a} and {b} are mutually exclusive")]
    MutuallyExclusive { a: &'static str, b: &'static str },
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
}
