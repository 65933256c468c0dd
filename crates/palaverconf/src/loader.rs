//! Connection-setting discovery: connection string, environment, file mount.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{
    ConnectionSettings, SettingsError, DEFAULT_KEEP_ALIVE, DEFAULT_SESSION_EXPIRY,
    DEFAULT_TCP_PORT,
};

/// Canonical setting keys, as they appear in connection strings and as
/// file names in a settings mount.
const KEY_HOST_NAME: &str = "HostName";
const KEY_TCP_PORT: &str = "TcpPort";
const KEY_USE_TLS: &str = "UseTls";
const KEY_CA_FILE: &str = "CaFile";
const KEY_CLEAN_START: &str = "CleanStart";
const KEY_KEEP_ALIVE: &str = "KeepAlive";
const KEY_CLIENT_ID: &str = "ClientId";
const KEY_SESSION_EXPIRY: &str = "SessionExpiry";
const KEY_USERNAME: &str = "Username";
const KEY_PASSWORD_FILE: &str = "PasswordFile";
const KEY_CERT_FILE: &str = "CertFile";
const KEY_KEY_FILE: &str = "KeyFile";
const KEY_KEY_PASSWORD_FILE: &str = "KeyPasswordFile";
const KEY_SAT_AUTH_FILE: &str = "SatAuthFile";

const ALL_KEYS: &[&str] = &[
    KEY_HOST_NAME,
    KEY_TCP_PORT,
    KEY_USE_TLS,
    KEY_CA_FILE,
    KEY_CLEAN_START,
    KEY_KEEP_ALIVE,
    KEY_CLIENT_ID,
    KEY_SESSION_EXPIRY,
    KEY_USERNAME,
    KEY_PASSWORD_FILE,
    KEY_CERT_FILE,
    KEY_KEY_FILE,
    KEY_KEY_PASSWORD_FILE,
    KEY_SAT_AUTH_FILE,
];

/// Environment variable for a key: `AIO_` plus the key in upper snake case
/// (`HostName` becomes `AIO_HOST_NAME`).
fn env_var_name(key: &str) -> String {
    let mut name = String::from("AIO");
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            name.push('_');
        }
        name.push(ch.to_ascii_uppercase());
    }
    name
}

fn canonical_key(raw: &str) -> Option<&'static str> {
    ALL_KEYS
        .iter()
        .find(|key| key.eq_ignore_ascii_case(raw))
        .copied()
}

impl ConnectionSettings {
    /// Parse a `;`-separated `Key=Value` connection string. Keys are
    /// case-insensitive; unknown keys are rejected.
    pub fn from_connection_string(s: &str) -> Result<Self, SettingsError> {
        let mut values = HashMap::new();
        for segment in s.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (raw_key, value) =
                segment
                    .split_once('=')
                    .ok_or_else(|| SettingsError::InvalidValue {
                        key: segment.to_string(),
                        value: String::new(),
                        reason: "expected Key=Value".to_string(),
                    })?;
            let key = canonical_key(raw_key.trim()).ok_or_else(|| SettingsError::UnknownKey {
                key: raw_key.trim().to_string(),
            })?;
            values.insert(key, value.trim().to_string());
        }
        Self::from_values(values)
    }

    /// Load from `AIO_`-prefixed environment variables.
    pub fn from_environment() -> Result<Self, SettingsError> {
        Self::from_env_lookup(|name| std::env::var(name).ok())
    }

    fn from_env_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SettingsError> {
        let mut values = HashMap::new();
        for key in ALL_KEYS {
            if let Some(value) = lookup(&env_var_name(key)) {
                values.insert(*key, value);
            }
        }
        Self::from_values(values)
    }

    /// Load from a mount directory with one file per setting, named after
    /// the setting key. Hidden files and unrecognized names are skipped;
    /// mounts are often shared with other consumers.
    pub fn from_file_mount(dir: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|source| SettingsError::FileRead {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut values = HashMap::new();
        for entry in entries {
            let entry = entry.map_err(|source| SettingsError::FileRead {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Some(key) = canonical_key(name) else {
                continue;
            };
            let contents = std::fs::read_to_string(&path).map_err(|source| {
                SettingsError::FileRead {
                    path: path.clone(),
                    source,
                }
            })?;
            values.insert(key, contents.trim().to_string());
        }
        Self::from_values(values)
    }

    fn from_values(mut values: HashMap<&'static str, String>) -> Result<Self, SettingsError> {
        let host_name = values
            .remove(KEY_HOST_NAME)
            .filter(|v| !v.is_empty())
            .ok_or(SettingsError::MissingValue { key: KEY_HOST_NAME })?;
        let client_id = values
            .remove(KEY_CLIENT_ID)
            .filter(|v| !v.is_empty())
            .ok_or(SettingsError::MissingValue { key: KEY_CLIENT_ID })?;

        let tcp_port = match values.remove(KEY_TCP_PORT) {
            Some(v) => parse_number::<u16>(KEY_TCP_PORT, &v)?,
            None => DEFAULT_TCP_PORT,
        };
        let use_tls = match values.remove(KEY_USE_TLS) {
            Some(v) => parse_bool(KEY_USE_TLS, &v)?,
            None => true,
        };
        let clean_start = match values.remove(KEY_CLEAN_START) {
            Some(v) => parse_bool(KEY_CLEAN_START, &v)?,
            None => true,
        };
        let keep_alive = match values.remove(KEY_KEEP_ALIVE) {
            Some(v) => Duration::from_secs(parse_number::<u64>(KEY_KEEP_ALIVE, &v)?),
            None => DEFAULT_KEEP_ALIVE,
        };
        let session_expiry = match values.remove(KEY_SESSION_EXPIRY) {
            Some(v) => Duration::from_secs(parse_number::<u64>(KEY_SESSION_EXPIRY, &v)?),
            None => DEFAULT_SESSION_EXPIRY,
        };

        let password_file = values.remove(KEY_PASSWORD_FILE).map(PathBuf::from);
        let sat_auth_file = values.remove(KEY_SAT_AUTH_FILE).map(PathBuf::from);
        if password_file.is_some() && sat_auth_file.is_some() {
            return Err(SettingsError::MutuallyExclusive {
                a: KEY_PASSWORD_FILE,
                b: KEY_SAT_AUTH_FILE,
            });
        }

        Ok(Self {
            host_name,
            tcp_port,
            use_tls,
            ca_file: values.remove(KEY_CA_FILE).map(PathBuf::from),
            clean_start,
            keep_alive,
            client_id,
            session_expiry,
            username: values.remove(KEY_USERNAME),
            password_file,
            cert_file: values.remove(KEY_CERT_FILE).map(PathBuf::from),
            key_file: values.remove(KEY_KEY_FILE).map(PathBuf::from),
            key_password_file: values.remove(KEY_KEY_PASSWORD_FILE).map(PathBuf::from),
            sat_auth_file,
        })
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SettingsError> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value.parse().map_err(|_| SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: "expected an integer".to_string(),
    })
}
