//! Client and server configuration
//!
//! Both configurations load from key/value pairs, TOML (inline or from a
//! file) or environment variables and are validated as soon as they are
//! loaded. Nested keys use a dot (`credits.max_credits`); the environment
//! form upper-cases the key and replaces dots with underscores
//! (`SMB_CREDITS_MAX_CREDITS`).

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smb_proto::framing::DEFAULT_MAX_FRAME_SIZE;
use smb_proto::protocol::{Capabilities, Capability, Dialect, DialectRange, Guid};
use smb_proto::window::CreditPolicy;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Invalid value
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name
        field: String,
        /// Error message
        message: String,
    },

    /// Environment variable error
    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

const DEFAULT_MAX_IO_SIZE: u32 = 8 * 1024 * 1024;

fn parse_value<T>(field: &str, value: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        field: field.to_string(),
        message: e.to_string(),
    })
}

fn parse_dialects(field: &str, value: &str) -> ConfigResult<Vec<Dialect>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_value(field, s))
        .collect()
}

fn set_credit(credits: &mut CreditPolicy, key: &str, value: &str) -> ConfigResult<bool> {
    match key {
        "credits.setup_credits" => credits.setup_credits = parse_value(key, value)?,
        "credits.default_credits" => credits.default_credits = parse_value(key, value)?,
        "credits.max_credits" => credits.max_credits = parse_value(key, value)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn env_name(prefix: &str, key: &str) -> String {
    format!("{prefix}_{}", key.replace('.', "_").to_uppercase())
}

/// Collect `(key, value)` pairs for every key present in the environment
fn env_pairs(
    prefix: &str,
    keys: &[&'static str],
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<(&'static str, String)> {
    keys.iter()
        .filter_map(|key| lookup(&env_name(prefix, key)).map(|value| (*key, value)))
        .collect()
}

fn env_error(prefix: &str, error: ConfigError) -> ConfigError {
    match error {
        ConfigError::InvalidValue { field, message } => {
            ConfigError::EnvVar(format!("{}: {message}", env_name(prefix, &field)))
        }
        ConfigError::MissingField(field) => {
            ConfigError::EnvVar(format!("{} is not set", env_name(prefix, &field)))
        }
        other => other,
    }
}

fn validate_credits(credits: &CreditPolicy) -> ConfigResult<()> {
    credits
        .validate()
        .map_err(|message| ConfigError::InvalidValue {
            field: "credits".to_string(),
            message,
        })
}

fn default_capabilities() -> u32 {
    Capabilities::from(Capability::LargeMtu).bits()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

/// Initiator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client GUID sent in NEGOTIATE
    pub client_guid: Guid,
    /// Lowest dialect offered
    pub min_dialect: Dialect,
    /// Highest dialect offered
    pub max_dialect: Dialect,
    /// Refuse sessions whose traffic is not signed
    pub signing_required: bool,
    /// Capability bits advertised in NEGOTIATE
    pub capabilities: u32,
    /// Credit requests
    pub credits: CreditPolicy,
    /// Deadline for connecting and for each request, in milliseconds
    pub request_timeout_ms: u64,
    /// Largest inbound frame accepted
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let range = DialectRange::default();
        Self {
            client_guid: Guid::random(),
            min_dialect: range.min,
            max_dialect: range.max,
            signing_required: false,
            capabilities: default_capabilities(),
            credits: CreditPolicy::default(),
            request_timeout_ms: default_timeout_ms(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ClientConfig {
    /// Keys understood by [`from_pairs`](Self::from_pairs)
    pub const KEYS: &'static [&'static str] = &[
        "client_guid",
        "min_dialect",
        "max_dialect",
        "signing_required",
        "capabilities",
        "credits.setup_credits",
        "credits.default_credits",
        "credits.max_credits",
        "request_timeout_ms",
        "max_frame_size",
    ];

    /// Load from key/value pairs over the defaults
    pub fn from_pairs<I, K, V>(pairs: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(key.as_ref(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML document
    pub fn from_toml_str(toml: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Load from `{prefix}_*` environment variables over the defaults
    pub fn from_env(prefix: &str) -> ConfigResult<Self> {
        Self::from_env_with(prefix, |name| std::env::var(name).ok())
    }

    fn from_env_with(prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        Self::from_pairs(env_pairs(prefix, Self::KEYS, lookup)).map_err(|e| env_error(prefix, e))
    }

    fn set(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        match key {
            "client_guid" => self.client_guid = parse_value(key, value)?,
            "min_dialect" => self.min_dialect = parse_value(key, value)?,
            "max_dialect" => self.max_dialect = parse_value(key, value)?,
            "signing_required" => self.signing_required = parse_value(key, value)?,
            "capabilities" => self.capabilities = parse_value(key, value)?,
            "request_timeout_ms" => self.request_timeout_ms = parse_value(key, value)?,
            "max_frame_size" => self.max_frame_size = parse_value(key, value)?,
            _ => {
                if !set_credit(&mut self.credits, key, value)? {
                    return Err(ConfigError::InvalidValue {
                        field: key.to_string(),
                        message: "unknown key".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> ConfigResult<()> {
        let range = self.dialect_range()?;
        if self.signing_required && range.min == Dialect::Smb311 {
            return Err(ConfigError::Validation(
                "signing_required needs a dialect below 3.1.1".to_string(),
            ));
        }
        validate_credits(&self.credits)?;
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.max_frame_size < smb_proto::protocol::SMB2_HEADER_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "max_frame_size".to_string(),
                message: format!("{} is smaller than a header", self.max_frame_size),
            });
        }
        Ok(())
    }

    /// Offered dialect range
    pub fn dialect_range(&self) -> ConfigResult<DialectRange> {
        DialectRange::new(self.min_dialect, self.max_dialect).map_err(|e| {
            ConfigError::InvalidValue {
                field: "min_dialect/max_dialect".to_string(),
                message: e.to_string(),
            }
        })
    }

    /// Capability set advertised in NEGOTIATE
    pub fn capability_set(&self) -> Capabilities {
        Capabilities::from_bits(self.capabilities)
    }

    /// Request deadline
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 445))
}

fn default_server_dialects() -> Vec<Dialect> {
    vec![
        Dialect::Smb202,
        Dialect::Smb210,
        Dialect::Smb300,
        Dialect::Smb302,
    ]
}

fn default_max_io_size() -> u32 {
    DEFAULT_MAX_IO_SIZE
}

/// Responder configuration
///
/// `server_guid` has no default: every loader fails without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Server GUID reported in NEGOTIATE
    pub server_guid: Guid,
    /// Dialects this server accepts
    #[serde(default = "default_server_dialects")]
    pub dialects: Vec<Dialect>,
    /// Reject unsigned requests on established sessions
    #[serde(default)]
    pub signing_required: bool,
    /// Credit grants
    #[serde(default)]
    pub credits: CreditPolicy,
    /// MaxTransactSize reported in NEGOTIATE
    #[serde(default = "default_max_io_size")]
    pub max_transact_size: u32,
    /// MaxReadSize reported in NEGOTIATE
    #[serde(default = "default_max_io_size")]
    pub max_read_size: u32,
    /// MaxWriteSize reported in NEGOTIATE
    #[serde(default = "default_max_io_size")]
    pub max_write_size: u32,
    /// Largest inbound frame accepted
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl ServerConfig {
    /// Keys understood by [`from_pairs`](Self::from_pairs)
    pub const KEYS: &'static [&'static str] = &[
        "bind_addr",
        "server_guid",
        "dialects",
        "signing_required",
        "credits.setup_credits",
        "credits.default_credits",
        "credits.max_credits",
        "max_transact_size",
        "max_read_size",
        "max_write_size",
        "max_frame_size",
    ];

    /// Defaults around a server GUID
    pub fn new(server_guid: Guid) -> Self {
        Self {
            bind_addr: default_bind_addr(),
            server_guid,
            dialects: default_server_dialects(),
            signing_required: false,
            credits: CreditPolicy::default(),
            max_transact_size: DEFAULT_MAX_IO_SIZE,
            max_read_size: DEFAULT_MAX_IO_SIZE,
            max_write_size: DEFAULT_MAX_IO_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Load from key/value pairs; `server_guid` must be among them
    pub fn from_pairs<I, K, V>(pairs: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let pairs: Vec<(K, V)> = pairs.into_iter().collect();
        let guid = pairs
            .iter()
            .find(|(key, _)| key.as_ref() == "server_guid")
            .map(|(key, value)| parse_value::<Guid>(key.as_ref(), value.as_ref()))
            .transpose()?
            .ok_or_else(|| ConfigError::MissingField("server_guid".to_string()))?;

        let mut config = Self::new(guid);
        for (key, value) in &pairs {
            config.set(key.as_ref(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML document
    pub fn from_toml_str(toml: &str) -> ConfigResult<Self> {
        let table: toml::Table = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if !table.contains_key("server_guid") {
            return Err(ConfigError::MissingField("server_guid".to_string()));
        }
        let config: Self = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Load from `{prefix}_*` environment variables
    pub fn from_env(prefix: &str) -> ConfigResult<Self> {
        Self::from_env_with(prefix, |name| std::env::var(name).ok())
    }

    fn from_env_with(prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        Self::from_pairs(env_pairs(prefix, Self::KEYS, lookup)).map_err(|e| env_error(prefix, e))
    }

    fn set(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        match key {
            "bind_addr" => self.bind_addr = parse_value(key, value)?,
            "server_guid" => self.server_guid = parse_value(key, value)?,
            "dialects" => self.dialects = parse_dialects(key, value)?,
            "signing_required" => self.signing_required = parse_value(key, value)?,
            "max_transact_size" => self.max_transact_size = parse_value(key, value)?,
            "max_read_size" => self.max_read_size = parse_value(key, value)?,
            "max_write_size" => self.max_write_size = parse_value(key, value)?,
            "max_frame_size" => self.max_frame_size = parse_value(key, value)?,
            _ => {
                if !set_credit(&mut self.credits, key, value)? {
                    return Err(ConfigError::InvalidValue {
                        field: key.to_string(),
                        message: "unknown key".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> ConfigResult<()> {
        if self.dialects.is_empty() {
            return Err(ConfigError::Validation(
                "at least one dialect must be enabled".to_string(),
            ));
        }
        if let Some(bad) = self.dialects.iter().find(|d| !d.is_known()) {
            return Err(ConfigError::InvalidValue {
                field: "dialects".to_string(),
                message: format!("{bad} is not a concrete dialect"),
            });
        }
        if self.signing_required && self.dialects.iter().all(|d| *d == Dialect::Smb311) {
            return Err(ConfigError::Validation(
                "signing_required needs a dialect below 3.1.1".to_string(),
            ));
        }
        validate_credits(&self.credits)?;
        for (field, size) in [
            ("max_transact_size", self.max_transact_size),
            ("max_read_size", self.max_read_size),
            ("max_write_size", self.max_write_size),
        ] {
            if size == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: "must be positive".to_string(),
                });
            }
        }
        if self.max_frame_size < smb_proto::protocol::SMB2_HEADER_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "max_frame_size".to_string(),
                message: format!("{} is smaller than a header", self.max_frame_size),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const GUID: &str = "996e16b1-e7fb-9464-6b35-35057de29f07";

    #[test]
    fn test_client_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dialect_range().unwrap(), DialectRange::default());
        assert!(config.capability_set().contains(Capability::LargeMtu));
    }

    #[test]
    fn test_client_from_pairs() {
        let config = ClientConfig::from_pairs([
            ("client_guid", GUID),
            ("min_dialect", "2.1"),
            ("max_dialect", "3.0.2"),
            ("signing_required", "true"),
            ("credits.setup_credits", "32"),
        ])
        .unwrap();
        assert_eq!(config.client_guid.to_string(), GUID);
        assert_eq!(config.min_dialect, Dialect::Smb210);
        assert!(config.signing_required);
        assert_eq!(config.credits.setup_credits, 32);
        assert_eq!(config.credits.default_credits, 16);
    }

    #[test]
    fn test_client_rejects_bad_values() {
        assert!(matches!(
            ClientConfig::from_pairs([("max_dialect", "9.9")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            ClientConfig::from_pairs([("min_dialect", "3.0.2"), ("max_dialect", "2.1")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            ClientConfig::from_pairs([("no_such_key", "1")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            ClientConfig::from_pairs([("credits.max_credits", "2")]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_client_signing_needs_pre_311() {
        let result = ClientConfig::from_pairs([
            ("min_dialect", "3.1.1"),
            ("max_dialect", "3.1.1"),
            ("signing_required", "true"),
        ]);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_client_from_toml() {
        let config = ClientConfig::from_toml_str(
            r#"
            min_dialect = "3.0"
            max_dialect = "3.0.2"
            request_timeout_ms = 500

            [credits]
            default_credits = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.min_dialect, Dialect::Smb300);
        assert_eq!(config.request_timeout(), Duration::from_millis(500));
        assert_eq!(config.credits.default_credits, 8);
        assert_eq!(config.credits.setup_credits, 64);
    }

    #[test]
    fn test_client_from_env() {
        let env: HashMap<String, String> = [
            ("SMBT_MAX_DIALECT".to_string(), "3.0".to_string()),
            ("SMBT_CREDITS_MAX_CREDITS".to_string(), "128".to_string()),
        ]
        .into();
        let config = ClientConfig::from_env_with("SMBT", |name| env.get(name).cloned()).unwrap();
        assert_eq!(config.max_dialect, Dialect::Smb300);
        assert_eq!(config.credits.max_credits, 128);

        let env: HashMap<String, String> =
            [("SMBT_SIGNING_REQUIRED".to_string(), "maybe".to_string())].into();
        let err = ClientConfig::from_env_with("SMBT", |name| env.get(name).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::EnvVar(ref m) if m.contains("SMBT_SIGNING_REQUIRED")));
    }

    #[test]
    fn test_server_requires_guid() {
        assert!(matches!(
            ServerConfig::from_pairs([("dialects", "3.0")]),
            Err(ConfigError::MissingField(ref f)) if f == "server_guid"
        ));
        assert!(matches!(
            ServerConfig::from_toml_str("dialects = [\"3.0\"]"),
            Err(ConfigError::MissingField(_))
        ));
        let err = ServerConfig::from_env_with("SMBS", |_| None).unwrap_err();
        assert!(matches!(err, ConfigError::EnvVar(ref m) if m.contains("SMBS_SERVER_GUID")));
    }

    #[test]
    fn test_server_from_pairs() {
        let config = ServerConfig::from_pairs([
            ("server_guid", GUID),
            ("bind_addr", "127.0.0.1:4450"),
            ("dialects", "2.1, 3.0"),
            ("max_read_size", "65536"),
        ])
        .unwrap();
        assert_eq!(config.server_guid.to_string(), GUID);
        assert_eq!(config.bind_addr.port(), 4450);
        assert_eq!(config.dialects, vec![Dialect::Smb210, Dialect::Smb300]);
        assert_eq!(config.max_read_size, 65536);
        assert_eq!(config.max_write_size, DEFAULT_MAX_IO_SIZE);
    }

    #[test]
    fn test_server_from_toml() {
        let config = ServerConfig::from_toml_str(&format!(
            r#"
            server_guid = "{GUID}"
            dialects = ["3.0", "3.0.2"]
            signing_required = true

            [credits]
            max_credits = 256
            "#
        ))
        .unwrap();
        assert_eq!(config.dialects, vec![Dialect::Smb300, Dialect::Smb302]);
        assert!(config.signing_required);
        assert_eq!(config.credits.max_credits, 256);
        assert_eq!(config.bind_addr, default_bind_addr());
    }

    #[test]
    fn test_server_validation() {
        assert!(matches!(
            ServerConfig::from_pairs([("server_guid", GUID), ("dialects", "")]),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            ServerConfig::from_pairs([
                ("server_guid", GUID),
                ("dialects", "3.1.1"),
                ("signing_required", "true"),
            ]),
            Err(ConfigError::Validation(_))
        ));
        assert!(ServerConfig::from_toml_str("server_guid = \"not-a-guid\"").is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            format!("server_guid = \"{GUID}\"\ndialects = [\"2.1\"]\n"),
        )
        .unwrap();
        let config = ServerConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.dialects, vec![Dialect::Smb210]);

        let path = dir.path().join("client.toml");
        std::fs::write(&path, "max_dialect = \"3.0\"\n").unwrap();
        let config = ClientConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.max_dialect, Dialect::Smb300);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            ClientConfig::from_toml_file(&missing),
            Err(ConfigError::Io(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml_file(&missing),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ServerConfig::new(GUID.parse().unwrap());
        let text = toml::to_string(&config).unwrap();
        assert_eq!(ServerConfig::from_toml_str(&text).unwrap(), config);
    }
}
