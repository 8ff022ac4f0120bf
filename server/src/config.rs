//! Server configuration.
//!
//! Covers message size limits, error detail, response compression, routing
//! fall-through and logging. Compression providers and global interceptors
//! are code, not configuration, and are added on the
//! [`ServerBuilder`](crate::server::ServerBuilder).

use grpc::CompressionLevel;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Server configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Call handling options.
    #[serde(default)]
    pub grpc: GrpcConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Call handling options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrpcConfig {
    /// Largest request message accepted (e.g., "4MB"). `"unlimited"` lifts
    /// the limit.
    #[serde(
        default = "default_max_receive_message_size",
        deserialize_with = "deserialize_limit"
    )]
    pub max_receive_message_size: Option<usize>,

    /// Largest response message sent. Unlimited by default.
    #[serde(default, deserialize_with = "deserialize_limit")]
    pub max_send_message_size: Option<usize>,

    /// Include the error type and message in `Unknown` statuses produced
    /// from handler errors.
    #[serde(default)]
    pub enable_detailed_errors: bool,

    /// Encoding used for responses when the client did not ask for one.
    #[serde(default)]
    pub response_compression_algorithm: Option<String>,

    #[serde(default)]
    pub response_compression_level: CompressionLevel,

    /// Responses smaller than this are sent uncompressed.
    #[serde(default, deserialize_with = "deserialize_size")]
    pub compression_min_size: usize,

    /// Pass requests for unknown services back to the host instead of
    /// answering `Unimplemented`.
    #[serde(default)]
    pub ignore_unknown_services: bool,

    /// Pass requests for unknown methods of known services back to the host.
    #[serde(default)]
    pub ignore_unknown_methods: bool,

    /// How long a handler may keep running for bookkeeping after its call
    /// was finalized by a deadline or disconnect.
    #[serde(default = "default_deadline_grace_period_ms")]
    pub deadline_grace_period_ms: u64,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            max_receive_message_size: default_max_receive_message_size(),
            max_send_message_size: None,
            enable_detailed_errors: false,
            response_compression_algorithm: None,
            response_compression_level: CompressionLevel::default(),
            compression_min_size: 0,
            ignore_unknown_services: false,
            ignore_unknown_methods: false,
            deadline_grace_period_ms: default_deadline_grace_period_ms(),
        }
    }
}

impl GrpcConfig {
    pub fn deadline_grace_period(&self) -> Duration {
        Duration::from_millis(self.deadline_grace_period_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn" or "error". Any
    /// `EnvFilter` directive is accepted.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event target (module path).
    #[serde(default = "default_true")]
    pub target: bool,

    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: true,
            thread_names: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_max_receive_message_size() -> Option<usize> {
    Some(grpc::DEFAULT_MAX_RECEIVE_MESSAGE_SIZE)
}

fn default_deadline_grace_period_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Number(usize),
    String(String),
}

/// Deserialize a size string like "64MB" or a plain byte count.
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Like [`deserialize_size`], but `"unlimited"` maps to `None`.
fn deserialize_limit<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(Some(n)),
        SizeValue::String(s) if s.trim().eq_ignore_ascii_case("unlimited") => Ok(None),
        SizeValue::String(s) => parse_size(&s).map(Some).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64MB", "512KB", "1GB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.grpc.validate()
    }
}

impl GrpcConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_receive_message_size == Some(0) {
            return Err(ConfigError::Invalid(
                "max_receive_message_size must be greater than zero".into(),
            ));
        }

        if self.max_send_message_size == Some(0) {
            return Err(ConfigError::Invalid(
                "max_send_message_size must be greater than zero".into(),
            ));
        }

        if let Some(ref algorithm) = self.response_compression_algorithm
            && algorithm.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "response_compression_algorithm must not be empty".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("4MB").unwrap(), 4 * 1024 * 1024);
        assert!(parse_size("4XB").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(
            config.grpc.max_receive_message_size,
            Some(4 * 1024 * 1024)
        );
        assert_eq!(config.grpc.max_send_message_size, None);
        assert!(!config.grpc.enable_detailed_errors);
        assert_eq!(config.grpc.deadline_grace_period(), Duration::from_secs(5));
        assert_eq!(config.grpc.response_compression_level, CompressionLevel::Fastest);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [grpc]
            max_receive_message_size = "unlimited"
            max_send_message_size = "1MB"
            enable_detailed_errors = true
            response_compression_algorithm = "gzip"
            response_compression_level = "optimal"
            compression_min_size = 256
            ignore_unknown_services = true
            deadline_grace_period_ms = 100

            [logging]
            level = "debug"
            format = "json"
            timestamps = false
            "#,
        )
        .unwrap();

        assert_eq!(config.grpc.max_receive_message_size, None);
        assert_eq!(config.grpc.max_send_message_size, Some(1024 * 1024));
        assert!(config.grpc.enable_detailed_errors);
        assert_eq!(
            config.grpc.response_compression_algorithm.as_deref(),
            Some("gzip")
        );
        assert_eq!(config.grpc.response_compression_level, CompressionLevel::Optimal);
        assert_eq!(config.grpc.compression_min_size, 256);
        assert!(config.grpc.ignore_unknown_services);
        assert!(!config.grpc.ignore_unknown_methods);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.timestamps);
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = Config::parse("[grpc]\nmax_message = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejects_zero_limits() {
        let err = Config::parse("[grpc]\nmax_receive_message_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::parse("[grpc]\nmax_send_message_size = \"0KB\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
