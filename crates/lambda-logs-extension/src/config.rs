//! Configuration loading and management.
//!
//! This module provides layered configuration for the extension using figment.
//! Configuration is loaded from (in order of priority):
//! 1. Default values (compiled in)
//! 2. Config file: `/opt/lambda-logs-extension.toml` (optional)
//! 3. The extension's well-known environment variables
//! 4. Prefixed environment variables (`LAMBDA_LOGS_EXT_<SECTION>__<KEY>`)
//!
//! # Well-known Environment Variables
//!
//! | Variable | Config Path | Default |
//! |----------|-------------|---------|
//! | `AWS_LAMBDA_RUNTIME_API` | `runtime_api` | unset |
//! | `HONEYCOMB_DEBUG` | `debug` | `false` |
//! | `LIBHONEY_API_KEY` | `publisher.api_key` | unset |
//! | `LIBHONEY_DATASET` | `publisher.dataset` | unset |
//! | `LIBHONEY_API_HOST` | `publisher.api_host` | `https://api.honeycomb.io` |
//! | `HONEYCOMB_BATCH_SEND_TIMEOUT` | `publisher.batch_send_timeout` | `15s` |
//! | `HONEYCOMB_CONNECT_TIMEOUT` | `publisher.connect_timeout` | `3s` |
//! | `LOGS_API_TIMEOUT_MS` | `logs_api.timeout_ms` | `1000` |
//! | `LOGS_API_MAX_BYTES` | `logs_api.max_bytes` | `262144` |
//! | `LOGS_API_MAX_ITEMS` | `logs_api.max_items` | `1000` |
//! | `LOGS_API_DISABLE_PLATFORM_MSGS` | `logs_api.disable_platform_messages` | `false` |
//!
//! These are parsed leniently: a value that cannot be parsed is logged and
//! the previous layer's value is kept.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Default location of the optional config file.
pub const DEFAULT_CONFIG_PATH: &str = "/opt/lambda-logs-extension.toml";
const ENV_PREFIX: &str = "LAMBDA_LOGS_EXT_";
const DEFAULT_EXTENSION_NAME: &str = "lambda-logs-extension";

/// Environment variable that enables debug output.
pub const DEBUG_ENV: &str = "HONEYCOMB_DEBUG";

/// Compression applied to outgoing event batches.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression.
    None,
    /// Gzip compression.
    #[default]
    Gzip,
}

/// Main configuration struct for the extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Runtime API address (`host:port`), provided by the platform.
    pub runtime_api: Option<String>,
    /// Name announced on registration; defaults to the executable name.
    pub extension_name: Option<String>,
    /// Skip registration and subscription, only run the log receiver.
    pub local_mode: bool,
    /// Enable debug output and delivery response logging.
    pub debug: bool,
    /// Log receiver configuration.
    pub receiver: ReceiverConfig,
    /// Logs API subscription configuration.
    pub logs_api: LogsApiConfig,
    /// Event publisher configuration.
    pub publisher: PublisherConfig,
}

impl Config {
    /// Loads configuration using a custom config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if config_path.as_ref().exists() {
            figment = figment.merge(Toml::file(config_path));
        }

        figment = figment.merge(well_known_env());
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract()
    }

    /// Creates a new config builder for testing.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Returns the name to register under.
    pub fn extension_name(&self) -> String {
        self.extension_name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(executable_name)
            .unwrap_or_else(|| DEFAULT_EXTENSION_NAME.to_string())
    }
}

/// Log receiver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Address the HTTP listener binds to.
    pub bind_address: IpAddr,
    /// Port the HTTP listener binds to; 0 picks a free port.
    pub port: u16,
    /// Host the Logs API should push to. Defaults to the sandbox hostname
    /// inside Lambda and the loopback address elsewhere.
    pub destination_host: Option<String>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            destination_host: None,
        }
    }
}

/// Logs API subscription configuration.
///
/// Buffering values are forwarded verbatim to the Logs API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsApiConfig {
    /// Maximum time to buffer a batch, in milliseconds.
    pub timeout_ms: u32,
    /// Maximum size of a batch in bytes.
    pub max_bytes: u64,
    /// Maximum number of records in a batch.
    pub max_items: u64,
    /// Only subscribe to function logs.
    pub disable_platform_messages: bool,
}

impl Default for LogsApiConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            max_bytes: 262_144,
            max_items: 1000,
            disable_platform_messages: false,
        }
    }
}

/// Event publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// API key sent with every batch. Publishing is disabled without it.
    pub api_key: Option<String>,
    /// Dataset events are written to. Publishing is disabled without it.
    pub dataset: Option<String>,
    /// Base URL of the events API.
    pub api_host: String,
    /// Start-to-finish timeout for sending one batch, in milliseconds.
    #[serde(with = "duration_ms")]
    pub batch_send_timeout: Duration,
    /// Timeout for establishing a connection, in milliseconds.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Maximum events per batch.
    pub max_batch_size: usize,
    /// How long queued events may wait before a batch is sent, in milliseconds.
    #[serde(with = "duration_ms")]
    pub batch_timeout: Duration,
    /// Compression for batch bodies.
    pub compression: Compression,
    /// Capacity of the delivery response channel.
    pub response_queue_size: usize,
}

impl PublisherConfig {
    /// Returns true when both API key and dataset are set.
    pub fn is_enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty())
            && self.dataset.as_deref().is_some_and(|ds| !ds.is_empty())
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            dataset: None,
            api_host: "https://api.honeycomb.io".to_string(),
            batch_send_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(3),
            max_batch_size: 50,
            batch_timeout: Duration::from_millis(100),
            compression: Compression::Gzip,
            response_queue_size: 100,
        }
    }
}

/// Builder for constructing configuration programmatically.
#[must_use = "builders do nothing unless .build() is called"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new config builder with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Sets the runtime API address.
    pub fn runtime_api(mut self, address: impl Into<String>) -> Self {
        self.config.runtime_api = Some(address.into());
        self
    }

    /// Sets the extension name.
    pub fn extension_name(mut self, name: impl Into<String>) -> Self {
        self.config.extension_name = Some(name.into());
        self
    }

    /// Enables or disables local mode.
    pub fn local_mode(mut self, enabled: bool) -> Self {
        self.config.local_mode = enabled;
        self
    }

    /// Enables or disables debug output.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the receiver bind address.
    pub fn receiver_bind_address(mut self, address: IpAddr) -> Self {
        self.config.receiver.bind_address = address;
        self
    }

    /// Sets the receiver port.
    pub fn receiver_port(mut self, port: u16) -> Self {
        self.config.receiver.port = port;
        self
    }

    /// Sets the host the Logs API pushes to.
    pub fn destination_host(mut self, host: impl Into<String>) -> Self {
        self.config.receiver.destination_host = Some(host.into());
        self
    }

    /// Subscribes to function logs only.
    pub fn disable_platform_messages(mut self, disabled: bool) -> Self {
        self.config.logs_api.disable_platform_messages = disabled;
        self
    }

    /// Sets the publisher API key and dataset.
    pub fn publisher_credentials(
        mut self,
        api_key: impl Into<String>,
        dataset: impl Into<String>,
    ) -> Self {
        self.config.publisher.api_key = Some(api_key.into());
        self.config.publisher.dataset = Some(dataset.into());
        self
    }

    /// Sets the publisher API host.
    pub fn api_host(mut self, host: impl Into<String>) -> Self {
        self.config.publisher.api_host = host.into();
        self
    }

    /// Sets the publisher compression.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.publisher.compression = compression;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn executable_name() -> Option<String> {
    let arg0 = std::env::args_os().next()?;
    Path::new(&arg0)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Partial logs API config for well-known env var overrides.
#[derive(Debug, Default, Serialize)]
struct PartialLogsApiConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_items: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disable_platform_messages: Option<bool>,
}

/// Partial publisher config for well-known env var overrides.
#[derive(Debug, Default, Serialize)]
struct PartialPublisherConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dataset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_send_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connect_timeout: Option<u64>,
}

/// Partial config for well-known env var overrides.
#[derive(Debug, Default, Serialize)]
struct PartialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_api: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<bool>,
    logs_api: PartialLogsApiConfig,
    publisher: PartialPublisherConfig,
}

fn well_known_env() -> Serialized<PartialConfig> {
    let mut config = PartialConfig {
        runtime_api: env_string("AWS_LAMBDA_RUNTIME_API"),
        debug: env_bool(DEBUG_ENV),
        ..Default::default()
    };

    config.logs_api.timeout_ms =
        env_unsigned("LOGS_API_TIMEOUT_MS").and_then(|ms| u32::try_from(ms).ok());
    config.logs_api.max_bytes = env_unsigned("LOGS_API_MAX_BYTES");
    config.logs_api.max_items = env_unsigned("LOGS_API_MAX_ITEMS");
    config.logs_api.disable_platform_messages = env_bool("LOGS_API_DISABLE_PLATFORM_MSGS");

    config.publisher.api_key = env_string("LIBHONEY_API_KEY");
    config.publisher.dataset = env_string("LIBHONEY_DATASET");
    config.publisher.api_host = env_string("LIBHONEY_API_HOST");
    config.publisher.batch_send_timeout =
        env_duration("HONEYCOMB_BATCH_SEND_TIMEOUT").map(|d| d.as_millis() as u64);
    config.publisher.connect_timeout =
        env_duration("HONEYCOMB_CONNECT_TIMEOUT").map(|d| d.as_millis() as u64);

    Serialized::defaults(config)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// Reads a boolean environment variable the way the platform tooling does.
pub fn env_bool(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => {
            tracing::warn!(
                key,
                %value,
                "Environment variable is not a boolean, keeping default"
            );
            None
        }
    }
}

fn env_unsigned(key: &str) -> Option<u64> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse::<i64>() {
        Ok(parsed) if parsed >= 0 => Some(parsed as u64),
        Ok(_) => {
            tracing::warn!(
                key,
                %value,
                "Environment variable must not be negative, keeping default"
            );
            None
        }
        Err(_) => {
            tracing::warn!(
                key,
                %value,
                "Environment variable is not an integer, keeping default"
            );
            None
        }
    }
}

fn env_duration(key: &str) -> Option<Duration> {
    let value = std::env::var(key).ok()?;
    let parsed = parse_duration(&value).or_else(|| {
        let seconds = value.trim().parse::<u64>().ok()?;
        let duration = Duration::from_secs(seconds);
        tracing::warn!(
            key,
            %value,
            ?duration,
            "Environment variable is an integer, not a duration; assuming seconds"
        );
        Some(duration)
    });

    match parsed {
        Some(duration) if !duration.is_zero() => Some(duration),
        Some(_) => {
            tracing::warn!(key, value, "Zero duration is unusable, keeping default");
            None
        }
        None => {
            tracing::warn!(
                key,
                %value,
                "Environment variable is not a duration, keeping default"
            );
            None
        }
    }
}

/// Parses a duration such as `900ms`, `9s` or `1m30s`.
///
/// Supported units are `ns`, `us`, `µs`, `ms`, `s`, `m` and `h`. A bare number
/// without a unit is rejected.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let mut rest = value.trim();
    if rest.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let (number, tail) = rest.split_at(number_len);
        let number: f64 = number.parse().ok()?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let seconds_per_unit = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };

        total += Duration::try_from_secs_f64(number * seconds_per_unit).ok()?;
        rest = tail;
    }

    Some(total)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
