//! Configuration management for nimbus
//!
//! Settings are layered: built-in defaults, then the optional global file
//! `~/.config/nimbus/config.yaml`, then `NIMBUS_*` environment variables. Command
//! line flags are applied on top by the CLI handlers.
//!
//! # Environment Variables
//!
//! - `NIMBUS_PROVIDER`: Target provider (aws|azure|gcp|digitalocean) - default: "aws"
//! - `NIMBUS_SESSION_TIMEOUT`: Seconds a function may take to finish discovery - default: "120"
//! - `NIMBUS_BUILD_TIMEOUT`: Seconds an image build may take - default: "300"
//! - `NIMBUS_MAX_PARALLEL`: Concurrent function discoveries - default: available cores, at most 8
//! - `NIMBUS_CAPTURE_BIND`: Address the capture server binds - default: "0.0.0.0:0"
//! - `NIMBUS_ADVERTISE_HOST`: Host name containers use to reach the capture server -
//!   default: "host.docker.internal"
//! - `NIMBUS_ALLOW_PARTIAL`: Accept a partial graph when functions fail (true|false) - default: "false"
//! - `NIMBUS_LOG_LEVEL`: Logging level - default: "info"
//!
//! # Example
//!
//! ```no_run
//! use nimbus::NimbusConfig;
//!
//! let config = NimbusConfig::load().expect("Invalid configuration");
//! println!("{}", config);
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 120;
const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_ADVERTISE_HOST: &str = "host.docker.internal";
const MAX_DEFAULT_PARALLEL: usize = 8;
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid provider: {0}. Valid options: aws, azure, gcp, digitalocean")]
    InvalidProvider(String),

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// Failed to parse configuration value
    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },

    #[error("Failed to read config file {path}: {error}")]
    FileError { path: PathBuf, error: String },
}

/// Cloud provider the deployable images target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
    #[serde(rename = "digitalocean")]
    DigitalOcean,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
            Provider::DigitalOcean => "digitalocean",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(Provider::Aws),
            "azure" => Ok(Provider::Azure),
            "gcp" => Ok(Provider::Gcp),
            "digitalocean" | "do" => Ok(Provider::DigitalOcean),
            other => Err(ConfigError::InvalidProvider(other.to_string())),
        }
    }
}

/// Contents of the global config file; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    provider: Option<Provider>,
    session_timeout_secs: Option<u64>,
    build_timeout_secs: Option<u64>,
    max_parallel: Option<usize>,
    capture_bind: Option<SocketAddr>,
    advertise_host: Option<String>,
    allow_partial: Option<bool>,
    log_level: Option<String>,
}

/// Main configuration structure for nimbus
///
/// Passed explicitly to the components that need it; nothing reads settings from
/// ambient state after [`NimbusConfig::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NimbusConfig {
    /// Provider the deployable images are built for
    pub provider: Provider,

    /// Upper bound on discovering one function: image build, container start and
    /// capture session together
    pub session_timeout_secs: u64,

    /// Upper bound on one image build
    pub build_timeout_secs: u64,

    /// Number of functions discovered concurrently
    pub max_parallel: usize,

    pub capture_bind: SocketAddr,

    /// Host name injected into containers to reach the capture server
    pub advertise_host: String,

    /// Accept a partial graph when some functions fail discovery
    pub allow_partial: bool,

    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for NimbusConfig {
    /// Built-in defaults only, without consulting files or the environment
    fn default() -> Self {
        let max_parallel = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_DEFAULT_PARALLEL);

        Self {
            provider: Provider::Aws,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            build_timeout_secs: DEFAULT_BUILD_TIMEOUT_SECS,
            max_parallel,
            capture_bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertise_host: DEFAULT_ADVERTISE_HOST.to_string(),
            allow_partial: false,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl NimbusConfig {
    /// Loads defaults, the global config file (if present) and `NIMBUS_*` variables
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = Self::global_config_path() {
            if path.is_file() {
                config.apply_file(&path)?;
            }
        }
        config.apply_env()?;
        Ok(config)
    }

    /// `$HOME/.config/nimbus/config.yaml`
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("nimbus").join("config.yaml"))
    }

    /// Overlays the values set in a YAML config file
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        if content.trim().is_empty() {
            return Ok(());
        }
        let file: FileConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::FileError {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;

        if let Some(provider) = file.provider {
            self.provider = provider;
        }
        if let Some(secs) = file.session_timeout_secs {
            self.session_timeout_secs = secs;
        }
        if let Some(secs) = file.build_timeout_secs {
            self.build_timeout_secs = secs;
        }
        if let Some(n) = file.max_parallel {
            self.max_parallel = n;
        }
        if let Some(bind) = file.capture_bind {
            self.capture_bind = bind;
        }
        if let Some(host) = file.advertise_host {
            self.advertise_host = host;
        }
        if let Some(allow) = file.allow_partial {
            self.allow_partial = allow;
        }
        if let Some(level) = file.log_level {
            self.log_level = level.to_lowercase();
        }
        Ok(())
    }

    /// Overlays `NIMBUS_*` environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(provider) = env::var("NIMBUS_PROVIDER") {
            self.provider = provider.parse()?;
        }
        if let Some(secs) = parse_env("NIMBUS_SESSION_TIMEOUT")? {
            self.session_timeout_secs = secs;
        }
        if let Some(secs) = parse_env("NIMBUS_BUILD_TIMEOUT")? {
            self.build_timeout_secs = secs;
        }
        if let Some(n) = parse_env("NIMBUS_MAX_PARALLEL")? {
            self.max_parallel = n;
        }
        if let Some(bind) = parse_env("NIMBUS_CAPTURE_BIND")? {
            self.capture_bind = bind;
        }
        if let Ok(host) = env::var("NIMBUS_ADVERTISE_HOST") {
            self.advertise_host = host;
        }
        if let Some(allow) = parse_env("NIMBUS_ALLOW_PARTIAL")? {
            self.allow_partial = allow;
        }
        if let Ok(level) = env::var("NIMBUS_LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` for zero or oversized timeouts, zero
    /// parallelism, an empty advertised host or an unknown log level.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, secs) in [
            ("Session timeout", self.session_timeout_secs),
            ("Build timeout", self.build_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be at least 1 second",
                    name
                )));
            }
            if secs > MAX_TIMEOUT_SECS {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} cannot exceed 1 hour",
                    name
                )));
            }
        }

        if self.max_parallel == 0 {
            return Err(ConfigError::ValidationFailed(
                "Max parallel discoveries must be at least 1".to_string(),
            ));
        }

        if self.advertise_host.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "Advertised host cannot be empty".to_string(),
            ));
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        Ok(())
    }

    /// Converts configuration to a display map for output formatting
    pub fn to_display_map(&self) -> std::collections::BTreeMap<String, String> {
        let mut map = std::collections::BTreeMap::new();

        map.insert("provider".to_string(), self.provider.to_string());
        map.insert(
            "session_timeout_secs".to_string(),
            self.session_timeout_secs.to_string(),
        );
        map.insert(
            "build_timeout_secs".to_string(),
            self.build_timeout_secs.to_string(),
        );
        map.insert("max_parallel".to_string(), self.max_parallel.to_string());
        map.insert("capture_bind".to_string(), self.capture_bind.to_string());
        map.insert("advertise_host".to_string(), self.advertise_host.clone());
        map.insert("allow_partial".to_string(), self.allow_partial.to_string());
        map.insert("log_level".to_string(), self.log_level.clone());

        map
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::ParseError {
                field: key.to_string(),
                error: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl fmt::Display for NimbusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Nimbus Configuration:")?;
        writeln!(f, "  Provider: {}", self.provider)?;
        writeln!(f, "  Session Timeout: {}s", self.session_timeout_secs)?;
        writeln!(f, "  Build Timeout: {}s", self.build_timeout_secs)?;
        writeln!(f, "  Max Parallel: {}", self.max_parallel)?;
        writeln!(f, "  Capture Bind: {}", self.capture_bind)?;
        writeln!(f, "  Advertise Host: {}", self.advertise_host)?;
        writeln!(f, "  Allow Partial: {}", self.allow_partial)?;
        writeln!(f, "  Log Level: {}", self.log_level)?;
        Ok(())
    }
}
