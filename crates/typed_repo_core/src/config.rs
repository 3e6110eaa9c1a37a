//! Engine configuration.
//!
//! # Responsibility
//! - Hold the tunables shared by sessions, executors and storage bootstrap.
//! - Layer defaults, an optional config file and `TYPED_REPO__*` environment
//!   variables.
//!
//! # Invariants
//! - A validated config always has `1 <= default_page_size <= max_page_size`
//!   and a non-zero `fetch_size`.

use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "TYPED_REPO";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Page size used when a caller pages without an explicit request.
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    /// Upper bound applied to every page request.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
    /// Rows per chunk fetched by streaming reads.
    #[serde(default = "default_fetch_size")]
    pub fetch_size: u32,
    /// SQLite busy handler timeout; lock waits longer than this fail with `Timeout`.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Per-call budget; `None` disables deadlines unless a session sets one.
    #[serde(default)]
    pub query_timeout_ms: Option<u64>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_page_size() -> u32 {
    20
}

fn default_max_page_size() -> u32 {
    2000
}

fn default_fetch_size() -> u32 {
    100
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    crate::logging::default_log_level().to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            fetch_size: default_fetch_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            query_timeout_ms: None,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Load(::config::ConfigError),
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(err) => write!(f, "failed to load engine config: {err}"),
            Self::Parse(err) => write!(f, "failed to parse engine config: {err}"),
            Self::Invalid(message) => write!(f, "invalid engine config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Load(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<::config::ConfigError> for ConfigError {
    fn from(value: ::config::ConfigError) -> Self {
        Self::Load(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

impl EngineConfig {
    /// Loads defaults, then `path` if it exists, then environment overrides
    /// such as `TYPED_REPO__FETCH_SIZE=50`.
    ///
    /// # Errors
    /// - `Load` when the file is unreadable or a value has the wrong type.
    /// - `Invalid` when the merged values break the page-size invariants.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses an inline JSON object; missing keys take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_page_size == 0 {
            return Err(ConfigError::Invalid(
                "default_page_size must be at least 1".to_string(),
            ));
        }
        if self.max_page_size < self.default_page_size {
            return Err(ConfigError::Invalid(format!(
                "max_page_size {} is smaller than default_page_size {}",
                self.max_page_size, self.default_page_size
            )));
        }
        if self.fetch_size == 0 {
            return Err(ConfigError::Invalid("fetch_size must be at least 1".to_string()));
        }
        crate::logging::normalize_level(self.log_level.as_str()).map_err(ConfigError::Invalid)?;
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }
}
