//! Configuration module for Cirrus.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::newtypes::ClientId;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for Cirrus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub remote: RemoteConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory of the local mirror.
    pub root: PathBuf,
    /// Seconds between pull cycles when nothing changes locally.
    pub poll_interval: u64,
    /// Milliseconds to wait after a local change before syncing.
    pub debounce_delay_ms: u64,
    /// Seconds before a remote call is abandoned.
    pub network_timeout: u64,
    /// Maximum number of changes pushed in one cycle.
    pub max_batch_size: usize,
}

/// Remote service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the sync service.
    pub base_url: String,
    /// Account identifier sent with metadata queries.
    pub user_id: String,
    /// Server-side root this client mirrors, e.g. `/`.
    pub relative_root_path: String,
    /// Identity of this installation. Generated on first run when absent.
    pub client_id: Option<ClientId>,
}

/// Retry backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any retry delay, in seconds.
    pub max_delay_secs: u64,
    /// Randomize delays to spread retries out.
    pub jitter: bool,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

/// Local index database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Write the configuration as YAML to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/cirrus/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("cirrus")
            .join("config.yaml")
    }

    /// Returns the client id, generating and storing one if absent.
    ///
    /// Returns `true` in the second position when a new id was generated
    /// and the caller should persist the configuration.
    pub fn ensure_client_id(&mut self) -> (ClientId, bool) {
        match self.remote.client_id {
            Some(id) => (id, false),
            None => {
                let id = ClientId::new();
                self.remote.client_id = Some(id);
                (id, true)
            }
        }
    }
}

impl SyncConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Debounce delay as a [`Duration`].
    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }

    /// Network timeout as a [`Duration`].
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout)
    }
}

impl RetryConfig {
    /// Base delay as a [`Duration`].
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Maximum delay as a [`Duration`].
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("Cirrus"),
            poll_interval: 30,
            debounce_delay_ms: 500,
            network_timeout: 30,
            max_batch_size: 500,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            user_id: String::new(),
            relative_root_path: "/".to_string(),
            client_id: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_secs: 300,
            jitter: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("cirrus")
                .join("index.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.poll_interval"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut require_positive = |field: &str, value: u64| {
            if value == 0 {
                errors.push(ValidationError {
                    field: field.into(),
                    message: "must be greater than 0".into(),
                });
            }
        };

        // --- sync ---
        require_positive("sync.poll_interval", self.sync.poll_interval);
        require_positive("sync.network_timeout", self.sync.network_timeout);
        require_positive("sync.max_batch_size", self.sync.max_batch_size as u64);

        // --- retry ---
        require_positive("retry.base_delay_ms", self.retry.base_delay_ms);
        require_positive("retry.max_delay_secs", self.retry.max_delay_secs);

        // Check sync root only when it does not start with `~` (tilde is expanded at runtime).
        let root_str = self.sync.root.to_string_lossy();
        if !root_str.starts_with('~') && !self.sync.root.exists() {
            errors.push(ValidationError {
                field: "sync.root".into(),
                message: format!("directory does not exist: {}", self.sync.root.display()),
            });
        }

        if self.retry.base_delay() > self.retry.max_delay() {
            errors.push(ValidationError {
                field: "retry.base_delay_ms".into(),
                message: format!(
                    "base delay ({} ms) must not exceed max delay ({} s)",
                    self.retry.base_delay_ms, self.retry.max_delay_secs
                ),
            });
        }

        // --- remote ---
        if !(self.remote.base_url.starts_with("http://")
            || self.remote.base_url.starts_with("https://"))
        {
            errors.push(ValidationError {
                field: "remote.base_url".into(),
                message: format!("must be an http(s) URL: '{}'", self.remote.base_url),
            });
        }
        if !self.remote.relative_root_path.starts_with('/') {
            errors.push(ValidationError {
                field: "remote.relative_root_path".into(),
                message: "must start with '/'".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        // --- database ---
        if self.database.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "database.path".into(),
                message: "must not be empty".into(),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use cirrus_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .sync_root(PathBuf::from("/home/user/Cirrus"))
///     .sync_poll_interval(60)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_root(mut self, root: PathBuf) -> Self {
        self.config.sync.root = root;
        self
    }

    pub fn sync_poll_interval(mut self, seconds: u64) -> Self {
        self.config.sync.poll_interval = seconds;
        self
    }

    pub fn sync_debounce_delay_ms(mut self, millis: u64) -> Self {
        self.config.sync.debounce_delay_ms = millis;
        self
    }

    pub fn sync_network_timeout(mut self, seconds: u64) -> Self {
        self.config.sync.network_timeout = seconds;
        self
    }

    pub fn sync_max_batch_size(mut self, n: usize) -> Self {
        self.config.sync.max_batch_size = n;
        self
    }

    // --- remote ---

    pub fn remote_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.remote.base_url = url.into();
        self
    }

    pub fn remote_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.config.remote.user_id = user_id.into();
        self
    }

    pub fn remote_relative_root_path(mut self, path: impl Into<String>) -> Self {
        self.config.remote.relative_root_path = path.into();
        self
    }

    pub fn remote_client_id(mut self, id: ClientId) -> Self {
        self.config.remote.client_id = Some(id);
        self
    }

    // --- retry ---

    pub fn retry_base_delay_ms(mut self, millis: u64) -> Self {
        self.config.retry.base_delay_ms = millis;
        self
    }

    pub fn retry_max_delay_secs(mut self, seconds: u64) -> Self {
        self.config.retry.max_delay_secs = seconds;
        self
    }

    pub fn retry_jitter(mut self, jitter: bool) -> Self {
        self.config.retry.jitter = jitter;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- database ---

    pub fn database_path(mut self, path: PathBuf) -> Self {
        self.config.database.path = path;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
