use anyhow::{anyhow, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for Crossposter
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Mastodon account to mirror from
    #[serde(default)]
    pub source: SourceConfig,

    /// Bluesky account to mirror to
    #[serde(default)]
    pub destination: DestinationConfig,

    /// Crossposting cycle behavior
    #[serde(default)]
    pub sync: SyncConfig,

    /// Watermark persistence
    #[serde(default)]
    pub state: StateConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Source feed settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    /// Instance base URL, e.g. "https://mastodon.social"
    #[serde(default)]
    pub instance: String,

    /// Account name on that instance, without the leading @
    #[serde(default)]
    pub username: String,

    /// HTTP timeout for outbox requests in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout: u64,
}

/// Destination settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DestinationConfig {
    /// PDS base URL
    #[serde(default = "default_service")]
    pub service: String,

    /// Handle or email used to log in
    #[serde(default)]
    pub identifier: String,

    /// Environment variable holding the app password
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// HTTP timeout for XRPC requests in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout: u64,
}

/// Crossposting cycle configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Upper bound in seconds for a single fetch or publish call
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Log would-be posts instead of publishing them
    #[serde(default)]
    pub dry_run: bool,
}

/// Watermark storage configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StateConfig {
    /// Storage backend
    #[serde(default = "default_state_backend")]
    pub backend: String, // "file", "sqlite"

    /// Location of the watermark file or database
    #[serde(default = "default_state_path")]
    pub path: String,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// Polling interval
    #[serde(default = "default_interval")]
    pub interval: String, // "5m"

    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "full"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_http_timeout() -> u64 {
    30
}
fn default_timeout() -> u64 {
    120
}
fn default_service() -> String {
    "https://bsky.social".to_string()
}
fn default_password_env() -> String {
    "BLUESKY_APP_PASSWORD".to_string()
}
fn default_state_backend() -> String {
    "file".to_string()
}
fn default_interval() -> String {
    "5m".to_string()
}

fn data_home() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        data_home
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share", home)
    } else {
        "/tmp".to_string()
    }
}

fn default_state_path() -> String {
    format!("{}/crossposter/lastPostId.txt", data_home())
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/crossposter.pid", runtime_dir)
    } else {
        "/tmp/crossposter.pid".to_string()
    }
}
fn default_log_file() -> String {
    format!("{}/crossposter/daemon.log", data_home())
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            instance: String::new(),
            username: String::new(),
            timeout: default_http_timeout(),
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            identifier: String::new(),
            password_env: default_password_env(),
            timeout: default_http_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            dry_run: false,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_state_backend(),
            path: default_state_path(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl SourceConfig {
    /// URL prefix shared by everything the account owns
    pub fn user_prefix(&self) -> String {
        format!(
            "{}/users/{}",
            self.instance.trim_end_matches('/'),
            self.username.trim_start_matches('@')
        )
    }

    /// First page of the account's ActivityPub outbox
    pub fn outbox_url(&self) -> String {
        format!("{}/outbox?page=true", self.user_prefix())
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.apply_env_overrides();
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.apply_env_overrides();
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("crossposter").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.state.path = shellexpand::full(&self.state.path)
            .context("Failed to expand state path")?
            .into_owned();

        self.daemon.pid_file = shellexpand::full(&self.daemon.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        self.daemon.log_file = shellexpand::full(&self.daemon.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        Ok(())
    }

    /// Apply the environment variables container deployments use
    pub fn apply_env_overrides(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }

        if let Some(instance) = var("MASTODON_INSTANCE") {
            self.source.instance = instance;
        }
        if let Some(username) = var("MASTODON_USERNAME") {
            self.source.username = username;
        }
        if let Some(service) = var("BLUESKY_INSTANCE") {
            self.destination.service = service;
        }
        if let Some(identifier) = var("BLUESKY_USERNAME") {
            self.destination.identifier = identifier;
        }
        if let Some(minutes) = var("INTERVAL_MINUTES") {
            self.daemon.interval = format!("{}m", minutes.trim());
        }
        if var("DRY_RUN").is_some() {
            self.sync.dry_run = true;
        }
    }

    /// Check the settings a cycle cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.source.instance.is_empty() || self.source.username.is_empty() {
            return Err(anyhow!(
                "Source account not configured. Set source.instance and source.username \
                 (or MASTODON_INSTANCE / MASTODON_USERNAME)"
            ));
        }
        if !self.sync.dry_run && self.destination.identifier.is_empty() {
            return Err(anyhow!(
                "Destination account not configured. Set destination.identifier (or BLUESKY_USERNAME)"
            ));
        }
        self.poll_interval()?;
        Ok(())
    }

    /// Read the destination app password from the environment
    pub fn destination_password(&self) -> Result<String> {
        let password = std::env::var(&self.destination.password_env).with_context(|| {
            format!(
                "{} environment variable not set",
                self.destination.password_env
            )
        })?;

        if password.is_empty() {
            return Err(anyhow!("{} is empty", self.destination.password_env));
        }

        Ok(password)
    }

    /// Polling interval parsed from `daemon.interval`
    pub fn poll_interval(&self) -> Result<Duration> {
        let secs = parse_duration(&self.daemon.interval)
            .with_context(|| format!("Invalid daemon interval: {:?}", self.daemon.interval))?;
        if secs == 0 {
            return Err(anyhow!("Daemon interval must be greater than zero"));
        }
        Ok(Duration::from_secs(secs))
    }

    /// Bound on a single fetch or publish call
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.timeout.max(1))
    }
}

/// Parse duration strings like "30s", "5m", "1h", "2d" into seconds
pub fn parse_duration(duration_str: &str) -> Result<u64> {
    let duration_str = duration_str.trim().to_lowercase();

    if let Some(value) = duration_str.strip_suffix('s') {
        value.trim().parse::<u64>().context("Invalid seconds value")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value.trim().parse::<u64>().map(|v| v * 60).context("Invalid minutes value")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value.trim().parse::<u64>().map(|v| v * 3600).context("Invalid hours value")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value.trim().parse::<u64>().map(|v| v * 86400).context("Invalid days value")
    } else {
        // Try to parse as raw seconds
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30s', '5m', '1h'")
    }
}
