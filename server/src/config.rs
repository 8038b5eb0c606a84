//! Server configuration module.
//!
//! Configuration is read from a TOML file and then overridden by a few
//! environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `ASKBOX_CONFIG` | `config.toml` | Path of the TOML configuration file |
//! | `PORT` | from file, else 8080 | HTTP server port |
//! | `ASKBOX_ADMIN_PASSWORD` | from file | Admin password |
//!
//! # File Format
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [admin]
//! password = "change-me"
//! token_duration = "720h"
//!
//! [limits]
//! questions_per_hour = 5
//! questions_burst = 3
//! cleanup_interval_secs = 3600
//! retention_secs = 3600
//!
//! [hub]
//! queue_capacity = 256
//! publish_buffer = 64
//! max_viewers = 1000
//!
//! [ui]
//! site_name = "Askbox"
//! description = "Ask me anything"
//! timeline = true
//! read_tracking = false
//! ```
//!
//! Every section and key except `admin.password` is optional.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broadcast::{
    HubConfig, DEFAULT_MAX_VIEWERS, DEFAULT_PUBLISH_BUFFER, DEFAULT_QUEUE_CAPACITY,
};
use crate::error::ConfigError;
use crate::rate_limit::{DEFAULT_CLEANUP_INTERVAL, DEFAULT_RETENTION};

/// Environment variable naming the configuration file.
pub const ENV_CONFIG_PATH: &str = "ASKBOX_CONFIG";

/// Environment variable overriding `server.port`.
pub const ENV_PORT: &str = "PORT";

/// Environment variable overriding `admin.password`.
pub const ENV_ADMIN_PASSWORD: &str = "ASKBOX_ADMIN_PASSWORD";

/// Configuration file used when `ASKBOX_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_TOKEN_DURATION: &str = "720h";
const DEFAULT_QUESTIONS_PER_HOUR: u32 = 5;
const DEFAULT_QUESTIONS_BURST: u32 = 3;

/// Complete server configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub admin: AdminConfig,
    pub limits: LimitsConfig,
    pub hub: HubSettings,
    pub ui: UiConfig,
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
        }
    }
}

/// `[admin]` section.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Plaintext admin password. Only its hash is kept at runtime.
    pub password: String,
    /// Token lifetime, such as `"720h"` or `"1h30m"`.
    pub token_duration: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            token_duration: DEFAULT_TOKEN_DURATION.to_owned(),
        }
    }
}

impl fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminConfig")
            .field("password", &"[REDACTED]")
            .field("token_duration", &self.token_duration)
            .finish()
    }
}

/// `[limits]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub questions_per_hour: u32,
    pub questions_burst: u32,
    pub cleanup_interval_secs: u64,
    pub retention_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            questions_per_hour: DEFAULT_QUESTIONS_PER_HOUR,
            questions_burst: DEFAULT_QUESTIONS_BURST,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL.as_secs(),
            retention_secs: DEFAULT_RETENTION.as_secs(),
        }
    }
}

impl LimitsConfig {
    /// Bucket refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.questions_per_hour) / 3600.0
    }

    /// Eviction sweep period.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Idle time after which a client's limiter is evicted.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// `[hub]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub queue_capacity: usize,
    pub publish_buffer: usize,
    pub max_viewers: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            publish_buffer: DEFAULT_PUBLISH_BUFFER,
            max_viewers: DEFAULT_MAX_VIEWERS,
        }
    }
}

impl From<&HubSettings> for HubConfig {
    fn from(settings: &HubSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            publish_buffer: settings.publish_buffer,
            max_viewers: settings.max_viewers,
        }
    }
}

/// `[ui]` section, passed through to the frontend.
///
/// Serializes with camelCase keys for `GET /config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all(serialize = "camelCase"))]
pub struct UiConfig {
    pub site_name: String,
    pub description: String,
    pub timeline: bool,
    pub read_tracking: bool,
    pub theme: UiTheme,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            site_name: "Askbox".to_owned(),
            description: "Ask me anything".to_owned(),
            timeline: false,
            read_tracking: false,
            theme: UiTheme::default(),
        }
    }
}

/// UI settings shared between request handlers and the reload watcher.
pub type SharedUiConfig = Arc<RwLock<UiConfig>>;

/// `[ui.theme]` colors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all(serialize = "camelCase"))]
pub struct UiTheme {
    pub text: String,
    pub text_muted: String,
    pub surface: String,
    pub background: String,
}

impl Config {
    /// Loads configuration from the file named by `ASKBOX_CONFIG`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, if an
    /// environment override is malformed, or if validation fails.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use askbox_server::config::Config;
    ///
    /// let config = Config::load().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.server.port);
    /// ```
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(config_path())
    }

    /// Loads configuration from `path`, then applies environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| ConfigError::file_error(format!("{}: {err}", path.display())))?;

        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;

        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parses a TOML document without applying overrides or validating.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|err| ConfigError::parse(err.to_string()))
    }

    /// Applies `PORT` and `ASKBOX_ADMIN_PASSWORD`.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        match env::var(ENV_PORT) {
            Ok(port) => {
                self.server.port = port.trim().parse().map_err(|_| {
                    ConfigError::invalid(ENV_PORT, "must be a number between 1 and 65535")
                })?;
            }
            Err(env::VarError::NotPresent) => {}
            Err(env::VarError::NotUnicode(_)) => {
                return Err(ConfigError::invalid(ENV_PORT, "contains invalid unicode"));
            }
        }

        if let Ok(password) = env::var(ENV_ADMIN_PASSWORD) {
            if !password.is_empty() {
                self.admin.password = password;
            }
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin.password.is_empty() {
            return Err(ConfigError::missing("admin.password"));
        }

        if self.server.port == 0 {
            return Err(ConfigError::invalid(
                "server.port",
                "must be a number between 1 and 65535",
            ));
        }

        if self.limits.questions_per_hour == 0 {
            return Err(ConfigError::invalid(
                "limits.questions_per_hour",
                "must be at least 1",
            ));
        }

        if self.limits.questions_burst == 0 {
            return Err(ConfigError::invalid(
                "limits.questions_burst",
                "must be at least 1",
            ));
        }

        if self.limits.cleanup_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "limits.cleanup_interval_secs",
                "must be greater than zero",
            ));
        }

        let hub = [
            ("hub.queue_capacity", self.hub.queue_capacity),
            ("hub.publish_buffer", self.hub.publish_buffer),
            ("hub.max_viewers", self.hub.max_viewers),
        ];
        for (key, value) in hub {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be at least 1"));
            }
        }

        Ok(())
    }

    /// Address to bind, as `host:port`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Hub sizing.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig::from(&self.hub)
    }
}

/// Path of the configuration file, from `ASKBOX_CONFIG` or the default.
pub fn config_path() -> PathBuf {
    env::var_os(ENV_CONFIG_PATH)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::io::Write;

    /// Helper to temporarily set environment variables for testing.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.iter().rev() {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    fn clear_overrides(guard: &mut EnvGuard) {
        guard.remove(ENV_PORT);
        guard.remove(ENV_ADMIN_PASSWORD);
        guard.remove(ENV_CONFIG_PATH);
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const FULL: &str = r##"
[server]
host = "127.0.0.1"
port = 9000

[admin]
password = "s3cret"
token_duration = "24h"

[limits]
questions_per_hour = 10
questions_burst = 2
cleanup_interval_secs = 600
retention_secs = 1800

[hub]
queue_capacity = 32
publish_buffer = 8
max_viewers = 50

[ui]
site_name = "My Box"
description = "Questions welcome"
timeline = true
read_tracking = true

[ui.theme]
text = "#111"
background = "#fff"
"##;

    #[test]
    #[serial]
    fn test_load_full_file() {
        let mut guard = EnvGuard::new();
        clear_overrides(&mut guard);
        let file = write_config(FULL);

        let config = Config::load_from(file.path()).expect("should parse config");

        assert_eq!(config.bind_address(), "127.0.0.1:9000");
        assert_eq!(config.admin.password, "s3cret");
        assert_eq!(config.admin.token_duration, "24h");
        assert_eq!(config.limits.questions_per_hour, 10);
        assert_eq!(config.limits.questions_burst, 2);
        assert_eq!(config.limits.cleanup_interval(), Duration::from_secs(600));
        assert_eq!(config.limits.retention(), Duration::from_secs(1800));
        assert_eq!(
            config.hub_config(),
            HubConfig {
                queue_capacity: 32,
                publish_buffer: 8,
                max_viewers: 50,
            }
        );
        assert_eq!(config.ui.site_name, "My Box");
        assert!(config.ui.timeline);
        assert_eq!(config.ui.theme.text, "#111");
        assert_eq!(config.ui.theme.surface, "");
    }

    #[test]
    #[serial]
    fn test_minimal_file_uses_defaults() {
        let mut guard = EnvGuard::new();
        clear_overrides(&mut guard);
        let file = write_config("[admin]\npassword = \"pw\"\n");

        let config = Config::load_from(file.path()).expect("should parse config");

        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.admin.token_duration, "720h");
        assert_eq!(config.limits, LimitsConfig::default());
        assert_eq!(config.hub_config(), HubConfig::default());
        assert_eq!(config.ui.site_name, "Askbox");
    }

    #[test]
    #[serial]
    fn test_missing_password_is_rejected() {
        let mut guard = EnvGuard::new();
        clear_overrides(&mut guard);
        let file = write_config("[server]\nport = 8081\n");

        let err = Config::load_from(file.path()).unwrap_err();
        assert_eq!(err, ConfigError::missing("admin.password"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut guard = EnvGuard::new();
        clear_overrides(&mut guard);
        guard.set(ENV_PORT, "9090");
        guard.set(ENV_ADMIN_PASSWORD, "from-env");
        let file = write_config("[admin]\npassword = \"from-file\"\n");

        let config = Config::load_from(file.path()).expect("should parse config");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.admin.password, "from-env");
    }

    #[test]
    #[serial]
    fn test_env_password_satisfies_requirement() {
        let mut guard = EnvGuard::new();
        clear_overrides(&mut guard);
        guard.set(ENV_ADMIN_PASSWORD, "from-env");
        let file = write_config("");

        let config = Config::load_from(file.path()).expect("should parse config");
        assert_eq!(config.admin.password, "from-env");
    }

    #[test]
    #[serial]
    fn test_invalid_port_env() {
        let mut guard = EnvGuard::new();
        clear_overrides(&mut guard);
        guard.set(ENV_PORT, "not-a-port");
        let file = write_config("[admin]\npassword = \"pw\"\n");

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == ENV_PORT));
    }

    #[test]
    #[serial]
    fn test_missing_file() {
        let mut guard = EnvGuard::new();
        clear_overrides(&mut guard);

        let err = Config::load_from("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileError(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let err = Config::from_toml_str("[admin\npassword = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_zero_burst_rejected() {
        let mut config = Config::from_toml_str("[admin]\npassword = \"pw\"\n").unwrap();
        config.limits.questions_burst = 0;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "limits.questions_burst"));
    }

    #[test]
    fn test_zero_rate_rejected() {
        let config = Config::from_toml_str(
            "[admin]\npassword = \"pw\"\n[limits]\nquestions_per_hour = 0\n",
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { ref key, .. } if key == "limits.questions_per_hour")
        );
    }

    #[test]
    fn test_zero_hub_sizes_rejected() {
        let mut config = Config::from_toml_str("[admin]\npassword = \"pw\"\n").unwrap();
        config.hub.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = Config::from_toml_str("[admin]\npassword = \"hunter2\"\n").unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    #[serial]
    fn test_config_path_from_env() {
        let mut guard = EnvGuard::new();
        guard.remove(ENV_CONFIG_PATH);
        assert_eq!(config_path(), PathBuf::from(DEFAULT_CONFIG_PATH));

        guard.set(ENV_CONFIG_PATH, "/etc/askbox.toml");
        assert_eq!(config_path(), PathBuf::from("/etc/askbox.toml"));
    }
}
