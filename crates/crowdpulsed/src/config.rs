//! Daemon configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then `CROWDPULSE_*` environment variables.
//!
//! ```toml
//! enable_output = true
//! web_app_port = 5000
//! peer_url = "https://localhost:7001"
//!
//! [[devices]]
//! id = "{8a1c...}"
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Malformed values surface as `ConfigError`, never as a crash

use std::path::{Path, PathBuf};
use std::time::Duration;

use crowdpulse_core::DeviceId;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

// ============================================================================
// Constants
// ============================================================================

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "CROWDPULSE_CONFIG";

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "CROWDPULSE_";

/// Directory under `runtime_dir` the worker runs in.
pub const WORKER_DIR_NAME: &str = "flask_app";

const APP_DIR_NAME: &str = "crowdpulse";
const CONFIG_FILE_NAME: &str = "crowdpulse.toml";

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override held a value of the wrong shape.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

// ============================================================================
// Config
// ============================================================================

/// A camera the daemon attaches at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier as known to the video management server.
    pub id: DeviceId,

    /// Explicit stream URL. Derived from the peer port when absent.
    #[serde(default)]
    pub url: Option<String>,
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Re-log worker output and raise log verbosity to debug.
    pub enable_output: bool,

    /// Skip refreshing the worker's runtime files on startup.
    pub disable_unpack: bool,

    /// Interpreter used to launch the worker.
    pub worker_exec: String,

    /// Module passed to the interpreter with `-m`.
    pub worker_module: String,

    /// Delay before restarting a worker that exited on its own.
    pub restart_delay_secs: u64,

    /// Grace period between SIGTERM and SIGKILL when stopping the worker.
    pub stop_timeout_secs: u64,

    /// Whether unexpected worker exits trigger a restart.
    pub auto_restart: bool,

    /// Port the worker's web application listens on.
    pub web_app_port: u16,

    /// Base URL of the video management server.
    pub peer_url: String,

    /// Installed worker files, copied into `runtime_dir` on startup.
    pub asset_dir: PathBuf,

    /// Writable directory holding the worker's runtime copy.
    pub runtime_dir: PathBuf,

    /// Cameras attached at startup.
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_output: false,
            disable_unpack: false,
            worker_exec: "python3".to_string(),
            worker_module: "flaskr".to_string(),
            restart_delay_secs: 1,
            stop_timeout_secs: 30,
            auto_restart: true,
            web_app_port: 5000,
            peer_url: "https://localhost:7001".to_string(),
            asset_dir: default_asset_dir(),
            runtime_dir: state_dir().unwrap_or_else(|| PathBuf::from(".")),
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from defaults, the config file and the environment.
    ///
    /// `path` wins over `$CROWDPULSE_CONFIG`, which wins over the default
    /// location. A missing file at the default location is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Reads a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parses TOML text. Keys not present keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Default config file location: `<state_dir>/crowdpulse/crowdpulse.toml`.
    pub fn default_path() -> Option<PathBuf> {
        state_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
    }

    /// Applies `CROWDPULSE_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = var("ENABLE_OUTPUT") {
            self.enable_output = parse_bool(&key, &value)?;
        }
        if let Some((key, value)) = var("DISABLE_UNPACK") {
            self.disable_unpack = parse_bool(&key, &value)?;
        }
        if let Some((_, value)) = var("WORKER_EXEC") {
            self.worker_exec = value;
        }
        if let Some((_, value)) = var("WORKER_MODULE") {
            self.worker_module = value;
        }
        if let Some((key, value)) = var("RESTART_DELAY") {
            self.restart_delay_secs = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = var("STOP_TIMEOUT") {
            self.stop_timeout_secs = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = var("AUTO_RESTART") {
            self.auto_restart = parse_bool(&key, &value)?;
        }
        if let Some((key, value)) = var("WEB_APP_PORT") {
            self.web_app_port = parse_number(&key, &value)?;
        }
        if let Some((_, value)) = var("PEER_URL") {
            self.peer_url = value;
        }
        if let Some((_, value)) = var("ASSET_DIR") {
            self.asset_dir = PathBuf::from(value);
        }
        if let Some((_, value)) = var("RUNTIME_DIR") {
            self.runtime_dir = PathBuf::from(value);
        }

        Ok(())
    }

    /// Restart delay as a `Duration`.
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    /// Stop grace period as a `Duration`.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Directory the worker is launched in.
    pub fn worker_dir(&self) -> PathBuf {
        self.runtime_dir.join(WORKER_DIR_NAME)
    }

    /// Base URL of the worker's web application.
    pub fn web_app_url(&self) -> String {
        format!("http://localhost:{}", self.web_app_port)
    }
}

/// `<state_dir>/crowdpulse`, or `None` on platforms without a state dir.
pub fn state_dir() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join(APP_DIR_NAME))
}

fn default_asset_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_DIR_NAME)))
        .unwrap_or_else(|| PathBuf::from(WORKER_DIR_NAME))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Resolves the stream URL for a configured device.
///
/// An explicit `url` must parse; otherwise the URL is derived from the peer
/// port the same way attached devices get theirs.
pub fn device_stream_url(device: &DeviceConfig, peer_port: u16) -> Result<Url, ConfigError> {
    match &device.url {
        Some(raw) => Url::parse(raw).map_err(|_| invalid("devices.url", raw)),
        None => crowdpulse_core::stream_url_for(&device.id, peer_port)
            .map_err(|err| invalid("devices.id", &err.to_string())),
    }
}
