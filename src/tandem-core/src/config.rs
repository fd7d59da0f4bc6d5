use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    /// Overrides the default `playlists.json` location in the data directory.
    #[serde(default)]
    pub playlists_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            logging: LoggingConfig::default(),
            playback: PlaybackConfig::default(),
            scan: ScanConfig::default(),
            backends: BackendsConfig::default(),
            playlists_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    /// Console sink. Backend processes always use stderr for it.
    #[serde(default = "default_console_enabled")]
    pub stdout: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            stdout: default_console_enabled(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Crash handling for the playback backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// Restarts tolerated on the same resource before it is marked incompatible.
    #[serde(default = "default_allowed_crashes")]
    pub allowed_crashes: u32,
    /// Crashes while idle after which the backend is considered broken.
    /// Unset means the backend is always restarted.
    #[serde(default)]
    pub idle_crash_limit: Option<u32>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            allowed_crashes: default_allowed_crashes(),
            idle_crash_limit: None,
        }
    }
}

/// Scanner watchdog timings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanConfig {
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            watchdog_ms: default_watchdog_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
        }
    }
}

impl ScanConfig {
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

/// How a backend process is launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendCommand {
    /// Executable to spawn; the running `tandem` binary when unset.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendsConfig {
    #[serde(default = "default_playback_backend")]
    pub playback: BackendCommand,
    #[serde(default = "default_scanner_backend")]
    pub scanner: BackendCommand,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            playback: default_playback_backend(),
            scanner: default_scanner_backend(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("scan.{field} must be greater than zero")]
    ZeroTimeout { field: &'static str },
    #[error("idle_crash_limit must be greater than zero when set")]
    ZeroIdleCrashLimit,
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn playlists_path(&self, dirs: &AppDirs) -> PathBuf {
        self.playlists_file
            .clone()
            .unwrap_or_else(|| dirs.data_dir().join("playlists.json"))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        if self.scan.watchdog_ms == 0 {
            return Err(ValidationError::ZeroTimeout {
                field: "watchdog_ms",
            });
        }
        if self.scan.kill_timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout {
                field: "kill_timeout_ms",
            });
        }
        if self.playback.idle_crash_limit == Some(0) {
            return Err(ValidationError::ZeroIdleCrashLimit);
        }
        Ok(())
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_console_enabled() -> bool {
    true
}

fn default_allowed_crashes() -> u32 {
    3
}

fn default_watchdog_ms() -> u64 {
    2_000
}

fn default_kill_timeout_ms() -> u64 {
    30_000
}

fn default_playback_backend() -> BackendCommand {
    BackendCommand {
        executable: None,
        args: vec!["backend".into(), "playback".into()],
        env: Vec::new(),
    }
}

fn default_scanner_backend() -> BackendCommand {
    BackendCommand {
        executable: None,
        args: vec!["backend".into(), "scan".into()],
        env: Vec::new(),
    }
}
