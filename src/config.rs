use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable budgets, loaded from an optional TOML file.
///
/// Every field has a default, so an empty file (or no file) yields the
/// production values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub boot: BootTiming,
    pub watchdog: WatchdogTiming,
}

/// Bounded retry budgets used while booting and tearing down an instance.
///
/// All waits are iteration counts times a fixed sleep, not deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootTiming {
    pub console_connect_attempts: u32,
    pub console_connect_interval_ms: u64,
    pub ready_attempts: u32,
    pub ready_interval_ms: u64,
    /// Pause between the firmware reporting ready and starting the runtime.
    pub settle_ms: u64,
    pub exit_poll_attempts: u32,
    pub exit_poll_interval_ms: u64,
}

impl Default for BootTiming {
    fn default() -> Self {
        Self {
            console_connect_attempts: 20,
            console_connect_interval_ms: 200,
            ready_attempts: 150,
            ready_interval_ms: 200,
            settle_ms: 4000,
            exit_poll_attempts: 10,
            exit_poll_interval_ms: 100,
        }
    }
}

impl BootTiming {
    pub fn console_connect_interval(&self) -> Duration {
        Duration::from_millis(self.console_connect_interval_ms)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogTiming {
    pub interval_secs: u64,
    pub idle_threshold_secs: u64,
}

impl Default for WatchdogTiming {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            idle_threshold_secs: 300,
        }
    }
}

impl ControllerConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &std::path::Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }
}

/// Everything an instance needs to know about the host it runs on.
#[derive(Debug, Clone)]
pub struct EmulatorSettings {
    /// Emulator executable.
    pub qemu_bin: PathBuf,
    /// Working directory for the emulator process.
    pub qemu_dir: PathBuf,
    /// Root of per-platform images: `<root>/<platform>/qemu/...`.
    pub image_root: PathBuf,
    /// Companion runtime executable.
    pub pkjs_bin: PathBuf,
    /// Ask the runtime to refuse outbound requests to private networks.
    pub block_private_addresses: bool,
    pub timing: BootTiming,
}

impl EmulatorSettings {
    pub fn image_dir(&self, platform: &str) -> PathBuf {
        self.image_root.join(platform).join("qemu")
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if the config file is world-writable.
#[cfg(unix)]
pub fn check_config_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_writable(mode) {
        tracing::warn!(
            "Config file {} is world-writable (mode {:o}); anyone on the host can change \
             emulator budgets.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &std::path::Path) {}

#[cfg(unix)]
pub fn is_world_writable(mode: u32) -> bool {
    mode & 0o002 != 0
}
