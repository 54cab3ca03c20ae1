// =============================================================================
// CONFIGURATION - device, queue and debug settings from hgi.toml
// =============================================================================
//
// Every section and key is optional. A file that is missing, unreadable or
// out of range leaves the whole config at its defaults.

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "hgi.toml";

/// Environment variable naming an alternative config file
pub const CONFIG_ENV_VAR: &str = "HGIVULKAN_CONFIG";

/// Environment variable that turns on debug labels regardless of config
pub const DEBUG_ENV_VAR: &str = "HGIVULKAN_DEBUG";

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub queue: QueueConfig,
    pub debug: DebugConfig,
}

/// Which native device backs the Hgi
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Vulkan,
    Headless,
}

/// Device settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: String,
    pub app_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: "vulkan".to_string(),
            app_name: "hgi-vulkan".to_string(),
        }
    }
}

/// Command queue settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    /// Blocking fence waits give up (fatally) after this long
    pub fence_timeout_ms: u64,
    /// Sleep between polls while all in-flight ids are taken
    pub acquire_poll_interval_us: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            fence_timeout_ms: 100_000,
            acquire_poll_interval_us: 50,
        }
    }
}

impl QueueConfig {
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn acquire_poll_interval(&self) -> Duration {
        Duration::from_micros(self.acquire_poll_interval_us)
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DebugConfig {
    /// Record debug labels and markers into command buffers
    pub enabled: bool,
    pub validation_layers: bool,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            validation_layers: true,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load `hgi.toml` (or the file named by `HGIVULKAN_CONFIG`). A missing
    /// or invalid file falls back to defaults.
    pub fn load() -> Self {
        let path = std::env::var_os(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from_path(&path).unwrap_or_else(|e| {
            log::warn!("Ignoring {:?}: {:#}. Using defaults.", path, e);
            Config::default()
        })
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::info!("No config at {:?}, using defaults", path);
                return Ok(Config::default());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };

        let config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate().with_context(|| format!("Invalid settings in {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);
        Ok(config)
    }

    /// Reject settings that would make every fence wait or acquisition spin
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.queue.fence_timeout_ms > 0,
            "queue.fence_timeout_ms must be positive"
        );
        ensure!(
            self.queue.acquire_poll_interval_us > 0,
            "queue.acquire_poll_interval_us must be positive"
        );
        ensure!(!self.device.app_name.contains('\0'), "device.app_name contains a NUL byte");
        Ok(())
    }

    /// Get the configured backend
    pub fn backend_kind(&self) -> BackendKind {
        match self.device.backend.to_lowercase().as_str() {
            "vulkan" => BackendKind::Vulkan,
            "headless" => BackendKind::Headless,
            _ => {
                log::warn!(
                    "Unknown backend '{}', defaulting to vulkan",
                    self.device.backend
                );
                BackendKind::Vulkan
            }
        }
    }

    /// Get the configured log level
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            log::warn!(
                "Unknown log level '{}', defaulting to info",
                self.debug.log_level
            );
            log::LevelFilter::Info
        })
    }

    /// Debug labels are on if the config or the environment asks for them
    pub fn debug_enabled(&self) -> bool {
        self.debug.enabled || env_debug_enabled()
    }
}

/// `HGIVULKAN_DEBUG` set to anything but "0"/"false"; read once per process
pub fn env_debug_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var(DEBUG_ENV_VAR)
            .map(|value| !matches!(value.trim(), "" | "0" | "false"))
            .unwrap_or(false)
    })
}
