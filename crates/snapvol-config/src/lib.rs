//! # snapvol-config
//!
//! Configuration management for snapvol.
//!
//! Loads configuration from:
//! 1. `/etc/snapvol/config.toml` (system)
//! 2. `<config_dir>/snapvol/config.toml` (user, overrides system)
//! 3. Environment variables (highest priority)
//!
//! There is no global instance: callers load a [`Config`] once and hand the
//! relevant sections to the constructors that need them.

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// System-wide config location
pub const SYSTEM_CONFIG_PATH: &str = "/etc/snapvol/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub devices: DeviceConfig,
    pub check: CheckConfig,
    pub inject: InjectConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. System config
        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            debug!("Loading system config from {:?}", system_path);
            config = Self::load_from(system_path)?;
        }

        // 2. User config - overrides system
        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                debug!("Loading user config from {:?}", user_path);
                let user_config = Self::load_from(&user_path)?;
                config.merge(user_config);
            }
        }

        // 3. Environment
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single config file without merging or env overrides
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// User config path: `<config_dir>/snapvol/config.toml`
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("snapvol").join("config.toml"))
    }

    /// Merge a higher-priority config. Only values that differ from the
    /// built-in defaults replace what is already loaded.
    fn merge(&mut self, other: Config) {
        let defaults = Config::default();

        if other.store.pool != defaults.store.pool {
            self.store.pool = other.store.pool;
        }
        if other.store.mount_root != defaults.store.mount_root {
            self.store.mount_root = other.store.mount_root;
        }
        if other.store.zfs != defaults.store.zfs {
            self.store.zfs = other.store.zfs;
        }
        if other.devices.losetup != defaults.devices.losetup {
            self.devices.losetup = other.devices.losetup;
        }
        if other.devices.cryptsetup != defaults.devices.cryptsetup {
            self.devices.cryptsetup = other.devices.cryptsetup;
        }
        if other.devices.key_dir.is_some() {
            self.devices.key_dir = other.devices.key_dir;
        }
        if other.devices.read_only != defaults.devices.read_only {
            self.devices.read_only = other.devices.read_only;
        }
        if other.check.report_dir != defaults.check.report_dir {
            self.check.report_dir = other.check.report_dir;
        }
        if other.check.recovery_point_dir != defaults.check.recovery_point_dir {
            self.check.recovery_point_dir = other.check.recovery_point_dir;
        }
        if other.check.e2fsck != defaults.check.e2fsck {
            self.check.e2fsck = other.check.e2fsck;
        }
        if other.check.ntfsfix != defaults.check.ntfsfix {
            self.check.ntfsfix = other.check.ntfsfix;
        }
        if other.inject.tool != defaults.inject.tool {
            self.inject.tool = other.inject.tool;
        }
        if other.inject.scripts_dir != defaults.inject.scripts_dir {
            self.inject.scripts_dir = other.inject.scripts_dir;
        }
        if other.session.lock_dir.is_some() {
            self.session.lock_dir = other.session.lock_dir;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(pool) = std::env::var("SNAPVOL_POOL") {
            self.store.pool = pool;
        }
        if let Ok(path) = std::env::var("SNAPVOL_MOUNT_ROOT") {
            self.store.mount_root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("SNAPVOL_REPORT_DIR") {
            self.check.report_dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("SNAPVOL_KEY_DIR") {
            self.devices.key_dir = Some(PathBuf::from(path));
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

/// Dataset store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// ZFS pool holding asset datasets and their clones
    pub pool: String,
    /// Directory clones are mounted under
    pub mount_root: PathBuf,
    /// `zfs` binary
    pub zfs: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pool: "homePool".to_string(),
            mount_root: PathBuf::from("/homePool"),
            zfs: PathBuf::from("zfs"),
        }
    }
}

/// Block device tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub losetup: PathBuf,
    pub cryptsetup: PathBuf,
    /// Directory holding `<asset>.key` files for encrypted volumes
    pub key_dir: Option<PathBuf>,
    /// Attach loop devices read-only unless a consumer needs to write
    pub read_only: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            losetup: PathBuf::from("losetup"),
            cryptsetup: PathBuf::from("cryptsetup"),
            key_dir: None,
            read_only: false,
        }
    }
}

/// Filesystem integrity check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Root of the per-asset check reports
    pub report_dir: PathBuf,
    /// Root of the recovery point records
    pub recovery_point_dir: PathBuf,
    pub e2fsck: PathBuf,
    pub ntfsfix: PathBuf,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            report_dir: PathBuf::from("/var/lib/snapvol/fscheck"),
            recovery_point_dir: PathBuf::from("/var/lib/snapvol/recovery-points"),
            e2fsck: PathBuf::from("e2fsck"),
            ntfsfix: PathBuf::from("ntfsfix"),
        }
    }
}

/// Diagnostic agent injection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectConfig {
    /// Injection tool binary
    pub tool: PathBuf,
    /// Directory holding verification scripts
    pub scripts_dir: PathBuf,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            tool: PathBuf::from("/usr/lib/snapvol/inject-agent"),
            scripts_dir: PathBuf::from("/var/lib/snapvol/scripts"),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// When set, sessions take an advisory lock per clone dataset here
    pub lock_dir: Option<PathBuf>,
}
