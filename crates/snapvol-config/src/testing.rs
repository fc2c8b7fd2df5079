//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary clone mount root
//! - Report and recovery point directories
//! - Key and lock directories
//!
//! # Usage
//!
//! ```ignore
//! use snapvol_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.config();
//!     // config.store.mount_root, config.check.report_dir, ... are isolated
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Clones are "mounted" under here
    pub mount_root: PathBuf,
    pub report_dir: PathBuf,
    pub recovery_point_dir: PathBuf,
    pub key_dir: PathBuf,
    pub lock_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let mount_root = root.join("mnt");
        let report_dir = root.join("fscheck");
        let recovery_point_dir = root.join("recovery-points");
        let key_dir = root.join("keys");
        let lock_dir = root.join("locks");

        for dir in [&mount_root, &report_dir, &recovery_point_dir, &key_dir, &lock_dir] {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Self {
            _temp_dir: temp_dir,
            mount_root,
            report_dir,
            recovery_point_dir,
            key_dir,
            lock_dir,
            test_id,
        })
    }

    /// Unique pool name so parallel tests never share dataset names
    pub fn pool(&self) -> String {
        format!("testPool{}", self.test_id)
    }

    /// Build a config that points every directory into this environment
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.store.pool = self.pool();
        cfg.store.mount_root = self.mount_root.clone();
        cfg.devices.key_dir = Some(self.key_dir.clone());
        cfg.check.report_dir = self.report_dir.clone();
        cfg.check.recovery_point_dir = self.recovery_point_dir.clone();
        cfg.session.lock_dir = Some(self.lock_dir.clone());
        cfg
    }

    /// Write a key file for an encrypted asset
    pub fn create_key(&self, asset: &str, key: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.key_dir.join(format!("{}.key", asset));
        std::fs::write(&path, key)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
