//! Writable clones of immutable snapshots.
//!
//! [`DatasetStore`] is the seam to the snapshot store itself;
//! [`ZfsDatasetStore`] drives it through the `zfs` binary. [`CloneStore`]
//! adds the clone lifecycle rules on top.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapvol_config::{log_clone_debug, log_clone_info, StoreConfig};
use snapvol_manifest::{validate_asset, InvalidAsset};
use thiserror::Error;

use crate::command::{self, CommandError};
use crate::spec::CloneSpec;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CloneError {
    #[error(transparent)]
    InvalidAsset(#[from] InvalidAsset),

    #[error("clone {dataset} already exists")]
    AlreadyExists { dataset: String },

    #[error("encryption key for {asset} is not loaded")]
    Locked { asset: String },

    #[error("failed to query clone {dataset}: {source}")]
    Query {
        dataset: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to create clone {dataset}: {source}")]
    Creation {
        dataset: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to destroy clone {dataset}: {source}")]
    Destroy {
        dataset: String,
        #[source]
        source: StoreError,
    },
}

/// Snapshot/dataset store primitives. Dataset and snapshot names are
/// relative to the store's pool.
pub trait DatasetStore: Send + Sync {
    fn clone_exists(&self, dataset: &str) -> Result<bool, StoreError>;

    /// Clone `source_snapshot` into `dataset` and mount it at `mount_path`.
    fn create_clone(
        &self,
        dataset: &str,
        source_snapshot: &str,
        mount_path: &Path,
    ) -> Result<(), StoreError>;

    /// Unmount and destroy `dataset`.
    fn destroy_clone(&self, dataset: &str) -> Result<(), StoreError>;

    /// Whether the encryption key of `dataset` is loaded. Unencrypted
    /// datasets always report `true`.
    fn key_available(&self, dataset: &str) -> Result<bool, StoreError> {
        let _ = dataset;
        Ok(true)
    }
}

/// [`DatasetStore`] backed by the `zfs` command.
#[derive(Debug, Clone)]
pub struct ZfsDatasetStore {
    zfs: PathBuf,
    pool: String,
}

impl ZfsDatasetStore {
    pub fn new(zfs: impl Into<PathBuf>, pool: impl Into<String>) -> Self {
        Self {
            zfs: zfs.into(),
            pool: pool.into(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(&config.zfs, &config.pool)
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}/{}", self.pool, name)
    }
}

impl DatasetStore for ZfsDatasetStore {
    fn clone_exists(&self, dataset: &str) -> Result<bool, StoreError> {
        let name = self.qualify(dataset);
        match command::run(&self.zfs, &["list", "-H", "-o", "name", name.as_str()]) {
            Ok(out) => Ok(out.lines().any(|l| l.trim() == name)),
            Err(CommandError::Failed { ref stderr, .. }) if stderr.contains("does not exist") => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_clone(
        &self,
        dataset: &str,
        source_snapshot: &str,
        mount_path: &Path,
    ) -> Result<(), StoreError> {
        let mountpoint = format!("mountpoint={}", mount_path.display());
        let source = self.qualify(source_snapshot);
        let target = self.qualify(dataset);
        command::run(
            &self.zfs,
            &["clone", "-o", mountpoint.as_str(), source.as_str(), target.as_str()],
        )?;
        Ok(())
    }

    fn destroy_clone(&self, dataset: &str) -> Result<(), StoreError> {
        let target = self.qualify(dataset);
        command::run(&self.zfs, &["destroy", "-f", target.as_str()])?;
        Ok(())
    }

    fn key_available(&self, dataset: &str) -> Result<bool, StoreError> {
        let name = self.qualify(dataset);
        let status = command::run(
            &self.zfs,
            &["get", "-H", "-o", "value", "keystatus", name.as_str()],
        )?;
        Ok(matches!(status.as_str(), "available" | "-"))
    }
}

/// Clone lifecycle over a [`DatasetStore`].
#[derive(Clone)]
pub struct CloneStore {
    store: Arc<dyn DatasetStore>,
    mount_root: PathBuf,
}

impl CloneStore {
    pub fn new(store: Arc<dyn DatasetStore>, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            mount_root: mount_root.into(),
        }
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Where the clone for `spec` is mounted
    pub fn mount_path(&self, spec: &CloneSpec) -> PathBuf {
        spec.mount_path_under(&self.mount_root)
    }

    /// Whether the clone for `spec` is present. Every lifecycle operation
    /// goes through here, so a malformed asset key never reaches the store.
    pub fn exists(&self, spec: &CloneSpec) -> Result<bool, CloneError> {
        validate_asset(spec.asset())?;
        let dataset = spec.dataset_name();
        self.store
            .clone_exists(&dataset)
            .map_err(|source| CloneError::Query { dataset, source })
    }

    /// Create and mount the clone for `spec`.
    ///
    /// A clone that is already present is an error, never reused: it is
    /// left over from a run that did not clean up.
    pub fn create(&self, spec: &CloneSpec, ensure_decrypted: bool) -> Result<(), CloneError> {
        let dataset = spec.dataset_name();
        if self.exists(spec)? {
            return Err(CloneError::AlreadyExists { dataset });
        }

        if ensure_decrypted {
            let unlocked = self
                .store
                .key_available(spec.asset())
                .map_err(|source| CloneError::Query {
                    dataset: spec.asset().to_string(),
                    source,
                })?;
            if !unlocked {
                return Err(CloneError::Locked {
                    asset: spec.asset().to_string(),
                });
            }
        }

        let mount_path = self.mount_path(spec);
        self.store
            .create_clone(&dataset, &spec.snapshot_name(), &mount_path)
            .map_err(|source| CloneError::Creation {
                dataset: dataset.clone(),
                source,
            })?;

        log_clone_info!(
            "Clone created",
            dataset = dataset.as_str(),
            mount_path = tracing::field::display(mount_path.display()),
        );
        Ok(())
    }

    /// Unmount and destroy the clone for `spec`. Absent clones are a no-op.
    pub fn destroy(&self, spec: &CloneSpec) -> Result<(), CloneError> {
        let dataset = spec.dataset_name();
        if !self.exists(spec)? {
            log_clone_debug!("Clone already absent", dataset = dataset.as_str());
            return Ok(());
        }

        self.store
            .destroy_clone(&dataset)
            .map_err(|source| CloneError::Destroy {
                dataset: dataset.clone(),
                source,
            })?;

        log_clone_info!("Clone destroyed", dataset = dataset.as_str());
        Ok(())
    }
}

impl std::fmt::Debug for CloneStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneStore")
            .field("mount_root", &self.mount_root)
            .finish_non_exhaustive()
    }
}
