//! # snapvol-manifest
//!
//! Typed volume manifest for a snapshot.
//!
//! Every snapshot carries a `volumes.json` at the root of its dataset that
//! lists the volumes captured in that point, in the order they were backed
//! up. A mounted clone therefore exposes the manifest of the snapshot it was
//! cloned from.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// File name of the manifest at the root of a snapshot
pub const MANIFEST_FILE: &str = "volumes.json";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("I/O error reading manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Manifest belongs to asset {found}, expected {expected}")]
    AssetMismatch { expected: String, found: String },

    #[error("Manifest belongs to epoch {found}, expected {expected}")]
    EpochMismatch { expected: u64, found: u64 },
}

/// An asset key that cannot be used as a path or dataset component.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid asset key {0:?}")]
pub struct InvalidAsset(pub String);

/// Check that `asset` names exactly one path component and one dataset name
/// component. Asset keys are joined onto report directories and clone dataset
/// names, so separators, snapshot markers and relative components are refused.
pub fn validate_asset(asset: &str) -> std::result::Result<(), InvalidAsset> {
    let bad = asset.is_empty()
        || asset == "."
        || asset.contains("..")
        || asset.contains(['/', '\\', '@', '\0']);
    if bad {
        return Err(InvalidAsset(asset.to_string()));
    }
    Ok(())
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Filesystem found on a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    Ntfs,
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Refs,
    Fat32,
    #[serde(other)]
    Unknown,
}

impl Filesystem {
    pub fn is_ext(&self) -> bool {
        matches!(self, Filesystem::Ext2 | Filesystem::Ext3 | Filesystem::Ext4)
    }
}

/// One volume captured in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEntry {
    /// Volume GUID, also the stem of its backing container
    pub guid: String,
    /// Where the volume was mounted on the protected machine (`C:`, `/`)
    #[serde(default)]
    pub mount_point: String,
    pub filesystem: Filesystem,
    /// Volume that holds the operating system
    #[serde(default)]
    pub os_volume: bool,
    /// Included in backups at the time of the snapshot
    #[serde(default = "default_true")]
    pub included: bool,
    /// Backing container is encrypted and needs a decryption mapping
    #[serde(default)]
    pub encrypted: bool,
}

fn default_true() -> bool {
    true
}

/// Ordered volumes of one snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeManifest {
    pub asset: String,
    pub epoch: u64,
    pub volumes: Vec<VolumeEntry>,
}

impl VolumeManifest {
    /// Load a manifest from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let manifest = serde_json::from_reader(BufReader::new(file))?;
        Ok(manifest)
    }

    /// Save the manifest to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush().map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }
}

/// Source of snapshot volume manifests.
pub trait ManifestSource: Send + Sync {
    /// Read the ordered volume list for `asset` at `epoch`, whose clone is
    /// mounted at `mount_path`.
    fn load(&self, asset: &str, epoch: u64, mount_path: &Path) -> Result<VolumeManifest>;
}

/// Reads `volumes.json` from the root of a mounted clone.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloneManifestSource;

impl ManifestSource for CloneManifestSource {
    fn load(&self, asset: &str, epoch: u64, mount_path: &Path) -> Result<VolumeManifest> {
        let path = mount_path.join(MANIFEST_FILE);
        debug!(asset, epoch, path = %path.display(), "Reading volume manifest");

        let manifest = VolumeManifest::load(&path)?;
        if manifest.asset != asset {
            return Err(ManifestError::AssetMismatch {
                expected: asset.to_string(),
                found: manifest.asset,
            });
        }
        if manifest.epoch != epoch {
            return Err(ManifestError::EpochMismatch {
                expected: epoch,
                found: manifest.epoch,
            });
        }
        Ok(manifest)
    }
}
