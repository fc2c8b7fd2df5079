//! Addressing of snapshot clones.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default directory clones are mounted under
pub const DEFAULT_MOUNT_ROOT: &str = "/homePool";

/// Why a clone exists. Part of the clone's dataset name, so two purposes
/// never collide on the same asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClonePurpose {
    Verification,
    IntegrityCheck,
    Export,
}

impl ClonePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClonePurpose::Verification => "verification",
            ClonePurpose::IntegrityCheck => "integrityCheck",
            ClonePurpose::Export => "export",
        }
    }
}

impl fmt::Display for ClonePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown clone purpose: {0}")]
pub struct UnknownPurpose(pub String);

impl FromStr for ClonePurpose {
    type Err = UnknownPurpose;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verification" => Ok(ClonePurpose::Verification),
            "integrityCheck" => Ok(ClonePurpose::IntegrityCheck),
            "export" => Ok(ClonePurpose::Export),
            other => Err(UnknownPurpose(other.to_string())),
        }
    }
}

/// Clone of asset `asset`, snapshot `epoch`, for `purpose`.
///
/// Two specs with equal inputs address the same physical clone. Whether
/// `epoch` is an existing point of the asset is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloneSpec {
    asset: String,
    epoch: u64,
    purpose: ClonePurpose,
}

impl CloneSpec {
    pub fn from_asset(asset: impl Into<String>, epoch: u64, purpose: ClonePurpose) -> Self {
        Self {
            asset: asset.into(),
            epoch,
            purpose,
        }
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn purpose(&self) -> ClonePurpose {
        self.purpose
    }

    /// Clone dataset name relative to the pool: `<asset>-<purpose>`
    pub fn dataset_name(&self) -> String {
        format!("{}-{}", self.asset, self.purpose)
    }

    /// Source snapshot relative to the pool: `<asset>@<epoch>`
    pub fn snapshot_name(&self) -> String {
        format!("{}@{}", self.asset, self.epoch)
    }

    /// Mount path under the default mount root
    pub fn mount_path(&self) -> PathBuf {
        self.mount_path_under(Path::new(DEFAULT_MOUNT_ROOT))
    }

    /// Mount path under an explicit mount root
    pub fn mount_path_under(&self, root: &Path) -> PathBuf {
        root.join(self.dataset_name())
    }
}

impl fmt::Display for CloneSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.snapshot_name(), self.purpose)
    }
}
