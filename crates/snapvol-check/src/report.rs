//! Check reports and their on-disk store.
//!
//! Layout: `<report_dir>/<asset>/<epoch>.json`, one report per recovery
//! point.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snapvol_manifest::{validate_asset, InvalidAsset};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::fsck::CheckStatus;

const REPORT_EXT: &str = "json";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    InvalidAsset(#[from] InvalidAsset),
}

pub type Result<T> = std::result::Result<T, ReportError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ReportError + '_ {
    move |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Result of checking one volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCheckResult {
    pub guid: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub detail: String,
}

impl VolumeCheckResult {
    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Pass
    }
}

/// All volume results of one check run for an (asset, epoch) point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemCheckReport {
    pub asset: String,
    pub epoch: u64,
    pub checked_at: DateTime<Utc>,
    pub results: Vec<VolumeCheckResult>,
}

impl FilesystemCheckReport {
    pub fn new(asset: impl Into<String>, epoch: u64) -> Self {
        Self {
            asset: asset.into(),
            epoch,
            checked_at: Utc::now(),
            results: Vec::new(),
        }
    }

    pub fn result(&self, guid: &str) -> Option<&VolumeCheckResult> {
        self.results.iter().find(|r| r.guid == guid)
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(VolumeCheckResult::passed)
    }
}

/// Report files under a root directory.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the reports of `asset`. The key must stay a single
    /// component under the root.
    fn asset_dir(&self, asset: &str) -> Result<PathBuf> {
        validate_asset(asset)?;
        Ok(self.root.join(asset))
    }

    pub fn path_for(&self, asset: &str, epoch: u64) -> Result<PathBuf> {
        Ok(self
            .asset_dir(asset)?
            .join(format!("{}.{}", epoch, REPORT_EXT)))
    }

    /// Write `report`, replacing any earlier report for the same point.
    pub fn write(&self, report: &FilesystemCheckReport) -> Result<PathBuf> {
        let dir = self.asset_dir(&report.asset)?;
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let path = self.path_for(&report.asset, report.epoch)?;
        let tmp = NamedTempFile::new_in(&dir).map_err(io_err(&dir))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, report)?;
            writer.flush().map_err(io_err(tmp.path()))?;
        }
        tmp.as_file().sync_all().map_err(io_err(tmp.path()))?;
        tmp.persist(&path)
            .map_err(|e| ReportError::Io {
                path: path.clone(),
                source: e.error,
            })?;

        debug!(path = %path.display(), "Wrote check report");
        Ok(path)
    }

    /// Report for a point, if one was written.
    pub fn read(&self, asset: &str, epoch: u64) -> Result<Option<FilesystemCheckReport>> {
        let path = self.path_for(asset, epoch)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        Ok(Some(serde_json::from_reader(BufReader::new(file))?))
    }

    /// Epochs with a report for `asset`, ascending.
    pub fn list_epochs(&self, asset: &str) -> Result<Vec<u64>> {
        let dir = self.asset_dir(asset)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir)(e)),
        };

        let mut epochs = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_err(&dir))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(REPORT_EXT) {
                continue;
            }
            if let Some(epoch) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                epochs.push(epoch);
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    /// Remove the report of a deleted recovery point. The asset directory
    /// goes too once it is empty. Returns whether a report was removed.
    pub fn delete_for_point(&self, asset: &str, epoch: u64) -> Result<bool> {
        let path = self.path_for(asset, epoch)?;
        let removed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(io_err(&path)(e)),
        };

        let dir = self.asset_dir(asset)?;
        let empty = match fs::read_dir(&dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(io_err(&dir)(e)),
        };
        if empty {
            fs::remove_dir(&dir).map_err(io_err(&dir))?;
        }
        Ok(removed)
    }

    /// Remove every report of a deleted asset.
    pub fn delete_for_asset(&self, asset: &str) -> Result<()> {
        let dir = self.asset_dir(asset)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir)(e)),
        }
    }
}
