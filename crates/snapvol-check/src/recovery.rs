//! Per-volume check results attached to recovery point records.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snapvol_manifest::validate_asset;
use tempfile::NamedTempFile;

use crate::report::{ReportError, Result, VolumeCheckResult};

/// Metadata store for recovery points.
pub trait RecoveryPointStore: Send + Sync {
    /// Merge `results` into the (asset, epoch) record, replacing earlier
    /// results for the same volumes.
    fn record_check_results(
        &self,
        asset: &str,
        epoch: u64,
        results: &[VolumeCheckResult],
    ) -> Result<()>;

    /// Recorded results for a point, ordered by volume GUID.
    fn results_for(&self, asset: &str, epoch: u64) -> Result<Vec<VolumeCheckResult>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecoveryPointRecord {
    #[serde(default)]
    filesystem_checks: BTreeMap<String, VolumeCheckResult>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AssetRecord {
    #[serde(default)]
    points: BTreeMap<u64, RecoveryPointRecord>,
}

/// One JSON file per asset: `<root>/<asset>.json`.
#[derive(Debug, Clone)]
pub struct JsonRecoveryPointStore {
    root: PathBuf,
}

impl JsonRecoveryPointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, asset: &str) -> Result<PathBuf> {
        validate_asset(asset)?;
        Ok(self.root.join(format!("{}.json", asset)))
    }

    fn load(&self, path: &Path) -> Result<AssetRecord> {
        match File::open(path) {
            Ok(file) => Ok(serde_json::from_reader(BufReader::new(file))?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(AssetRecord::default()),
            Err(source) => Err(ReportError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn save(&self, path: &Path, record: &AssetRecord) -> Result<()> {
        let wrap = |source: io::Error| ReportError::Io {
            path: path.to_path_buf(),
            source,
        };
        fs::create_dir_all(&self.root).map_err(wrap)?;

        let tmp = NamedTempFile::new_in(&self.root).map_err(wrap)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, record)?;
            writer.flush().map_err(wrap)?;
        }
        tmp.as_file().sync_all().map_err(wrap)?;
        tmp.persist(path).map_err(|e| wrap(e.error))?;
        Ok(())
    }
}

impl RecoveryPointStore for JsonRecoveryPointStore {
    fn record_check_results(
        &self,
        asset: &str,
        epoch: u64,
        results: &[VolumeCheckResult],
    ) -> Result<()> {
        let path = self.path_for(asset)?;
        let mut record = self.load(&path)?;
        let point = record.points.entry(epoch).or_default();
        for result in results {
            point
                .filesystem_checks
                .insert(result.guid.clone(), result.clone());
        }
        self.save(&path, &record)
    }

    fn results_for(&self, asset: &str, epoch: u64) -> Result<Vec<VolumeCheckResult>> {
        let mut record = self.load(&self.path_for(asset)?)?;
        Ok(record
            .points
            .remove(&epoch)
            .map(|p| p.filesystem_checks.into_values().collect())
            .unwrap_or_default())
    }
}
