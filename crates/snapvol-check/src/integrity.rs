//! Filesystem checks over the acquired images of a snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;

use snapvol_config::{log_check_error, log_check_info};
use snapvol_image::VolumeImage;

use crate::fsck::FilesystemChecker;
use crate::recovery::RecoveryPointStore;
use crate::report::{FilesystemCheckReport, ReportStore, VolumeCheckResult};
use crate::CheckError;

/// GUIDs of the images whose volume is flagged as included in backups
pub fn included_guids(images: &[VolumeImage]) -> BTreeSet<String> {
    images
        .iter()
        .filter(|i| i.volume().included)
        .map(|i| i.guid().to_string())
        .collect()
}

/// Runs a [`FilesystemChecker`] over already-acquired images and persists
/// the outcome.
///
/// Never acquires or releases images; whoever owns the session does.
pub struct FilesystemIntegrityChecker {
    checker: Arc<dyn FilesystemChecker>,
    reports: ReportStore,
    recovery_points: Arc<dyn RecoveryPointStore>,
}

impl FilesystemIntegrityChecker {
    pub fn new(
        checker: Arc<dyn FilesystemChecker>,
        reports: ReportStore,
        recovery_points: Arc<dyn RecoveryPointStore>,
    ) -> Self {
        Self {
            checker,
            reports,
            recovery_points,
        }
    }

    pub fn reports(&self) -> &ReportStore {
        &self.reports
    }

    fn check_one(&self, image: &VolumeImage) -> Result<VolumeCheckResult, CheckError> {
        let partition = image
            .partition_path()
            .ok_or_else(|| CheckError::NotAcquired {
                guid: image.guid().to_string(),
            })?;
        let outcome = self.checker.check(partition, image.volume())?;
        Ok(VolumeCheckResult {
            guid: image.guid().to_string(),
            status: outcome.status,
            detail: outcome.detail,
        })
    }

    /// Check every image whose GUID is in `included`, write the report for
    /// (asset, epoch) and fold the results into the recovery point.
    ///
    /// A volume whose check errors out is logged and left out of the report;
    /// the remaining volumes are still checked.
    pub fn run(
        &self,
        asset: &str,
        epoch: u64,
        images: &[VolumeImage],
        included: &BTreeSet<String>,
    ) -> Result<FilesystemCheckReport, CheckError> {
        let mut report = FilesystemCheckReport::new(asset, epoch);

        for image in images.iter().filter(|i| included.contains(i.guid())) {
            match self.check_one(image) {
                Ok(result) => {
                    log_check_info!(
                        "Volume checked",
                        asset = asset,
                        epoch = epoch,
                        guid = image.guid(),
                        status = tracing::field::debug(result.status),
                    );
                    report.results.push(result);
                }
                Err(e) => log_check_error!(
                    "Volume check failed; skipping",
                    asset = asset,
                    epoch = epoch,
                    guid = image.guid(),
                    error = tracing::field::display(&e),
                ),
            }
        }

        self.reports.write(&report)?;
        self.recovery_points
            .record_check_results(asset, epoch, &report.results)?;

        log_check_info!(
            "Integrity check complete",
            asset = asset,
            epoch = epoch,
            checked = report.results.len(),
            passed = report.all_passed(),
        );
        Ok(report)
    }
}
