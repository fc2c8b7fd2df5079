//! # snapvol-check
//!
//! Filesystem integrity checks for snapshot volumes.
//!
//! [`FilesystemIntegrityChecker`] consumes images acquired by a
//! [`SnapshotImageSession`](snapvol_image::SnapshotImageSession), writes one
//! report per (asset, epoch) and records the per-volume results on the
//! recovery point. [`IntegrityCheckJob`] wires the two together.

pub mod fsck;
pub mod integrity;
pub mod job;
pub mod recovery;
pub mod report;

use snapvol_image::{CommandError, SessionError};
use thiserror::Error;

pub use fsck::{CheckOutcome, CheckStatus, FilesystemChecker, FsckChecker};
pub use integrity::{included_guids, FilesystemIntegrityChecker};
pub use job::IntegrityCheckJob;
pub use recovery::{JsonRecoveryPointStore, RecoveryPointStore};
pub use report::{FilesystemCheckReport, ReportError, ReportStore, VolumeCheckResult};

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("failed to run {program}: {source}")]
    Tool {
        program: String,
        #[source]
        source: CommandError,
    },

    #[error("{program} could not complete the check (exit {code:?}): {detail}")]
    Aborted {
        program: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("no checker for {filesystem} filesystem on volume {guid}")]
    Unsupported { guid: String, filesystem: String },

    #[error("volume {guid} is not attached")]
    NotAcquired { guid: String },

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Session(#[from] SessionError),
}
