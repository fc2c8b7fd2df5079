//! Clone a snapshot, check its filesystems, tear the clone down.

use std::collections::BTreeSet;

use snapvol_image::{
    AcquireOptions, ClonePurpose, CloneSpec, CloneStore, ImageFactory, SessionOptions,
    SnapshotImageSession,
};

use crate::integrity::{included_guids, FilesystemIntegrityChecker};
use crate::report::FilesystemCheckReport;
use crate::CheckError;

pub struct IntegrityCheckJob<'a> {
    clones: &'a CloneStore,
    factory: &'a ImageFactory,
    checker: &'a FilesystemIntegrityChecker,
    options: SessionOptions,
}

impl<'a> IntegrityCheckJob<'a> {
    /// Images are attached read-only regardless of `options.acquire`.
    pub fn new(
        clones: &'a CloneStore,
        factory: &'a ImageFactory,
        checker: &'a FilesystemIntegrityChecker,
        mut options: SessionOptions,
    ) -> Self {
        options.acquire = AcquireOptions {
            read_only: true,
            ..options.acquire
        };
        Self {
            clones,
            factory,
            checker,
            options,
        }
    }

    /// Check the volumes of (asset, epoch).
    ///
    /// With `include` unset, the manifest's inclusion flags decide which
    /// volumes are checked and excluded volumes are never attached.
    pub fn run(
        &self,
        asset: &str,
        epoch: u64,
        include: Option<&BTreeSet<String>>,
    ) -> Result<FilesystemCheckReport, CheckError> {
        let spec = CloneSpec::from_asset(asset, epoch, ClonePurpose::IntegrityCheck);
        let options = SessionOptions {
            skip_excluded: include.is_none(),
            ..self.options.clone()
        };

        SnapshotImageSession::with_images(
            self.clones,
            self.factory,
            &spec,
            options,
            |images| match include {
                Some(guids) => self.checker.run(asset, epoch, images, guids),
                None => self
                    .checker
                    .run(asset, epoch, images, &included_guids(images)),
            },
        )
    }
}
