//! Clone → build images → acquire images, with guaranteed teardown.
//!
//! ```text
//! NotStarted -> CloneCreated -> ImagesBuilt -> Ready -> Released
//!      \              \              \
//!       `--------------`--------------`--> Failed
//! ```
//!
//! Setup failures after the clone exists tear down whatever was acquired so
//! far before the error is returned. Teardown never fails: each image and
//! the clone are released independently and problems are logged.

use std::io;
use std::path::PathBuf;

use snapvol_config::{log_session_debug, log_session_error, log_session_info, log_session_warn};
use snapvol_manifest::ManifestError;
use thiserror::Error;

use crate::factory::ImageFactory;
use crate::image::{AcquireOptions, ImageError, VolumeImage};
use crate::lock::CloneLock;
use crate::spec::{ClonePurpose, CloneSpec};
use crate::store::{CloneError, CloneStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    CloneCreated,
    ImagesBuilt,
    Ready,
    Released,
    Failed,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("clone {dataset} for {asset}@{epoch} already exists or is in use")]
    CloneConflict {
        asset: String,
        epoch: u64,
        dataset: String,
    },

    #[error("clone stage failed for {asset}@{epoch}: {source}")]
    Clone {
        asset: String,
        epoch: u64,
        #[source]
        source: CloneError,
    },

    #[error("manifest stage failed for {asset}@{epoch}: {source}")]
    Manifest {
        asset: String,
        epoch: u64,
        #[source]
        source: ManifestError,
    },

    #[error("acquire stage failed for {asset}@{epoch}: {source}")]
    Acquisition {
        asset: String,
        epoch: u64,
        #[source]
        source: ImageError,
    },

    #[error("lock stage failed for {asset}@{epoch}: {source}")]
    Lock {
        asset: String,
        epoch: u64,
        #[source]
        source: io::Error,
    },

    #[error("session for {asset}@{epoch} cannot start from state {state:?}")]
    InvalidState {
        asset: String,
        epoch: u64,
        state: SessionState,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub acquire: AcquireOptions,
    /// Require the asset's encryption key to be loaded before cloning
    pub ensure_decrypted: bool,
    /// Take an advisory lock per clone dataset in this directory
    pub lock_dir: Option<PathBuf>,
    /// Build images for excluded volumes but leave them unacquired
    pub skip_excluded: bool,
}

/// One pipeline run for an (asset, epoch, purpose) tuple.
///
/// Owns the clone it creates and every image built from it. Cleanup runs on
/// [`cleanup`](Self::cleanup) or when the session is dropped. Not meant to be
/// shared between threads.
pub struct SnapshotImageSession<'a> {
    clones: &'a CloneStore,
    factory: &'a ImageFactory,
    spec: CloneSpec,
    options: SessionOptions,
    state: SessionState,
    images: Vec<VolumeImage>,
    /// Set once this session created the clone
    owns_clone: bool,
    lock: Option<CloneLock>,
}

impl<'a> SnapshotImageSession<'a> {
    pub fn new(
        clones: &'a CloneStore,
        factory: &'a ImageFactory,
        asset: impl Into<String>,
        epoch: u64,
        purpose: ClonePurpose,
        options: SessionOptions,
    ) -> Self {
        Self {
            clones,
            factory,
            spec: CloneSpec::from_asset(asset, epoch, purpose),
            options,
            state: SessionState::NotStarted,
            images: Vec::new(),
            owns_clone: false,
            lock: None,
        }
    }

    pub fn spec(&self) -> &CloneSpec {
        &self.spec
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn images(&self) -> &[VolumeImage] {
        &self.images
    }

    /// Image of the volume flagged as holding the operating system
    pub fn os_image(&self) -> Option<&VolumeImage> {
        self.images.iter().find(|i| i.volume().os_volume)
    }

    /// Create the clone, build one image per volume and acquire them all.
    ///
    /// A clone that already exists fails fast and is left untouched.
    pub fn setup(&mut self) -> Result<&[VolumeImage], SessionError> {
        let asset = self.spec.asset().to_string();
        let epoch = self.spec.epoch();
        let dataset = self.spec.dataset_name();

        if self.state != SessionState::NotStarted {
            return Err(SessionError::InvalidState {
                asset,
                epoch,
                state: self.state,
            });
        }

        if let Some(lock_dir) = &self.options.lock_dir {
            match CloneLock::try_acquire(lock_dir, &self.spec) {
                Ok(Some(lock)) => self.lock = Some(lock),
                Ok(None) => {
                    self.state = SessionState::Failed;
                    log_session_warn!("Clone lock held elsewhere", dataset = dataset.as_str());
                    return Err(SessionError::CloneConflict {
                        asset,
                        epoch,
                        dataset,
                    });
                }
                Err(source) => {
                    self.state = SessionState::Failed;
                    return Err(SessionError::Lock {
                        asset,
                        epoch,
                        source,
                    });
                }
            }
        }

        // 1. Refuse leftovers
        let exists = match self.clones.exists(&self.spec) {
            Ok(exists) => exists,
            Err(source) => return Err(self.fail_clone(source)),
        };
        if exists {
            self.state = SessionState::Failed;
            self.lock = None;
            log_session_error!(
                "Clone already exists; refusing to reuse it",
                dataset = dataset.as_str(),
            );
            return Err(SessionError::CloneConflict {
                asset,
                epoch,
                dataset,
            });
        }

        // 2. Clone
        if let Err(source) = self.clones.create(&self.spec, self.options.ensure_decrypted) {
            return Err(self.fail_clone(source));
        }
        self.owns_clone = true;
        self.state = SessionState::CloneCreated;

        // 3. Build images
        let mount_path = self.clones.mount_path(&self.spec);
        match self
            .factory
            .create_images_for_snapshot(&self.spec, &mount_path)
        {
            Ok(images) => self.images = images,
            Err(source) => {
                self.state = SessionState::Failed;
                self.release_resources();
                return Err(SessionError::Manifest {
                    asset,
                    epoch,
                    source,
                });
            }
        }
        self.state = SessionState::ImagesBuilt;

        // 4. Acquire in manifest order
        let acquire = self.options.acquire;
        let skip_excluded = self.options.skip_excluded;
        let failure = self
            .images
            .iter_mut()
            .filter(|image| !skip_excluded || image.volume().included)
            .find_map(|image| image.acquire(acquire).err());
        if let Some(source) = failure {
            self.state = SessionState::Failed;
            self.release_resources();
            return Err(SessionError::Acquisition {
                asset,
                epoch,
                source,
            });
        }

        self.state = SessionState::Ready;
        log_session_info!(
            "Snapshot images ready",
            asset = asset.as_str(),
            epoch = epoch,
            images = self.images.len(),
        );
        Ok(self.images.as_slice())
    }

    fn fail_clone(&mut self, source: CloneError) -> SessionError {
        self.state = SessionState::Failed;
        self.lock = None;
        let asset = self.spec.asset().to_string();
        let epoch = self.spec.epoch();
        match source {
            CloneError::AlreadyExists { dataset } => SessionError::CloneConflict {
                asset,
                epoch,
                dataset,
            },
            source => SessionError::Clone {
                asset,
                epoch,
                source,
            },
        }
    }

    /// Release every image and destroy the clone this session created.
    ///
    /// Safe from any state and idempotent; never fails.
    pub fn cleanup(&mut self) {
        if self.state == SessionState::Released {
            return;
        }
        self.release_resources();
        if self.state != SessionState::Failed {
            self.state = SessionState::Released;
        }
    }

    fn release_resources(&mut self) {
        release_images(&mut self.images);
        if self.owns_clone {
            self.owns_clone = false;
            destroy_clone_quietly(self.clones, &self.spec);
        }
        self.lock = None;
    }

    /// Cleanup for a tuple this process may not have set up, such as a clone
    /// left behind by a crashed run: release `images`, then destroy the clone
    /// if present. Never fails.
    pub fn cleanup_for(clones: &CloneStore, spec: &CloneSpec, images: &mut [VolumeImage]) {
        release_images(images);
        match clones.exists(spec) {
            Ok(true) => destroy_clone_quietly(clones, spec),
            Ok(false) => {}
            Err(e) => log_session_error!(
                "Could not query clone during cleanup",
                dataset = spec.dataset_name().as_str(),
                error = tracing::field::display(&e),
            ),
        }
    }

    /// Set up a session, hand its images to `consume`, and clean up on every
    /// exit path. Returns the consumer's result.
    pub fn with_images<T, E, F>(
        clones: &'a CloneStore,
        factory: &'a ImageFactory,
        spec: &CloneSpec,
        options: SessionOptions,
        consume: F,
    ) -> Result<T, E>
    where
        E: From<SessionError>,
        F: FnOnce(&[VolumeImage]) -> Result<T, E>,
    {
        let mut session = SnapshotImageSession::new(
            clones,
            factory,
            spec.asset(),
            spec.epoch(),
            spec.purpose(),
            options,
        );
        let result = match session.setup() {
            Ok(images) => consume(images),
            Err(e) => Err(e.into()),
        };
        session.cleanup();
        result
    }
}

impl Drop for SnapshotImageSession<'_> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for SnapshotImageSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotImageSession")
            .field("spec", &self.spec)
            .field("state", &self.state)
            .field("images", &self.images.len())
            .field("owns_clone", &self.owns_clone)
            .finish()
    }
}

/// Release each image independently; one stuck image does not block the rest.
fn release_images(images: &mut [VolumeImage]) {
    for image in images.iter_mut() {
        image.release_quietly();
    }
}

fn destroy_clone_quietly(clones: &CloneStore, spec: &CloneSpec) {
    match clones.destroy(spec) {
        Ok(()) => log_session_debug!(
            "Clone torn down",
            dataset = spec.dataset_name().as_str()
        ),
        Err(e) => log_session_error!(
            "Failed to destroy clone during cleanup",
            dataset = spec.dataset_name().as_str(),
            error = tracing::field::display(&e),
        ),
    }
}
