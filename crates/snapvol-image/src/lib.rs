//! # snapvol-image
//!
//! Turns an immutable snapshot of an asset into block-device accessible
//! volume images:
//!
//! - [`CloneSpec`]: deterministic names for a (asset, epoch, purpose) clone
//! - [`CloneStore`]: create/destroy writable clones over a [`DatasetStore`]
//! - [`ImageFactory`]: one [`VolumeImage`] per volume in the clone's manifest
//! - [`SnapshotImageSession`]: the whole pipeline with guaranteed teardown

pub mod command;
pub mod device;
pub mod factory;
pub mod image;
pub mod lock;
pub mod session;
pub mod spec;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use command::CommandError;
pub use device::{BlockDevices, CommandBlockDevices, DeviceError};
pub use factory::ImageFactory;
pub use image::{AcquireOptions, ImageError, ImageState, VolumeImage};
pub use lock::CloneLock;
pub use session::{SessionError, SessionOptions, SessionState, SnapshotImageSession};
pub use spec::{ClonePurpose, CloneSpec, UnknownPurpose, DEFAULT_MOUNT_ROOT};
pub use store::{CloneError, CloneStore, DatasetStore, StoreError, ZfsDatasetStore};
