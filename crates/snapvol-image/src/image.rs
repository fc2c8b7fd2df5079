//! One volume of a mounted clone, exposed as a block device.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapvol_config::{log_image_debug, log_image_warn};
use snapvol_manifest::VolumeEntry;
use thiserror::Error;

use crate::device::{BlockDevices, DeviceError};
use crate::spec::CloneSpec;

/// Extension of a volume's backing container inside a clone
pub const CONTAINER_EXT: &str = "img";

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("volume {guid} is already acquired")]
    AlreadyAcquired { guid: String },

    #[error("volume {guid} was released and cannot be reused")]
    Released { guid: String },

    #[error("no key file available to decrypt volume {guid}")]
    MissingKey { guid: String },

    #[error("failed to acquire volume {guid}: {source}")]
    Acquisition {
        guid: String,
        #[source]
        source: DeviceError,
    },

    #[error("failed to release volume {guid}: {source}")]
    Release {
        guid: String,
        #[source]
        source: DeviceError,
    },
}

impl ImageError {
    /// Misuse of the acquire/release lifecycle rather than a device failure
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            ImageError::AlreadyAcquired { .. } | ImageError::Released { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Unacquired,
    Acquired,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Open a decryption mapping for encrypted volumes
    pub decrypt: bool,
    pub read_only: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            decrypt: true,
            read_only: false,
        }
    }
}

#[derive(Debug)]
struct Attachment {
    loop_device: PathBuf,
    /// Mapping name and mapped device node
    crypt: Option<(String, PathBuf)>,
}

/// A volume inside a mounted clone.
///
/// Lifecycle is `Unacquired -> Acquired -> Released`. Releasing an image
/// that is not acquired does nothing; acquiring twice, or after release,
/// is an error. An image dropped while acquired is released best-effort.
pub struct VolumeImage {
    spec: CloneSpec,
    volume: VolumeEntry,
    backing: PathBuf,
    key_file: Option<PathBuf>,
    devices: Arc<dyn BlockDevices>,
    state: ImageState,
    attachment: Option<Attachment>,
}

impl VolumeImage {
    pub fn new(
        spec: CloneSpec,
        volume: VolumeEntry,
        backing: PathBuf,
        key_file: Option<PathBuf>,
        devices: Arc<dyn BlockDevices>,
    ) -> Self {
        Self {
            spec,
            volume,
            backing,
            key_file,
            devices,
            state: ImageState::Unacquired,
            attachment: None,
        }
    }

    /// Backing container for `volume` inside a clone mounted at `mount_path`
    pub fn container_path(mount_path: &Path, volume: &VolumeEntry) -> PathBuf {
        mount_path.join(format!("{}.{}", volume.guid, CONTAINER_EXT))
    }

    pub fn spec(&self) -> &CloneSpec {
        &self.spec
    }

    pub fn volume(&self) -> &VolumeEntry {
        &self.volume
    }

    pub fn guid(&self) -> &str {
        &self.volume.guid
    }

    pub fn backing_path(&self) -> &Path {
        &self.backing
    }

    pub fn state(&self) -> ImageState {
        self.state
    }

    pub fn is_acquired(&self) -> bool {
        self.state == ImageState::Acquired
    }

    pub fn requires_decryption(&self) -> bool {
        self.volume.encrypted
    }

    /// Loop device node while acquired
    pub fn device_path(&self) -> Option<&Path> {
        self.attachment.as_ref().map(|a| a.loop_device.as_path())
    }

    /// Device node holding the volume's filesystem: the decryption mapping
    /// when one is open, the loop device otherwise.
    pub fn partition_path(&self) -> Option<&Path> {
        self.attachment.as_ref().map(|a| match &a.crypt {
            Some((_, mapped)) => mapped.as_path(),
            None => a.loop_device.as_path(),
        })
    }

    fn mapping_name(&self) -> String {
        format!("{}-{}", self.spec.dataset_name(), self.volume.guid)
    }

    /// Attach the backing container, opening a decryption mapping when the
    /// volume is encrypted and `options.decrypt` is set.
    ///
    /// A failed mapping detaches the loop device again before returning.
    pub fn acquire(&mut self, options: AcquireOptions) -> Result<(), ImageError> {
        let guid = self.volume.guid.clone();
        match self.state {
            ImageState::Acquired => return Err(ImageError::AlreadyAcquired { guid }),
            ImageState::Released => return Err(ImageError::Released { guid }),
            ImageState::Unacquired => {}
        }

        let needs_crypt = options.decrypt && self.requires_decryption();
        let key_file = match (needs_crypt, &self.key_file) {
            (true, None) => return Err(ImageError::MissingKey { guid }),
            (true, Some(key)) => Some(key.clone()),
            (false, _) => None,
        };

        let loop_device = self
            .devices
            .attach(&self.backing, options.read_only)
            .map_err(|source| ImageError::Acquisition {
                guid: guid.clone(),
                source,
            })?;

        let crypt = match key_file {
            None => None,
            Some(key) => {
                let name = self.mapping_name();
                match self.devices.open_crypt(&loop_device, &name, &key) {
                    Ok(mapped) => Some((name, mapped)),
                    Err(source) => {
                        if let Err(e) = self.devices.detach(&loop_device) {
                            log_image_warn!(
                                "Failed to detach after decryption failure",
                                guid = guid.as_str(),
                                device = tracing::field::display(loop_device.display()),
                                error = tracing::field::display(&e),
                            );
                        }
                        return Err(ImageError::Acquisition { guid, source });
                    }
                }
            }
        };

        log_image_debug!(
            "Volume acquired",
            guid = guid.as_str(),
            device = tracing::field::display(loop_device.display()),
            decrypted = crypt.is_some(),
        );
        self.attachment = Some(Attachment { loop_device, crypt });
        self.state = ImageState::Acquired;
        Ok(())
    }

    /// Close the decryption mapping and detach the loop device.
    ///
    /// Both teardown steps are always attempted and the image ends up
    /// `Released` either way; the first failure is returned.
    pub fn release(&mut self) -> Result<(), ImageError> {
        if self.state != ImageState::Acquired {
            return Ok(());
        }
        self.state = ImageState::Released;

        let Some(attachment) = self.attachment.take() else {
            return Ok(());
        };
        let guid = &self.volume.guid;
        let mut first_error = None;

        if let Some((name, _)) = &attachment.crypt {
            if let Err(source) = self.devices.close_crypt(name) {
                first_error.get_or_insert(ImageError::Release {
                    guid: guid.clone(),
                    source,
                });
            }
        }
        if let Err(source) = self.devices.detach(&attachment.loop_device) {
            first_error.get_or_insert(ImageError::Release {
                guid: guid.clone(),
                source,
            });
        }

        log_image_debug!("Volume released", guid = guid.as_str());
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// [`release`](Self::release) for cleanup paths: failures are logged,
    /// never returned.
    pub fn release_quietly(&mut self) {
        if let Err(e) = self.release() {
            log_image_warn!(
                "Volume release failed",
                guid = self.volume.guid.as_str(),
                error = tracing::field::display(&e),
            );
        }
    }
}

impl Drop for VolumeImage {
    fn drop(&mut self) {
        self.release_quietly();
    }
}

impl fmt::Debug for VolumeImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeImage")
            .field("spec", &self.spec)
            .field("guid", &self.volume.guid)
            .field("backing", &self.backing)
            .field("state", &self.state)
            .field("attachment", &self.attachment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ClonePurpose;
    use crate::testing::{volume, MemoryBlockDevices};

    fn image(devices: &Arc<MemoryBlockDevices>, guid: &str, encrypted: bool) -> VolumeImage {
        let spec = CloneSpec::from_asset("agent-42", 1, ClonePurpose::Verification);
        let mut vol = volume(guid, false, true);
        vol.encrypted = encrypted;
        let backing = VolumeImage::container_path(Path::new("/mnt/clone"), &vol);
        VolumeImage::new(
            spec,
            vol,
            backing,
            Some(PathBuf::from("/keys/agent-42.key")),
            devices.clone(),
        )
    }

    #[test]
    fn test_acquire_and_release() {
        let devices = Arc::new(MemoryBlockDevices::new());
        let mut img = image(&devices, "C-vol-guid", false);
        assert_eq!(img.backing_path(), Path::new("/mnt/clone/C-vol-guid.img"));

        img.acquire(AcquireOptions::default()).unwrap();
        assert!(img.is_acquired());
        assert_eq!(img.partition_path(), img.device_path());
        assert_eq!(devices.attached_count(), 1);

        img.release().unwrap();
        assert_eq!(img.state(), ImageState::Released);
        assert!(img.partition_path().is_none());
        assert_eq!(devices.attached_count(), 0);
    }

    #[test]
    fn test_double_acquire_is_state_error() {
        let devices = Arc::new(MemoryBlockDevices::new());
        let mut img = image(&devices, "C-vol-guid", false);
        img.acquire(AcquireOptions::default()).unwrap();

        let err = img.acquire(AcquireOptions::default()).unwrap_err();
        assert!(matches!(err, ImageError::AlreadyAcquired { .. }));
        assert!(err.is_state_error());
        assert_eq!(devices.attached_count(), 1);
    }

    #[test]
    fn test_release_is_idempotent_and_final() {
        let devices = Arc::new(MemoryBlockDevices::new());
        let mut img = image(&devices, "C-vol-guid", false);

        // Not acquired yet: no-op
        img.release().unwrap();
        assert_eq!(img.state(), ImageState::Unacquired);

        img.acquire(AcquireOptions::default()).unwrap();
        img.release().unwrap();
        img.release().unwrap();
        assert_eq!(devices.detach_calls(), 1);

        let err = img.acquire(AcquireOptions::default()).unwrap_err();
        assert!(matches!(err, ImageError::Released { .. }));
    }

    #[test]
    fn test_encrypted_volume_gets_mapping() {
        let devices = Arc::new(MemoryBlockDevices::new());
        let mut img = image(&devices, "C-vol-guid", true);
        img.acquire(AcquireOptions::default()).unwrap();

        let partition = img.partition_path().unwrap();
        assert!(partition.starts_with("/dev/mapper"));
        assert_ne!(Some(partition), img.device_path());
        assert_eq!(devices.open_mappings(), 1);

        img.release().unwrap();
        assert_eq!(devices.open_mappings(), 0);
    }

    #[test]
    fn test_encrypted_without_decrypt_uses_loop_device() {
        let devices = Arc::new(MemoryBlockDevices::new());
        let mut img = image(&devices, "C-vol-guid", true);
        img.acquire(AcquireOptions {
            decrypt: false,
            read_only: true,
        })
        .unwrap();
        assert_eq!(img.partition_path(), img.device_path());
        assert_eq!(devices.open_mappings(), 0);
    }

    #[test]
    fn test_mapping_failure_detaches_loop_device() {
        let devices = Arc::new(MemoryBlockDevices::new());
        devices.fail_crypt(true);
        let mut img = image(&devices, "C-vol-guid", true);

        let err = img.acquire(AcquireOptions::default()).unwrap_err();
        assert!(matches!(err, ImageError::Acquisition { .. }));
        assert_eq!(img.state(), ImageState::Unacquired);
        assert_eq!(devices.attached_count(), 0);
    }

    #[test]
    fn test_missing_key_fails_before_attach() {
        let devices = Arc::new(MemoryBlockDevices::new());
        let spec = CloneSpec::from_asset("agent-42", 1, ClonePurpose::Verification);
        let mut vol = volume("C-vol-guid", true, true);
        vol.encrypted = true;
        let mut img = VolumeImage::new(spec, vol, PathBuf::from("/x.img"), None, devices.clone());

        let err = img.acquire(AcquireOptions::default()).unwrap_err();
        assert!(matches!(err, ImageError::MissingKey { .. }));
        assert_eq!(devices.attach_calls(), 0);
    }

    #[test]
    fn test_release_failure_still_marks_released() {
        let devices = Arc::new(MemoryBlockDevices::new());
        let mut img = image(&devices, "C-vol-guid", false);
        img.acquire(AcquireOptions::default()).unwrap();
        devices.fail_detach(true);

        let err = img.release().unwrap_err();
        assert!(matches!(err, ImageError::Release { .. }));
        assert_eq!(img.state(), ImageState::Released);

        // Quiet release after the fact does nothing and does not panic
        img.release_quietly();
        assert_eq!(devices.detach_calls(), 1);
    }

    #[test]
    fn test_drop_releases_acquired_image() {
        let devices = Arc::new(MemoryBlockDevices::new());
        {
            let mut img = image(&devices, "C-vol-guid", false);
            img.acquire(AcquireOptions::default()).unwrap();
            assert_eq!(devices.attached_count(), 1);
        }
        assert_eq!(devices.attached_count(), 0);
    }
}
