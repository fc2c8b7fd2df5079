//! Builds the volume images of a mounted clone from its manifest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapvol_manifest::{ManifestError, ManifestSource};
use tracing::debug;

use crate::device::BlockDevices;
use crate::image::VolumeImage;
use crate::spec::CloneSpec;

pub struct ImageFactory {
    manifests: Arc<dyn ManifestSource>,
    devices: Arc<dyn BlockDevices>,
    /// Directory of `<asset>.key` files
    key_dir: Option<PathBuf>,
}

impl ImageFactory {
    pub fn new(
        manifests: Arc<dyn ManifestSource>,
        devices: Arc<dyn BlockDevices>,
        key_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            manifests,
            devices,
            key_dir,
        }
    }

    fn key_file(&self, asset: &str) -> Option<PathBuf> {
        self.key_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.key", asset)))
    }

    /// One unacquired image per manifest entry, in manifest order.
    pub fn create_images_for_snapshot(
        &self,
        spec: &CloneSpec,
        mount_path: &Path,
    ) -> Result<Vec<VolumeImage>, ManifestError> {
        let manifest = self
            .manifests
            .load(spec.asset(), spec.epoch(), mount_path)?;

        let images: Vec<VolumeImage> = manifest
            .volumes
            .into_iter()
            .map(|volume| {
                let backing = VolumeImage::container_path(mount_path, &volume);
                let key_file = if volume.encrypted {
                    self.key_file(spec.asset())
                } else {
                    None
                };
                VolumeImage::new(spec.clone(), volume, backing, key_file, self.devices.clone())
            })
            .collect();

        debug!(
            snapshot = %spec.snapshot_name(),
            count = images.len(),
            "Built volume images"
        );
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageState;
    use crate::spec::ClonePurpose;
    use crate::testing::{volume, MemoryBlockDevices};
    use snapvol_manifest::{CloneManifestSource, VolumeManifest, MANIFEST_FILE};
    use tempfile::TempDir;

    fn factory(key_dir: Option<PathBuf>) -> ImageFactory {
        ImageFactory::new(
            Arc::new(CloneManifestSource),
            Arc::new(MemoryBlockDevices::new()),
            key_dir,
        )
    }

    #[test]
    fn test_images_follow_manifest_order() {
        let temp = TempDir::new().unwrap();
        let mut encrypted = volume("B", false, true);
        encrypted.encrypted = true;
        VolumeManifest {
            asset: "agent-42".to_string(),
            epoch: 7,
            volumes: vec![volume("A", true, true), encrypted, volume("C", false, false)],
        }
        .save(temp.path().join(MANIFEST_FILE))
        .unwrap();

        let spec = CloneSpec::from_asset("agent-42", 7, ClonePurpose::Export);
        let images = factory(Some(PathBuf::from("/keys")))
            .create_images_for_snapshot(&spec, temp.path())
            .unwrap();

        let guids: Vec<_> = images.iter().map(|i| i.guid()).collect();
        assert_eq!(guids, vec!["A", "B", "C"]);
        assert!(images.iter().all(|i| i.state() == ImageState::Unacquired));
        assert_eq!(images[1].backing_path(), temp.path().join("B.img"));
        assert!(images[1].requires_decryption());
        assert!(!images[0].requires_decryption());
    }

    #[test]
    fn test_unreadable_manifest_is_error() {
        let temp = TempDir::new().unwrap();
        let spec = CloneSpec::from_asset("agent-42", 7, ClonePurpose::Export);
        let err = factory(None)
            .create_images_for_snapshot(&spec, temp.path())
            .unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
    }
}
