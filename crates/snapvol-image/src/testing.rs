//! In-memory [`DatasetStore`] and [`BlockDevices`] with injectable failures.
//!
//! Clones are real directories under the configured mount root so that
//! manifest reads and report writes behave as they do on a real clone; block
//! devices only exist as bookkeeping.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use snapvol_manifest::{Filesystem, VolumeEntry, VolumeManifest, MANIFEST_FILE};

use crate::device::{BlockDevices, DeviceError};
use crate::store::{DatasetStore, StoreError};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Build a volume entry for tests
pub fn volume(guid: &str, os_volume: bool, included: bool) -> VolumeEntry {
    VolumeEntry {
        guid: guid.to_string(),
        mount_point: String::new(),
        filesystem: Filesystem::Ext4,
        os_volume,
        included,
        encrypted: false,
    }
}

fn other(msg: impl Into<String>) -> StoreError {
    StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg.into()))
}

#[derive(Default)]
struct StoreState {
    /// dataset -> mount path
    clones: HashMap<String, PathBuf>,
    /// asset -> volumes written into every clone of that asset
    manifests: HashMap<String, Vec<VolumeEntry>>,
    locked: HashSet<String>,
    fail_create: bool,
    fail_destroy: bool,
    fail_exists: bool,
    create_calls: usize,
    destroy_calls: usize,
}

/// Dataset store that materializes clones as plain directories.
#[derive(Default)]
pub struct MemoryDatasetStore {
    state: Mutex<StoreState>,
}

impl MemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Volumes every clone of `asset` will expose in its manifest
    pub fn set_volumes(&self, asset: &str, volumes: Vec<VolumeEntry>) {
        guard(&self.state)
            .manifests
            .insert(asset.to_string(), volumes);
    }

    /// Pretend a clone was left behind by an earlier run
    pub fn insert_existing(&self, dataset: &str, mount_path: &Path) {
        guard(&self.state)
            .clones
            .insert(dataset.to_string(), mount_path.to_path_buf());
    }

    pub fn lock_asset(&self, asset: &str) {
        guard(&self.state).locked.insert(asset.to_string());
    }

    pub fn fail_create(&self, fail: bool) {
        guard(&self.state).fail_create = fail;
    }

    pub fn fail_destroy(&self, fail: bool) {
        guard(&self.state).fail_destroy = fail;
    }

    pub fn fail_exists(&self, fail: bool) {
        guard(&self.state).fail_exists = fail;
    }

    pub fn create_calls(&self) -> usize {
        guard(&self.state).create_calls
    }

    pub fn destroy_calls(&self) -> usize {
        guard(&self.state).destroy_calls
    }

    pub fn clone_count(&self) -> usize {
        guard(&self.state).clones.len()
    }
}

impl DatasetStore for MemoryDatasetStore {
    fn clone_exists(&self, dataset: &str) -> Result<bool, StoreError> {
        let state = guard(&self.state);
        if state.fail_exists {
            return Err(other("injected exists failure"));
        }
        Ok(state.clones.contains_key(dataset))
    }

    fn create_clone(
        &self,
        dataset: &str,
        source_snapshot: &str,
        mount_path: &Path,
    ) -> Result<(), StoreError> {
        let mut state = guard(&self.state);
        state.create_calls += 1;
        if state.fail_create {
            return Err(other("injected create failure"));
        }

        let (asset, epoch) = source_snapshot
            .split_once('@')
            .ok_or_else(|| other(format!("bad snapshot name {source_snapshot}")))?;
        let epoch = epoch
            .parse::<u64>()
            .map_err(|_| other(format!("bad snapshot epoch {source_snapshot}")))?;

        std::fs::create_dir_all(mount_path)?;
        if let Some(volumes) = state.manifests.get(asset) {
            let manifest = VolumeManifest {
                asset: asset.to_string(),
                epoch,
                volumes: volumes.clone(),
            };
            manifest
                .save(mount_path.join(MANIFEST_FILE))
                .map_err(|e| other(e.to_string()))?;
        }

        state
            .clones
            .insert(dataset.to_string(), mount_path.to_path_buf());
        Ok(())
    }

    fn destroy_clone(&self, dataset: &str) -> Result<(), StoreError> {
        let mut state = guard(&self.state);
        state.destroy_calls += 1;
        if state.fail_destroy {
            return Err(other("injected destroy failure"));
        }
        if let Some(mount_path) = state.clones.remove(dataset) {
            if mount_path.exists() {
                std::fs::remove_dir_all(&mount_path)?;
            }
        }
        Ok(())
    }

    fn key_available(&self, dataset: &str) -> Result<bool, StoreError> {
        Ok(!guard(&self.state).locked.contains(dataset))
    }
}

#[derive(Default)]
struct DeviceState {
    next_loop: u32,
    /// loop device -> backing file
    attached: HashMap<PathBuf, PathBuf>,
    mappings: HashSet<String>,
    /// Backing files whose attach fails
    fail_attach: HashSet<PathBuf>,
    fail_crypt: bool,
    fail_detach: bool,
    attach_calls: usize,
    detach_calls: usize,
}

/// Block devices as bookkeeping only.
#[derive(Default)]
pub struct MemoryBlockDevices {
    state: Mutex<DeviceState>,
}

impl MemoryBlockDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make attaching `backing` fail
    pub fn fail_attach_for(&self, backing: &Path) {
        guard(&self.state)
            .fail_attach
            .insert(backing.to_path_buf());
    }

    pub fn fail_crypt(&self, fail: bool) {
        guard(&self.state).fail_crypt = fail;
    }

    pub fn fail_detach(&self, fail: bool) {
        guard(&self.state).fail_detach = fail;
    }

    pub fn attached_count(&self) -> usize {
        guard(&self.state).attached.len()
    }

    pub fn is_attached(&self, backing: &Path) -> bool {
        guard(&self.state).attached.values().any(|b| b == backing)
    }

    pub fn open_mappings(&self) -> usize {
        guard(&self.state).mappings.len()
    }

    pub fn attach_calls(&self) -> usize {
        guard(&self.state).attach_calls
    }

    pub fn detach_calls(&self) -> usize {
        guard(&self.state).detach_calls
    }
}

impl BlockDevices for MemoryBlockDevices {
    fn attach(&self, backing: &Path, _read_only: bool) -> Result<PathBuf, DeviceError> {
        let mut state = guard(&self.state);
        state.attach_calls += 1;
        if state.fail_attach.contains(backing) {
            return Err(DeviceError::Other(format!(
                "injected attach failure for {}",
                backing.display()
            )));
        }
        let device = PathBuf::from(format!("/dev/loop{}", state.next_loop));
        state.next_loop += 1;
        state.attached.insert(device.clone(), backing.to_path_buf());
        Ok(device)
    }

    fn detach(&self, device: &Path) -> Result<(), DeviceError> {
        let mut state = guard(&self.state);
        state.detach_calls += 1;
        if state.fail_detach {
            return Err(DeviceError::Other(format!(
                "injected detach failure for {}",
                device.display()
            )));
        }
        state.attached.remove(device);
        Ok(())
    }

    fn open_crypt(
        &self,
        _device: &Path,
        name: &str,
        _key_file: &Path,
    ) -> Result<PathBuf, DeviceError> {
        let mut state = guard(&self.state);
        if state.fail_crypt {
            return Err(DeviceError::Other(format!("injected crypt failure for {name}")));
        }
        state.mappings.insert(name.to_string());
        Ok(Path::new("/dev/mapper").join(name))
    }

    fn close_crypt(&self, name: &str) -> Result<(), DeviceError> {
        guard(&self.state).mappings.remove(name);
        Ok(())
    }
}
