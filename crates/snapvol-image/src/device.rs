//! Block device attach/detach and decryption mappings.

use std::path::{Path, PathBuf};

use snapvol_config::DeviceConfig;
use thiserror::Error;

use crate::command::{self, CommandError};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("no device node reported for {backing}")]
    NoDevice { backing: String },

    #[error("{0}")]
    Other(String),
}

/// Kernel block device primitives used by volume images.
pub trait BlockDevices: Send + Sync {
    /// Attach `backing` as a block device, returning the device node.
    fn attach(&self, backing: &Path, read_only: bool) -> Result<PathBuf, DeviceError>;

    fn detach(&self, device: &Path) -> Result<(), DeviceError>;

    /// Open a decryption mapping `name` over `device`, returning the mapped
    /// device node.
    fn open_crypt(&self, device: &Path, name: &str, key_file: &Path)
        -> Result<PathBuf, DeviceError>;

    fn close_crypt(&self, name: &str) -> Result<(), DeviceError>;
}

/// [`BlockDevices`] backed by `losetup` and `cryptsetup`.
#[derive(Debug, Clone)]
pub struct CommandBlockDevices {
    losetup: PathBuf,
    cryptsetup: PathBuf,
}

impl CommandBlockDevices {
    pub fn new(losetup: impl Into<PathBuf>, cryptsetup: impl Into<PathBuf>) -> Self {
        Self {
            losetup: losetup.into(),
            cryptsetup: cryptsetup.into(),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(&config.losetup, &config.cryptsetup)
    }
}

impl BlockDevices for CommandBlockDevices {
    fn attach(&self, backing: &Path, read_only: bool) -> Result<PathBuf, DeviceError> {
        let backing_str = backing.to_string_lossy();
        let mut args = vec!["--find", "--show"];
        if read_only {
            args.push("--read-only");
        }
        args.push(&*backing_str);

        let device = command::run(&self.losetup, args.as_slice())?;
        if device.is_empty() {
            return Err(DeviceError::NoDevice {
                backing: backing.display().to_string(),
            });
        }
        Ok(PathBuf::from(device))
    }

    fn detach(&self, device: &Path) -> Result<(), DeviceError> {
        command::run(&self.losetup, &[Path::new("-d"), device])?;
        Ok(())
    }

    fn open_crypt(
        &self,
        device: &Path,
        name: &str,
        key_file: &Path,
    ) -> Result<PathBuf, DeviceError> {
        let device_str = device.to_string_lossy();
        let key_str = key_file.to_string_lossy();
        command::run(
            &self.cryptsetup,
            &["open", "--key-file", &*key_str, &*device_str, name],
        )?;
        Ok(Path::new("/dev/mapper").join(name))
    }

    fn close_crypt(&self, name: &str) -> Result<(), DeviceError> {
        command::run(&self.cryptsetup, &["close", name])?;
        Ok(())
    }
}
