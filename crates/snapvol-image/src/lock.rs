//! Advisory per-clone lock.
//!
//! The dataset-existence check in session setup is not atomic with clone
//! creation. When a lock directory is configured, sessions also take an
//! exclusive `flock` on `<lock_dir>/<dataset>.lock` for their lifetime, which
//! closes that window between processes on the same host.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::spec::CloneSpec;

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct CloneLock {
    file: File,
    path: PathBuf,
}

impl CloneLock {
    /// Try to lock the clone of `spec` without blocking.
    ///
    /// Returns `Ok(None)` when another holder has it.
    pub fn try_acquire(lock_dir: &Path, spec: &CloneSpec) -> io::Result<Option<Self>> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{}.lock", spec.dataset_name()));
        let file = File::create(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CloneLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ClonePurpose;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let temp = TempDir::new().unwrap();
        let spec = CloneSpec::from_asset("agent-42", 1, ClonePurpose::Verification);

        let held = CloneLock::try_acquire(temp.path(), &spec).unwrap().unwrap();
        assert!(held.path().ends_with("agent-42-verification.lock"));
        assert!(CloneLock::try_acquire(temp.path(), &spec).unwrap().is_none());

        drop(held);
        assert!(CloneLock::try_acquire(temp.path(), &spec).unwrap().is_some());
    }

    #[test]
    fn test_different_clones_do_not_contend() {
        let temp = TempDir::new().unwrap();
        let a = CloneSpec::from_asset("agent-42", 1, ClonePurpose::Verification);
        let b = CloneSpec::from_asset("agent-42", 1, ClonePurpose::Export);

        let _a = CloneLock::try_acquire(temp.path(), &a).unwrap().unwrap();
        assert!(CloneLock::try_acquire(temp.path(), &b).unwrap().is_some());
    }
}
