//! Filesystem-check tools.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snapvol_config::CheckConfig;
use snapvol_image::command;
use snapvol_manifest::{Filesystem, VolumeEntry};

use crate::CheckError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
}

/// Normal result of checking one volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckOutcome {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Pass,
            detail: detail.into(),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Fail,
            detail: detail.into(),
        }
    }
}

/// Checks the filesystem found at a partition path.
///
/// A filesystem with problems is `Ok` with [`CheckStatus::Fail`]; `Err` means
/// the check itself could not be carried out.
pub trait FilesystemChecker: Send + Sync {
    fn check(&self, partition: &Path, volume: &VolumeEntry) -> Result<CheckOutcome, CheckError>;
}

/// Read-only checks through `e2fsck` and `ntfsfix`.
#[derive(Debug, Clone)]
pub struct FsckChecker {
    e2fsck: PathBuf,
    ntfsfix: PathBuf,
}

impl FsckChecker {
    pub fn new(e2fsck: impl Into<PathBuf>, ntfsfix: impl Into<PathBuf>) -> Self {
        Self {
            e2fsck: e2fsck.into(),
            ntfsfix: ntfsfix.into(),
        }
    }

    pub fn from_config(config: &CheckConfig) -> Self {
        Self::new(&config.e2fsck, &config.ntfsfix)
    }

    fn run_tool(
        &self,
        program: &Path,
        args: &[&Path],
        classify: impl Fn(i32) -> Option<CheckStatus>,
    ) -> Result<CheckOutcome, CheckError> {
        let out = command::output(program, args).map_err(|source| CheckError::Tool {
            program: program.display().to_string(),
            source,
        })?;

        let detail = combined_output(&out.stdout, &out.stderr);
        let Some(code) = out.status.code() else {
            return Err(CheckError::Aborted {
                program: program.display().to_string(),
                code: None,
                detail,
            });
        };
        match classify(code) {
            Some(status) => Ok(CheckOutcome { status, detail }),
            None => Err(CheckError::Aborted {
                program: program.display().to_string(),
                code: Some(code),
                detail,
            }),
        }
    }
}

impl FilesystemChecker for FsckChecker {
    fn check(&self, partition: &Path, volume: &VolumeEntry) -> Result<CheckOutcome, CheckError> {
        if volume.filesystem.is_ext() {
            // 1..=4: problems found (nothing is fixed under -n); 8 and up: e2fsck itself failed
            return self.run_tool(
                &self.e2fsck,
                &[Path::new("-n"), Path::new("-f"), partition],
                |code| match code {
                    0 => Some(CheckStatus::Pass),
                    1..=4 => Some(CheckStatus::Fail),
                    _ => None,
                },
            );
        }

        match volume.filesystem {
            Filesystem::Ntfs => self.run_tool(
                &self.ntfsfix,
                &[Path::new("--no-action"), partition],
                |code| match code {
                    0 => Some(CheckStatus::Pass),
                    _ => Some(CheckStatus::Fail),
                },
            ),
            ref other => Err(CheckError::Unsupported {
                guid: volume.guid.clone(),
                filesystem: format!("{:?}", other).to_lowercase(),
            }),
        }
    }
}

fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    match (stdout.trim(), stderr.trim()) {
        (out, "") => out.to_string(),
        ("", err) => err.to_string(),
        (out, err) => format!("{out}\n{err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvol_image::testing::volume;

    fn ntfs(guid: &str) -> VolumeEntry {
        let mut v = volume(guid, true, true);
        v.filesystem = Filesystem::Ntfs;
        v
    }

    #[test]
    fn test_ext_volume_passes_on_zero_exit() {
        let checker = FsckChecker::new("true", "false");
        let outcome = checker
            .check(Path::new("/dev/loop0"), &volume("A", false, true))
            .unwrap();
        assert_eq!(outcome.status, CheckStatus::Pass);
    }

    #[test]
    fn test_ext_volume_fails_on_exit_one() {
        // `false` exits 1: errors found
        let checker = FsckChecker::new("false", "true");
        let outcome = checker
            .check(Path::new("/dev/loop0"), &volume("A", false, true))
            .unwrap();
        assert_eq!(outcome.status, CheckStatus::Fail);
    }

    #[test]
    fn test_ntfs_uses_ntfsfix() {
        let checker = FsckChecker::new("true", "echo");
        let outcome = checker.check(Path::new("/dev/loop3"), &ntfs("C")).unwrap();
        assert_eq!(outcome.status, CheckStatus::Pass);
        assert_eq!(outcome.detail, "--no-action /dev/loop3");
    }

    #[test]
    fn test_unsupported_filesystem() {
        let mut v = volume("X", false, true);
        v.filesystem = Filesystem::Refs;
        let err = FsckChecker::new("true", "true")
            .check(Path::new("/dev/loop0"), &v)
            .unwrap_err();
        assert!(matches!(err, CheckError::Unsupported { .. }));
    }

    #[test]
    fn test_missing_tool_is_error() {
        let err = FsckChecker::new("/nonexistent/e2fsck", "true")
            .check(Path::new("/dev/loop0"), &volume("A", false, true))
            .unwrap_err();
        assert!(matches!(err, CheckError::Tool { .. }));
    }

    #[test]
    fn test_combined_output() {
        assert_eq!(combined_output(b"a\n", b""), "a");
        assert_eq!(combined_output(b"", b" b "), "b");
        assert_eq!(combined_output(b"a", b"b"), "a\nb");
    }
}
