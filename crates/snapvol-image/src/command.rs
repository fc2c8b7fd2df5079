//! Blocking invocation of external tools (`zfs`, `losetup`, `cryptsetup`,
//! `e2fsck`, ...).
//!
//! No timeout is applied here; a hung tool blocks the caller.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} {args:?} failed (exit {code}): {stderr}")]
    Failed {
        program: String,
        args: Vec<String>,
        code: i32,
        stderr: String,
    },
}

impl CommandError {
    /// Exit code of a tool that ran and failed
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Failed { code, .. } => Some(*code),
            CommandError::Spawn { .. } => None,
        }
    }
}

/// Run `program` and return its exit status and output without judging it.
pub fn output<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> Result<Output, CommandError> {
    debug!(
        program = %program.display(),
        args = ?args.iter().map(|a| a.as_ref().to_string_lossy()).collect::<Vec<_>>(),
        "exec"
    );
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|source| CommandError::Spawn {
            program: program.display().to_string(),
            source,
        })
}

/// Run `program`, failing on a non-zero exit; returns trimmed stdout.
pub fn run<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> Result<String, CommandError> {
    let out = output(program, args)?;
    if !out.status.success() {
        return Err(CommandError::Failed {
            program: program.display().to_string(),
            args: args
                .iter()
                .map(|a| a.as_ref().to_string_lossy().into_owned())
                .collect(),
            code: out.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let out = run(Path::new("echo"), &["hello"]).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_run_reports_exit_code() {
        let err = run(Path::new("sh"), &["-c", "echo oops >&2; exit 3"]).unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        match err {
            CommandError::Failed { stderr, .. } => assert_eq!(stderr, "oops"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let err = run(Path::new("/nonexistent/snapvol-tool"), &["x"]).unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
        assert_eq!(err.exit_code(), None);
    }
}
