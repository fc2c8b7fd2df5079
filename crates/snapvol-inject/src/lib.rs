//! # snapvol-inject
//!
//! Injects the diagnostic agent into the OS volume of a snapshot so that a
//! verification boot runs it, optionally with a set of scripts to auto-run.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snapvol_config::{log_inject_info, InjectConfig};
use snapvol_image::{
    command, ClonePurpose, CloneSpec, CloneStore, CommandError, ImageFactory, SessionError,
    SessionOptions, SnapshotImageSession, VolumeImage,
};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InjectError {
    #[error("no OS volume among the images of {snapshot}")]
    NoOsVolume { snapshot: String },

    #[error("script not found: {path}")]
    ScriptMissing { path: PathBuf },

    #[error("failed to write script manifest: {0}")]
    Manifest(#[source] io::Error),

    #[error("failed to encode script manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("injection tool failed on {container}: {source}")]
    Tool {
        container: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, InjectError>;

/// Scripts the agent runs after boot, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptManifest {
    pub scripts: Vec<PathBuf>,
}

impl ScriptManifest {
    /// Resolve relative script paths against `scripts_dir` and check that
    /// every script exists.
    pub fn resolve<P: AsRef<Path>>(scripts_dir: &Path, scripts: &[P]) -> Result<Self> {
        let scripts = scripts
            .iter()
            .map(|p| {
                let p = p.as_ref();
                let path = if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    scripts_dir.join(p)
                };
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(InjectError::ScriptMissing { path })
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { scripts })
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Write the manifest to a temporary file that lives as long as the
    /// returned handle.
    pub fn write_temp(&self) -> Result<NamedTempFile> {
        let tmp = NamedTempFile::new().map_err(InjectError::Manifest)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush().map_err(InjectError::Manifest)?;
        }
        Ok(tmp)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(InjectError::Manifest)?;
        Ok(serde_json::from_reader(io::BufReader::new(file))?)
    }
}

/// Writes the agent into a volume container.
pub trait InjectionTool: Send + Sync {
    fn inject(&self, container: &Path, script_manifest: Option<&Path>) -> Result<()>;
}

/// Runs `<tool> --image <container> [--scripts <manifest>]`.
#[derive(Debug, Clone)]
pub struct CommandInjectionTool {
    tool: PathBuf,
}

impl CommandInjectionTool {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }

    pub fn from_config(config: &InjectConfig) -> Self {
        Self::new(&config.tool)
    }
}

impl InjectionTool for CommandInjectionTool {
    fn inject(&self, container: &Path, script_manifest: Option<&Path>) -> Result<()> {
        let mut args = vec![Path::new("--image"), container];
        if let Some(manifest) = script_manifest {
            args.push(Path::new("--scripts"));
            args.push(manifest);
        }
        command::run(&self.tool, args.as_slice()).map_err(|source| InjectError::Tool {
            container: container.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

pub struct DiagnosticInjector {
    tool: Arc<dyn InjectionTool>,
}

impl DiagnosticInjector {
    pub fn new(tool: Arc<dyn InjectionTool>) -> Self {
        Self { tool }
    }

    /// Inject into the OS volume among `images`.
    ///
    /// Errors are fatal to the calling stage; nothing is retried or skipped.
    pub fn inject(&self, images: &[VolumeImage], scripts: &ScriptManifest) -> Result<()> {
        let os = images
            .iter()
            .find(|i| i.volume().os_volume)
            .ok_or_else(|| InjectError::NoOsVolume {
                snapshot: images
                    .first()
                    .map(|i| i.spec().snapshot_name())
                    .unwrap_or_default(),
            })?;

        let manifest = if scripts.is_empty() {
            None
        } else {
            Some(scripts.write_temp()?)
        };
        self.tool
            .inject(os.backing_path(), manifest.as_ref().map(|m| m.path()))?;

        log_inject_info!(
            "Diagnostic agent injected",
            guid = os.guid(),
            container = tracing::field::display(os.backing_path().display()),
            scripts = scripts.scripts.len(),
        );
        Ok(())
    }

    /// Clone (asset, epoch) for verification, inject, and tear the clone
    /// down again.
    pub fn inject_snapshot(
        &self,
        clones: &CloneStore,
        factory: &ImageFactory,
        asset: &str,
        epoch: u64,
        options: SessionOptions,
        scripts: &ScriptManifest,
    ) -> Result<()> {
        let spec = CloneSpec::from_asset(asset, epoch, ClonePurpose::Verification);
        SnapshotImageSession::with_images(clones, factory, &spec, options, |images| {
            self.inject(images, scripts)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvol_image::testing::{volume, MemoryBlockDevices};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingTool {
        calls: Mutex<Vec<(PathBuf, Option<ScriptManifest>)>>,
    }

    impl InjectionTool for RecordingTool {
        fn inject(&self, container: &Path, script_manifest: Option<&Path>) -> Result<()> {
            let scripts = script_manifest.map(ScriptManifest::load).transpose()?;
            self.calls
                .lock()
                .unwrap()
                .push((container.to_path_buf(), scripts));
            Ok(())
        }
    }

    fn images(os_guid: Option<&str>) -> Vec<VolumeImage> {
        let devices = Arc::new(MemoryBlockDevices::new());
        let spec = CloneSpec::from_asset("agent-42", 1, ClonePurpose::Verification);
        ["C-vol-guid", "D-vol-guid"]
            .iter()
            .map(|guid| {
                VolumeImage::new(
                    spec.clone(),
                    volume(guid, Some(*guid) == os_guid, true),
                    PathBuf::from(format!("/homePool/agent-42-verification/{guid}.img")),
                    None,
                    devices.clone(),
                )
            })
            .collect()
    }

    #[test]
    fn test_injects_into_os_volume_container() {
        let tool = Arc::new(RecordingTool::default());
        let injector = DiagnosticInjector::new(tool.clone());

        injector
            .inject(&images(Some("D-vol-guid")), &ScriptManifest::default())
            .unwrap();

        let calls = tool.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.ends_with("D-vol-guid.img"));
        assert!(calls[0].1.is_none());
    }

    #[test]
    fn test_script_manifest_reaches_tool() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("check-services.ps1"), "Get-Service").unwrap();
        let scripts = ScriptManifest::resolve(temp.path(), &["check-services.ps1"]).unwrap();

        let tool = Arc::new(RecordingTool::default());
        DiagnosticInjector::new(tool.clone())
            .inject(&images(Some("C-vol-guid")), &scripts)
            .unwrap();

        let calls = tool.calls.lock().unwrap();
        assert_eq!(calls[0].1.as_ref(), Some(&scripts));
    }

    #[test]
    fn test_no_os_volume_is_error() {
        let tool = Arc::new(RecordingTool::default());
        let err = DiagnosticInjector::new(tool.clone())
            .inject(&images(None), &ScriptManifest::default())
            .unwrap_err();
        assert!(matches!(err, InjectError::NoOsVolume { .. }));
        assert!(err.to_string().contains("agent-42@1"));
        assert!(tool.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_script_is_error() {
        let temp = TempDir::new().unwrap();
        let err = ScriptManifest::resolve(temp.path(), &["missing.sh"]).unwrap_err();
        assert!(matches!(err, InjectError::ScriptMissing { .. }));
    }

    #[test]
    fn test_command_tool_arguments() {
        // `echo` stands in for the injection agent
        CommandInjectionTool::new("echo")
            .inject(Path::new("/tmp/c.img"), Some(Path::new("/tmp/m.json")))
            .unwrap();

        let err = CommandInjectionTool::new("false")
            .inject(Path::new("/tmp/c.img"), None)
            .unwrap_err();
        assert!(matches!(err, InjectError::Tool { .. }));
    }
}
