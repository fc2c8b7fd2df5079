use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use snapvol_config::testing::TestEnvironment;
use snapvol_image::testing::{volume, MemoryBlockDevices, MemoryDatasetStore};
use snapvol_image::{CloneStore, CommandError, ImageFactory, SessionOptions};
use snapvol_inject::{DiagnosticInjector, InjectError, InjectionTool, ScriptManifest};
use snapvol_manifest::CloneManifestSource;

/// Records the container it was handed and whether it existed on disk
struct FakeTool {
    fail: bool,
    seen: Mutex<Vec<PathBuf>>,
}

impl InjectionTool for FakeTool {
    fn inject(&self, container: &Path, _script_manifest: Option<&Path>) -> Result<(), InjectError> {
        self.seen.lock().unwrap().push(container.to_path_buf());
        if self.fail {
            return Err(InjectError::Tool {
                container: container.to_path_buf(),
                source: CommandError::Failed {
                    program: "inject-agent".to_string(),
                    args: Vec::new(),
                    code: 2,
                    stderr: "boot sector not writable".to_string(),
                },
            });
        }
        Ok(())
    }
}

fn setup(fail: bool) -> (TestEnvironment, Arc<MemoryDatasetStore>, Arc<MemoryBlockDevices>, Arc<FakeTool>) {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryDatasetStore::new());
    store.set_volumes(
        "agent-42",
        vec![volume("C-vol-guid", true, true), volume("D-vol-guid", false, true)],
    );
    let tool = Arc::new(FakeTool {
        fail,
        seen: Mutex::new(Vec::new()),
    });
    (env, store, Arc::new(MemoryBlockDevices::new()), tool)
}

#[test]
fn test_inject_snapshot_targets_os_volume_and_cleans_up() {
    let (env, store, devices, tool) = setup(false);
    let clones = CloneStore::new(store.clone(), &env.mount_root);
    let factory = ImageFactory::new(Arc::new(CloneManifestSource), devices.clone(), None);

    DiagnosticInjector::new(tool.clone())
        .inject_snapshot(
            &clones,
            &factory,
            "agent-42",
            1_700_000_000,
            SessionOptions::default(),
            &ScriptManifest::default(),
        )
        .unwrap();

    let seen = tool.seen.lock().unwrap();
    assert_eq!(
        seen.as_slice(),
        &[env
            .mount_root
            .join("agent-42-verification")
            .join("C-vol-guid.img")]
    );
    assert_eq!(store.clone_count(), 0);
    assert_eq!(devices.attached_count(), 0);
}

#[test]
fn test_tool_failure_surfaces_after_cleanup() {
    let (env, store, devices, tool) = setup(true);
    let clones = CloneStore::new(store.clone(), &env.mount_root);
    let factory = ImageFactory::new(Arc::new(CloneManifestSource), devices.clone(), None);

    let err = DiagnosticInjector::new(tool)
        .inject_snapshot(
            &clones,
            &factory,
            "agent-42",
            1_700_000_000,
            SessionOptions::default(),
            &ScriptManifest::default(),
        )
        .unwrap_err();

    assert!(matches!(err, InjectError::Tool { .. }));
    assert!(err.to_string().contains("C-vol-guid.img"));
    assert_eq!(store.clone_count(), 0);
    assert_eq!(devices.attached_count(), 0);
}
