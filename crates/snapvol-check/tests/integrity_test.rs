use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use snapvol_check::{
    CheckError, CheckOutcome, CheckStatus, FilesystemChecker, FilesystemIntegrityChecker,
    IntegrityCheckJob, JsonRecoveryPointStore, RecoveryPointStore, ReportStore,
};
use snapvol_config::testing::TestEnvironment;
use snapvol_image::testing::{volume, MemoryBlockDevices, MemoryDatasetStore};
use snapvol_image::{CloneStore, ImageFactory, SessionError, SessionOptions};
use snapvol_manifest::{CloneManifestSource, VolumeEntry};

/// Passes every volume and records, per call, whether the clone directory
/// was mounted at the time
struct RecordingChecker {
    clone_dir: PathBuf,
    calls: Mutex<Vec<(String, PathBuf, bool)>>,
}

impl FilesystemChecker for RecordingChecker {
    fn check(&self, partition: &Path, volume: &VolumeEntry) -> Result<CheckOutcome, CheckError> {
        self.calls.lock().unwrap().push((
            volume.guid.clone(),
            partition.to_path_buf(),
            self.clone_dir.is_dir(),
        ));
        Ok(CheckOutcome::pass("clean"))
    }
}

struct Harness {
    env: TestEnvironment,
    store: Arc<MemoryDatasetStore>,
    devices: Arc<MemoryBlockDevices>,
    clones: CloneStore,
    factory: ImageFactory,
    checker: Arc<RecordingChecker>,
    integrity: FilesystemIntegrityChecker,
}

fn harness() -> Harness {
    let env = TestEnvironment::new().unwrap();
    let config = env.config();

    let store = Arc::new(MemoryDatasetStore::new());
    store.set_volumes(
        "agent-42",
        vec![
            volume("C-vol-guid", true, true),
            volume("D-vol-guid", false, false),
        ],
    );
    let devices = Arc::new(MemoryBlockDevices::new());
    let clones = CloneStore::new(store.clone(), &config.store.mount_root);
    let factory = ImageFactory::new(Arc::new(CloneManifestSource), devices.clone(), None);

    let checker = Arc::new(RecordingChecker {
        clone_dir: config.store.mount_root.join("agent-42-integrityCheck"),
        calls: Mutex::new(Vec::new()),
    });
    let integrity = FilesystemIntegrityChecker::new(
        checker.clone(),
        ReportStore::new(&config.check.report_dir),
        Arc::new(JsonRecoveryPointStore::new(&config.check.recovery_point_dir)),
    );

    Harness {
        env,
        store,
        devices,
        clones,
        factory,
        checker,
        integrity,
    }
}

#[test]
fn test_integrity_check_end_to_end() {
    let h = harness();
    let job = IntegrityCheckJob::new(&h.clones, &h.factory, &h.integrity, SessionOptions::default());

    let report = job.run("agent-42", 1_700_000_000, None).unwrap();

    // Only the included volume was attached and checked, inside a mounted clone
    assert_eq!(h.devices.attach_calls(), 1);
    let calls = h.checker.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "C-vol-guid");
    assert!(
        calls[0].1.to_string_lossy().starts_with("/dev/loop"),
        "checker got {}",
        calls[0].1.display()
    );
    assert!(calls[0].2, "clone was not mounted during the check");

    // Report keyed by (asset, epoch) with exactly one entry
    assert_eq!(report.results.len(), 1);
    assert_eq!(
        report.result("C-vol-guid").map(|r| r.status),
        Some(CheckStatus::Pass)
    );
    assert!(report.result("D-vol-guid").is_none());
    let path = h
        .env
        .report_dir
        .join("agent-42")
        .join("1700000000.json");
    assert!(path.is_file());
    let stored = h
        .integrity
        .reports()
        .read("agent-42", 1_700_000_000)
        .unwrap()
        .unwrap();
    assert_eq!(stored.results, report.results);

    let points = JsonRecoveryPointStore::new(&h.env.recovery_point_dir);
    assert_eq!(points.results_for("agent-42", 1_700_000_000).unwrap().len(), 1);

    // Torn down
    assert_eq!(h.store.create_calls(), 1);
    assert_eq!(h.store.clone_count(), 0);
    assert_eq!(h.devices.attached_count(), 0);
}

#[test]
fn test_explicit_include_overrides_manifest_flags() {
    let h = harness();
    let job = IntegrityCheckJob::new(&h.clones, &h.factory, &h.integrity, SessionOptions::default());
    let include: BTreeSet<String> = ["D-vol-guid".to_string()].into_iter().collect();

    let report = job.run("agent-42", 1_700_000_000, Some(&include)).unwrap();

    assert_eq!(h.devices.attach_calls(), 2);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].guid, "D-vol-guid");
    assert_eq!(h.devices.attached_count(), 0);
}

#[test]
fn test_leftover_clone_aborts_job_without_report() {
    let h = harness();
    h.store.insert_existing(
        "agent-42-integrityCheck",
        &h.env.mount_root.join("agent-42-integrityCheck"),
    );
    let job = IntegrityCheckJob::new(&h.clones, &h.factory, &h.integrity, SessionOptions::default());

    let err = job.run("agent-42", 1_700_000_000, None).unwrap_err();
    assert!(matches!(
        err,
        CheckError::Session(SessionError::CloneConflict { .. })
    ));
    assert!(h
        .integrity
        .reports()
        .read("agent-42", 1_700_000_000)
        .unwrap()
        .is_none());
    assert_eq!(h.store.clone_count(), 1);
}
