//! Builds the library collaborators from a loaded [`Config`].

use std::sync::Arc;

use snapvol_check::{FilesystemIntegrityChecker, FsckChecker, JsonRecoveryPointStore, ReportStore};
use snapvol_config::Config;
use snapvol_image::{
    AcquireOptions, CloneStore, CommandBlockDevices, ImageFactory, SessionOptions,
    ZfsDatasetStore,
};
use snapvol_inject::{CommandInjectionTool, DiagnosticInjector};
use snapvol_manifest::CloneManifestSource;

pub struct Services {
    pub clones: CloneStore,
    pub factory: ImageFactory,
    pub options: SessionOptions,
}

impl Services {
    pub fn from_config(config: &Config) -> Self {
        let clones = CloneStore::new(
            Arc::new(ZfsDatasetStore::from_config(&config.store)),
            &config.store.mount_root,
        );
        let factory = ImageFactory::new(
            Arc::new(CloneManifestSource),
            Arc::new(CommandBlockDevices::from_config(&config.devices)),
            config.devices.key_dir.clone(),
        );
        let options = SessionOptions {
            acquire: AcquireOptions {
                read_only: config.devices.read_only,
                ..AcquireOptions::default()
            },
            lock_dir: config.session.lock_dir.clone(),
            ..SessionOptions::default()
        };
        Self {
            clones,
            factory,
            options,
        }
    }
}

pub fn integrity_checker(config: &Config) -> FilesystemIntegrityChecker {
    FilesystemIntegrityChecker::new(
        Arc::new(FsckChecker::from_config(&config.check)),
        ReportStore::new(&config.check.report_dir),
        Arc::new(JsonRecoveryPointStore::new(&config.check.recovery_point_dir)),
    )
}

pub fn injector(config: &Config) -> DiagnosticInjector {
    DiagnosticInjector::new(Arc::new(CommandInjectionTool::from_config(&config.inject)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_services_follow_config() {
        let mut config = Config::default();
        config.store.mount_root = "/srv/clones".into();
        config.devices.read_only = true;
        config.session.lock_dir = Some("/run/snapvol".into());

        let services = Services::from_config(&config);
        assert_eq!(services.clones.mount_root(), std::path::Path::new("/srv/clones"));
        assert!(services.options.acquire.read_only);
        assert!(services.options.acquire.decrypt);
        assert!(services.options.lock_dir.is_some());
    }
}
