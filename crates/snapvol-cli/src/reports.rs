//! `snapvol reports`: maintenance of stored check reports.

use anyhow::{Context, Result};
use clap::Subcommand;
use snapvol_check::ReportStore;
use snapvol_config::Config;

#[derive(Subcommand, Debug)]
pub enum ReportsCommands {
    /// List the epochs that have a report for an asset
    List {
        #[arg(value_parser = super::parse_asset)]
        asset: String,
    },

    /// Delete reports of a removed asset, or of one removed recovery point
    Purge {
        #[arg(value_parser = super::parse_asset)]
        asset: String,

        /// Only the report of this recovery point
        #[arg(long)]
        epoch: Option<u64>,
    },
}

pub fn run(config: &Config, command: ReportsCommands) -> Result<()> {
    let store = ReportStore::new(&config.check.report_dir);

    match command {
        ReportsCommands::List { asset } => {
            let epochs = store
                .list_epochs(&asset)
                .with_context(|| format!("Failed to list reports for {}", asset))?;
            for epoch in epochs {
                println!("{}", epoch);
            }
        }
        ReportsCommands::Purge {
            asset,
            epoch: Some(epoch),
        } => {
            let removed = store
                .delete_for_point(&asset, epoch)
                .with_context(|| format!("Failed to delete report {}@{}", asset, epoch))?;
            if removed {
                println!("Deleted report {}@{}", asset, epoch);
            } else {
                println!("No report for {}@{}", asset, epoch);
            }
        }
        ReportsCommands::Purge { asset, epoch: None } => {
            store
                .delete_for_asset(&asset)
                .with_context(|| format!("Failed to delete reports for {}", asset))?;
            println!("Deleted all reports for {}", asset);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvol_check::FilesystemCheckReport;
    use tempfile::TempDir;

    #[test]
    fn test_purge_point_then_asset() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.check.report_dir = temp.path().to_path_buf();
        let store = ReportStore::new(temp.path());
        store.write(&FilesystemCheckReport::new("agent-42", 1)).unwrap();
        store.write(&FilesystemCheckReport::new("agent-42", 2)).unwrap();

        run(
            &config,
            ReportsCommands::Purge {
                asset: "agent-42".to_string(),
                epoch: Some(1),
            },
        )
        .unwrap();
        assert_eq!(store.list_epochs("agent-42").unwrap(), vec![2]);

        run(
            &config,
            ReportsCommands::Purge {
                asset: "agent-42".to_string(),
                epoch: None,
            },
        )
        .unwrap();
        assert!(!temp.path().join("agent-42").exists());
    }
}
