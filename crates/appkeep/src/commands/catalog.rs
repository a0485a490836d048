//! Catalog maintenance commands

use anyhow::Result;
use appkeep_backup::BackupCatalog;

use super::{load_config, open_layout};
use crate::cli::GlobalArgs;
use crate::output;

pub fn rebuild(global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let catalog = BackupCatalog::new(config.catalog_path().as_std_path());

    let spinner = output::scanning(config.backup_root.as_str());
    let count = catalog.rebuild(&open_layout(&config));
    spinner.finish_and_clear();
    let count = count?;

    output::done(&format!(
        "Catalog rebuilt with {} instance(s) at {}",
        count,
        catalog.path().display()
    ));
    Ok(())
}
