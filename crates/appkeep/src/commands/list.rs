//! List command

use anyhow::Result;
use appkeep_backup::{BackupCatalog, CatalogEntry, SelectionFlags};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::{load_config, open_layout};
use crate::cli::{GlobalArgs, ListArgs};
use crate::output;

#[derive(Tabled)]
struct InstanceRow {
    application: String,
    instance: String,
    version: String,
    created: String,
    crypto: String,
    flags: String,
}

impl From<&CatalogEntry> for InstanceRow {
    fn from(entry: &CatalogEntry) -> Self {
        Self {
            application: entry.application_id.clone(),
            instance: entry.relative_dir.clone(),
            version: format!("{} ({})", entry.version_name, entry.version_code),
            created: entry.created_at.format("%Y-%m-%d %H:%M").to_string(),
            crypto: entry.crypto.clone(),
            flags: SelectionFlags::from_stored(entry.flags).to_string(),
        }
    }
}

pub fn run(args: ListArgs, global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let catalog = BackupCatalog::new(config.catalog_path().as_std_path());

    if args.refresh {
        let layout = open_layout(&config);
        match &args.application_id {
            Some(id) => catalog.refresh(&layout, id)?,
            None => catalog.rebuild(&layout)?,
        };
    }

    let entries = match &args.application_id {
        Some(id) => catalog.list_for(id)?,
        None => catalog.list()?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        output::note("No backups found");
        if !args.refresh {
            output::note("Run with --refresh to rescan the backup root");
        }
        return Ok(());
    }

    output::banner("Backups");
    let rows: Vec<InstanceRow> = entries.iter().map(InstanceRow::from).collect();
    let mut table = Table::new(rows);
    table.with(Style::sharp());
    println!("{}", table);
    Ok(())
}
