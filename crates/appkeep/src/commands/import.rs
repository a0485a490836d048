//! Import command

use anyhow::{Context, Result};

use super::EngineContext;
use crate::cli::{GlobalArgs, ImportArgs};
use crate::output;

pub async fn run(args: ImportArgs, global: &GlobalArgs) -> Result<()> {
    output::banner("Import OAndBackup");

    let context = EngineContext::open(global)?;
    let summary = context
        .engine
        .import_oandbackup(args.location.as_std_path(), args.user)
        .await
        .with_context(|| format!("Failed to import {}", args.location))?;

    let descriptor = &summary.metadata.descriptor;
    output::instance_done(
        &summary.metadata.info.relative_dir,
        &format!(
            "{} {} ({}), {} archive(s)",
            descriptor.application_id,
            descriptor.version_name,
            descriptor.version_code,
            summary.archives.len()
        ),
    );
    output::done(&format!("Imported into {}", summary.instance_dir.display()));
    Ok(())
}
