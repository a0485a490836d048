//! Migrate command

use anyhow::Result;
use appkeep_core::ApplicationRef;

use super::{finish_report, open_layout, EngineContext};
use crate::cli::{GlobalArgs, MigrateArgs};
use crate::output;

pub async fn run(args: MigrateArgs, global: &GlobalArgs) -> Result<()> {
    output::banner("Migrate Metadata");

    let context = EngineContext::open(global)?;
    let applications = match args.application_id {
        Some(id) => vec![id],
        None => open_layout(&context.config).list_applications()?,
    };
    if applications.is_empty() {
        output::note("No backups found");
        return Ok(());
    }

    let mut failed = Vec::new();
    for application_id in applications {
        // Instances are addressed by directory, so the user only labels the report
        let app = ApplicationRef::new(&application_id, 0)?;
        let report = context.engine.migrate(&app).await?;
        if finish_report(&report, |migrated| {
            if *migrated {
                "migrated".to_string()
            } else {
                "already current".to_string()
            }
        })
        .is_err()
        {
            failed.push(application_id);
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("Migration failed for: {}", failed.join(", "));
    }
    Ok(())
}
