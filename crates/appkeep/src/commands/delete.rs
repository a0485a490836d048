//! Delete command

use anyhow::Result;
use appkeep_core::ApplicationRef;

use super::{finish_report, EngineContext};
use crate::cli::{DeleteArgs, GlobalArgs};
use crate::output;

pub async fn run(args: DeleteArgs, global: &GlobalArgs) -> Result<()> {
    output::banner("Delete Backups");

    let app = ApplicationRef::new(&args.app.application_id, args.app.user)?;
    let context = EngineContext::open(global)?;
    let report = context.engine.delete_backup(&app, &args.instances).await?;

    finish_report(&report, |summary| match (summary.removed, summary.removed_app_root) {
        (false, _) => "nothing to delete".to_string(),
        (true, false) => "deleted".to_string(),
        (true, true) => "deleted (last instance of the application)".to_string(),
    })
}
