//! Verify command

use anyhow::Result;
use appkeep_core::ApplicationRef;

use super::{finish_report, EngineContext};
use crate::cli::{GlobalArgs, VerifyArgs};
use crate::output;

pub async fn run(args: VerifyArgs, global: &GlobalArgs) -> Result<()> {
    output::banner("Verify Backups");

    let app = ApplicationRef::new(&args.app.application_id, args.app.user)?;
    let context = EngineContext::open(global)?;
    let report = context.engine.verify(&app, &args.instances).await?;

    finish_report(&report, |summary| {
        format!(
            "{} archive(s), {} payload(s), {} entries intact",
            summary.archives_checked, summary.payloads_checked, summary.entries
        )
    })
}
