//! Backup command

use anyhow::Result;
use appkeep_backup::{ArchiveFormat, CryptoMode, SelectionFlags};
use appkeep_core::utils::human_bytes;
use appkeep_core::ApplicationRef;

use super::{finish_report, parse_flags, EngineContext};
use crate::cli::{BackupArgs, GlobalArgs};
use crate::output;

pub async fn run(args: BackupArgs, global: &GlobalArgs) -> Result<()> {
    output::banner("Backup Application");

    let app = ApplicationRef::new(&args.app.application_id, args.app.user)?;
    let flags = match &args.flags {
        Some(value) => parse_flags(value)?,
        None => SelectionFlags::LEGACY_DEFAULT,
    };

    let context = EngineContext::open(global)?;
    let mut options = context.engine.options().clone();
    if let Some(tag) = &args.format {
        options = options.with_archive_format(ArchiveFormat::from_tag(tag)?);
    }
    if let Some(tag) = &args.crypto {
        options = options.with_crypto_mode(CryptoMode::from_tag(tag)?);
    }
    if let Some(level) = args.compression {
        options.compression_level = level.clamp(1, 9);
    }
    options.extra_exclusions.extend(args.exclude.iter().cloned());

    output::Settings::new()
        .row("Application", &app)
        .row("Flags", flags)
        .row("Format", options.archive_format.tag())
        .row("Crypto", options.crypto_mode.tag())
        .row("Backup root", &context.config.backup_root)
        .print();

    let engine = context.engine.with_options(options);
    let report = engine.backup(&app, &args.names, flags).await?;

    finish_report(&report, |summary| {
        format!(
            "{} archive(s), {} in {:.1}s",
            summary.archives.len(),
            human_bytes(summary.total_bytes()),
            summary.duration_seconds
        )
    })
}
