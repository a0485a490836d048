//! Restore command

use anyhow::{bail, Result};
use appkeep_backup::{RestoreOptions, SelectionFlags};
use appkeep_core::{ApplicationRef, UserId};

use super::{finish_report, parse_flags, EngineContext};
use crate::cli::{GlobalArgs, RestoreArgs};
use crate::output;

/// Users a restore runs for; `None` keeps each instance's owning user.
///
/// Several target users are only accepted when the caller also selected
/// the custom-users flag.
fn target_users(flags: Option<SelectionFlags>, users: &[UserId]) -> Result<Vec<Option<UserId>>> {
    match users {
        [] => Ok(vec![None]),
        [user] => Ok(vec![Some(*user)]),
        _ => {
            if !flags.is_some_and(|f| f.contains(SelectionFlags::CUSTOM_USERS)) {
                bail!("Restoring into {} users requires the custom-users flag", users.len());
            }
            let mut unique = users.to_vec();
            unique.sort_unstable();
            unique.dedup();
            Ok(unique.into_iter().map(Some).collect())
        }
    }
}

pub async fn run(args: RestoreArgs, global: &GlobalArgs) -> Result<()> {
    output::banner("Restore Application");

    let app = ApplicationRef::new(&args.app.application_id, args.app.user)?;
    let flags = args.flags.as_deref().map(parse_flags).transpose()?;
    let targets = target_users(flags, &args.target_users)?;

    let users = args
        .target_users
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    output::Settings::new()
        .row("Application", &app)
        .optional_row("Target users", (!users.is_empty()).then_some(users))
        .optional_row("Flags", args.flags.as_deref())
        .print();

    let context = EngineContext::open(global)?;
    let mut failures = Vec::new();
    for target in targets {
        let mut options = RestoreOptions::default();
        if let Some(user) = target {
            options = options.with_target_user(user);
        }
        if let Some(flags) = flags {
            options = options.with_flags(flags);
        }

        let report = context
            .engine
            .restore(&app, &args.instances, &options)
            .await?;
        if report.successes().next().is_some() {
            context.save_inventory()?;
        }

        if let Err(e) = finish_report(&report, |summary| {
            let mut parts = vec![format!("{} director(ies) restored", summary.restored_dirs.len())];
            if summary.binaries_installed {
                parts.push("binaries installed".to_string());
            }
            if summary.keystore_entries > 0 {
                parts.push(format!("{} keystore entries", summary.keystore_entries));
            }
            if summary.rules_imported {
                parts.push("rules imported".to_string());
            }
            format!("user {}: {}", summary.target_user, parts.join(", "))
        }) {
            failures.push(e);
        }
    }

    match failures.pop() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
