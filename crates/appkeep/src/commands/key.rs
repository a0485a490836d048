//! Identity key commands

use anyhow::{anyhow, bail, Result};
use appkeep_backup::ArchiveKey;
use std::fs;

use crate::cli::KeyGenerateArgs;
use crate::output;

pub fn generate(args: KeyGenerateArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        bail!("{} already exists (use --force to overwrite)", args.output);
    }
    if let Some(parent) = args.output.parent().filter(|p| !p.as_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let key = ArchiveKey::generate_identity();
    let (Some(identity), Some(recipient)) = (key.identity_string(), key.recipient_string()) else {
        return Err(anyhow!("Generated key is not an identity"));
    };
    let content = zeroize::Zeroizing::new(format!(
        "# appkeep identity for ecc backups\n# public key: {}\n{}\n",
        recipient,
        identity.as_str()
    ));
    fs::write(&args.output, content.as_bytes())?;
    restrict_permissions(&args.output)?;

    output::done(&format!("Wrote identity to {}", args.output));
    output::note(&format!("Public key: {}", recipient));
    output::caution("Keep this file safe: ecc backups cannot be restored without it");
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &camino::Utf8Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &camino::Utf8Path) -> Result<()> {
    Ok(())
}
