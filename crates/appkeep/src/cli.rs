//! CLI argument parsing with clap

use appkeep_core::UserId;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

/// AppKeep - per-application, multi-user backup and restore
#[derive(Parser, Debug)]
#[command(name = "appkeep")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that opens the backup root
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Path to config.yaml (defaults to ~/.appkeep/config.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<Utf8PathBuf>,

    /// Backup root, overriding the configuration
    #[arg(long, global = true, env = "APPKEEP_BACKUP_ROOT")]
    pub backup_root: Option<Utf8PathBuf>,

    /// age identity file for `ecc` instances; `aes` reads APPKEEP_PASSPHRASE
    #[arg(long, global = true, env = "APPKEEP_KEY_FILE")]
    pub key_file: Option<Utf8PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Back up an application into one or more instances
    Backup(BackupArgs),

    /// Restore instances of an application
    Restore(RestoreArgs),

    /// Check the checksums and archives of instances
    Verify(VerifyArgs),

    /// Delete instances of an application
    Delete(DeleteArgs),

    /// List cataloged instances
    List(ListArgs),

    /// Rewrite legacy metadata records in the current schema
    Migrate(MigrateArgs),

    /// Import an OAndBackup package directory as a named instance
    Import(ImportArgs),

    /// Catalog maintenance
    #[command(subcommand)]
    Catalog(CatalogCommands),

    /// Identity key management for ecc backups
    #[command(subcommand)]
    Key(KeyCommands),
}

/// Application and owning user an operation applies to
#[derive(Args, Debug, Clone)]
pub struct AppArgs {
    /// Application id (e.g. com.example.notes)
    pub application_id: String,

    /// User the application belongs to
    #[arg(short, long, default_value_t = 0)]
    pub user: UserId,
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    #[command(flatten)]
    pub app: AppArgs,

    /// Instance name (requires the multiple flag; repeatable)
    #[arg(short, long = "name")]
    pub names: Vec<String>,

    /// Comma separated selection flags (binaries,internal-data,external-data,...)
    #[arg(short, long)]
    pub flags: Option<String>,

    /// Archive format tag for this backup (z, zst)
    #[arg(long)]
    pub format: Option<String>,

    /// Crypto mode tag for this backup (none, aes, rsa, ecc, pgp)
    #[arg(long)]
    pub crypto: Option<String>,

    /// Compression level (1-9)
    #[arg(long)]
    pub compression: Option<u32>,

    /// Additional exclude patterns (glob) for data directories
    #[arg(long)]
    pub exclude: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    #[command(flatten)]
    pub app: AppArgs,

    /// Instance selector: `<user>` or `<user>_<name>` (repeatable)
    #[arg(short, long = "instance")]
    pub instances: Vec<String>,

    /// User to restore into (defaults to the instance's owning user).
    /// More than one requires the custom-users flag.
    #[arg(short, long = "target-user")]
    pub target_users: Vec<UserId>,

    /// Comma separated selection flags (defaults to what was captured)
    #[arg(short, long)]
    pub flags: Option<String>,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub app: AppArgs,

    /// Instance selector: `<user>` or `<user>_<name>` (repeatable)
    #[arg(short, long = "instance")]
    pub instances: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub app: AppArgs,

    /// Instance selector: `<user>` or `<user>_<name>` (repeatable)
    #[arg(short, long = "instance")]
    pub instances: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only list instances of this application
    pub application_id: Option<String>,

    /// Rebuild the catalog from disk first
    #[arg(long)]
    pub refresh: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Only migrate this application (defaults to every application)
    pub application_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// OAndBackup directory named after the package
    pub location: Utf8PathBuf,

    /// User the imported instance belongs to
    #[arg(short, long, default_value_t = 0)]
    pub user: UserId,
}

#[derive(Subcommand, Debug)]
pub enum CatalogCommands {
    /// Rebuild the catalog by scanning the backup root
    Rebuild,
}

#[derive(Subcommand, Debug)]
pub enum KeyCommands {
    /// Generate a new age identity file
    Generate(KeyGenerateArgs),
}

#[derive(Args, Debug)]
pub struct KeyGenerateArgs {
    /// Where to write the identity
    pub output: Utf8PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_backup() {
        let cli = Cli::try_parse_from([
            "appkeep",
            "backup",
            "sample.app",
            "--user",
            "10",
            "--flags",
            "binaries,multiple",
            "-n",
            "weekly",
            "-n",
            "nightly",
        ])
        .unwrap();
        match cli.command {
            Commands::Backup(args) => {
                assert_eq!(args.app.application_id, "sample.app");
                assert_eq!(args.app.user, 10);
                assert_eq!(args.names, vec!["weekly", "nightly"]);
                assert_eq!(args.flags.as_deref(), Some("binaries,multiple"));
            }
            other => panic!("Unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_restore_with_global_options() {
        let cli = Cli::try_parse_from([
            "appkeep",
            "restore",
            "sample.app",
            "-i",
            "0_weekly",
            "--target-user",
            "10",
            "--backup-root",
            "/tmp/backups",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(
            cli.global.backup_root.as_deref(),
            Some(camino::Utf8Path::new("/tmp/backups"))
        );
        match cli.command {
            Commands::Restore(args) => {
                assert_eq!(args.instances, vec!["0_weekly"]);
                assert_eq!(args.target_users, vec![10]);
            }
            other => panic!("Unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_import() {
        let cli = Cli::try_parse_from(["appkeep", "import", "oab/sample.app", "-u", "10"]).unwrap();
        match cli.command {
            Commands::Import(args) => {
                assert_eq!(args.location, Utf8PathBuf::from("oab/sample.app"));
                assert_eq!(args.user, 10);
            }
            other => panic!("Unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_catalog_rebuild() {
        let cli = Cli::try_parse_from(["appkeep", "catalog", "rebuild"]).unwrap();
        assert!(matches!(cli.command, Commands::Catalog(CatalogCommands::Rebuild)));
    }
}
