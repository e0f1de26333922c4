//! Backup Engine - operator command line
//!
//! Inspects and maintains the backups found in the configured storage
//! locations.

use anyhow::Result;
use backup_engine::{
    archive::ArchiveSession,
    catalog::Catalog,
    config::Config,
    host::{ConfiguredLocations, LogReporter},
    utils, Backup,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all backups, newest first
    List,
    /// Show the manifest of one backup
    Info { slug: String },
    /// Delete a backup
    Remove { slug: String },
    /// Move a backup file into the local backup directory
    Import { file: PathBuf },
    /// Check a password against a protected backup
    CheckPassword {
        slug: String,
        #[arg(short, long)]
        password: String,
    },
}

fn print_backup(backup: &Backup) {
    println!(
        "{}  {:<8} {:<20} {:>10.2} MB  {}{}",
        backup.slug(),
        backup.kind(),
        backup.date(),
        backup.size_mb(),
        backup.name(),
        if backup.protected() { "  (protected)" } else { "" },
    );
}

async fn find(catalog: &Catalog, slug: &str) -> Result<Backup> {
    catalog
        .get(slug)
        .await
        .ok_or_else(|| anyhow::anyhow!("Backup {} not found", slug))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = args.config {
        Config::from_file(&config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!(
        "Starting backup-engine v{} (backups in {})",
        env!("CARGO_PKG_VERSION"),
        config.storage.default_dir.display()
    );

    let catalog = Catalog::new(
        Arc::new(ConfiguredLocations::new(&config.storage)),
        Arc::new(LogReporter),
    );

    match args.command {
        Command::List => {
            catalog.reload().await?;
            for backup in catalog.list().await {
                print_backup(&backup);
            }
        }
        Command::Info { slug } => {
            catalog.reload().await?;
            let backup = find(&catalog, &slug).await?;
            println!("{}", serde_json::to_string_pretty(backup.manifest())?);
            println!("file: {}", backup.tarfile().display());
        }
        Command::Remove { slug } => {
            catalog.reload().await?;
            catalog.remove(&slug).await?;
            println!("Removed {}", slug);
        }
        Command::Import { file } => {
            catalog.reload().await?;
            let backup = catalog.import(&file).await?;
            print_backup(&backup);
        }
        Command::CheckPassword { slug, password } => {
            catalog.reload().await?;
            let backup = find(&catalog, &slug).await?;
            if !backup.protected() {
                println!("Backup {} is not protected", slug);
                return Ok(());
            }
            let mut session = ArchiveSession::open(backup).await?;
            session.set_password(Some(&password));
            session.validate_password().await?;
            println!("Password is correct");
        }
    }

    Ok(())
}
