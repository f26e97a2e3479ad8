//! `kseekers-migrate`: applies, rolls back, and reports on schema
//! migrations for the KSeekers database.
//!
//! Exits with status 0 on success and 1 on any failure, including usage
//! errors.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kseekers_db::migrations::MigrationStatus;
use kseekers_db::{DbManager, MigrationManager, Version};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LoggingConfig};

#[derive(Parser, Debug)]
#[command(
    name = "kseekers-migrate",
    version,
    about = "Database migration manager for the KSeekers backend"
)]
struct Cli {
    /// Path to the TOML configuration file (default: $KSEEKERS_CONFIG_PATH,
    /// then kseekers.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Dotenv file loaded before configuration; existing variables win
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending migrations in version order
    Up {
        /// Stop after this version (inclusive)
        #[arg(long, value_parser = parse_version)]
        target: Option<Version>,
    },

    /// Roll back applied migrations, newest first
    Down {
        /// Keep this version and everything older applied
        #[arg(long, value_parser = parse_version)]
        target: Option<Version>,
    },

    /// Show applied, available, and pending migrations
    Status {
        /// Print machine-readable JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Create a new migration file with the next version number
    Create {
        /// Migration name, e.g. "add user roles"
        #[arg(long)]
        name: String,

        /// Also create the matching R{version}.sql rollback stub
        #[arg(long)]
        with_rollback: bool,
    },

    /// Check applied migrations against their files on disk
    Verify,
}

fn parse_version(raw: &str) -> Result<Version, String> {
    Version::parse(raw).map_err(|e| e.to_string())
}

fn resolve_config_path(cli_path: Option<PathBuf>) -> (PathBuf, &'static str) {
    if let Some(path) = cli_path {
        return (path, "cli-arg");
    }

    if let Ok(path) = std::env::var("KSEEKERS_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (PathBuf::from(path), "env-var");
        }
    }

    (PathBuf::from("kseekers.toml"), "default")
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version requests print to stdout and are not failures.
            let failed = e.use_stderr();
            let _ = e.print();
            return if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let env_file_loaded = match dotenvy::from_path(&cli.env_file) {
        Ok(()) => true,
        Err(e) if e.not_found() => false,
        Err(e) => {
            eprintln!("error: failed to load {}: {e}", cli.env_file.display());
            return ExitCode::FAILURE;
        }
    };

    let (config_path, config_source) = resolve_config_path(cli.config);
    let config = match config::load_config(config_path.to_str()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging);

    tracing::debug!(
        source = config_source,
        path = %config_path.display(),
        env_file_loaded,
        "resolved startup configuration"
    );
    if !config_path.is_file() {
        tracing::info!(
            path = %config_path.display(),
            "config file not found, using defaults and environment"
        );
    }

    match run(cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "migration command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, config: &Config) -> Result<()> {
    let db = DbManager::connect(&config.database.path, config.database.pool_settings())
        .with_context(|| format!("failed to open database at {}", config.database.path))?;
    let migrations = MigrationManager::new(db.clone(), &config.migrations.dir);

    let outcome = execute(command, &migrations);

    drop(migrations);
    db.shutdown();
    outcome
}

fn execute(command: Command, migrations: &MigrationManager) -> Result<()> {
    match command {
        Command::Up { target } => {
            let applied = migrations.migrate_up(target.as_ref())?;
            if applied == 0 {
                println!("No pending migrations");
            } else {
                println!("Applied {applied} migration(s)");
            }
        }

        Command::Down { target } => {
            let rolled_back = migrations.migrate_down(target.as_ref())?;
            if rolled_back == 0 {
                println!("No migrations to roll back");
            } else {
                println!("Rolled back {rolled_back} migration(s)");
            }
        }

        Command::Status { json } => {
            let status = migrations.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }

        Command::Create {
            name,
            with_rollback,
        } => {
            let file = migrations.create_migration(&name)?;
            println!("Created migration {}: {}", file.version, file.path.display());
            if with_rollback {
                let path = migrations.create_rollback(&file.version)?;
                println!("Created rollback {}: {}", file.version, path.display());
            }
        }

        Command::Verify => {
            let drifted = migrations.verify()?;
            if !drifted.is_empty() {
                for drift in &drifted {
                    println!(
                        "  {}: recorded {} but file is {} ({})",
                        drift.version,
                        drift.recorded.as_deref().unwrap_or("<none>"),
                        drift.current,
                        drift.path.display()
                    );
                }
                bail!("{} applied migration(s) changed on disk", drifted.len());
            }
            println!("All applied migrations match their files");
        }
    }

    Ok(())
}

fn print_status(status: &MigrationStatus) {
    println!("Applied migrations: {}", status.applied_count);
    println!("Available migrations: {}", status.available_count);
    println!("Pending migrations: {}", status.pending_count);

    if status.pending.is_empty() {
        println!("\nNo pending migrations");
    } else {
        println!("\nPending migrations:");
        for migration in &status.pending {
            println!("  {}: {}", migration.version, migration.name);
        }
    }

    if !status.drifted.is_empty() {
        println!("\nChanged since applied:");
        for drift in &status.drifted {
            println!("  {}: {}", drift.version, drift.path.display());
        }
    }

    if !status.missing_files.is_empty() {
        println!("\nApplied but missing on disk:");
        for version in &status.missing_files {
            println!("  {version}");
        }
    }
}
