use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
}

/// What the process should do after configuration is loaded.
#[derive(Debug, Clone)]
pub enum RunMode {
    /// Run the HTTP server (default).
    Serve,
    /// Run migrations and exit.
    Migrate,
    /// Re-apply creation-time file timestamps for one user, then exit.
    FixPhotoTimes { user_id: i64, dry_run: bool },
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Photo backup server")]
pub struct Args {
    /// Host to bind to (overrides PHOTO_BACKUP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PHOTO_BACKUP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where photo files are stored (overrides PHOTO_BACKUP_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides PHOTO_BACKUP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Fix stored file timestamps for the given user id, then exit
    #[arg(long, value_name = "USER_ID", conflicts_with = "migrate")]
    pub fix_photo_times: Option<i64>,

    /// With --fix-photo-times: report what would change without touching files
    #[arg(long, requires = "fix_photo_times")]
    pub dry_run: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("PHOTO_BACKUP_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("PHOTO_BACKUP_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing PHOTO_BACKUP_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 8080,
            Err(err) => return Err(err).context("reading PHOTO_BACKUP_PORT"),
        };
        let env_storage =
            env::var("PHOTO_BACKUP_STORAGE_DIR").unwrap_or_else(|_| "./data/photos".into());
        let env_db = env::var("PHOTO_BACKUP_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/photo_backup.db".into());

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
        };

        let mode = if args.migrate {
            RunMode::Migrate
        } else if let Some(user_id) = args.fix_photo_times {
            RunMode::FixPhotoTimes {
                user_id,
                dry_run: args.dry_run,
            }
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
