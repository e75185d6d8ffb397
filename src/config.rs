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
    pub upload_path: String,
    pub public_base_url: Option<String>,
    pub max_db_connections: u32,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable uploads over HTTP (draft interop version 4)")]
pub struct Args {
    /// Host to bind to (overrides RUFH_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides RUFH_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where upload payloads are stored (overrides RUFH_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides RUFH_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Path of the upload collection (overrides RUFH_UPLOAD_PATH)
    #[arg(long)]
    pub upload_path: Option<String>,

    /// Origin used in `Location`, e.g. https://uploads.example.com (overrides RUFH_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args, |key| env::var(key))?, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    fn merge<F>(args: Args, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let text = |key: &str, default: &str| -> Result<String> {
            match var(key) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", key)),
            }
        };
        let number = |key: &str, default: u32| -> Result<u32> {
            match var(key) {
                Ok(value) => value
                    .parse::<u32>()
                    .with_context(|| format!("parsing {} value `{}`", key, value)),
                Err(env::VarError::NotPresent) => Ok(default),
                Err(err) => Err(err).with_context(|| format!("reading {}", key)),
            }
        };

        let env_port = u16::try_from(number("RUFH_PORT", 3000)?)
            .context("RUFH_PORT must fit in a u16")?;
        let env_public = match var("RUFH_PUBLIC_BASE_URL") {
            Ok(value) if !value.trim().is_empty() => Some(value),
            Ok(_) | Err(env::VarError::NotPresent) => None,
            Err(err) => return Err(err).context("reading RUFH_PUBLIC_BASE_URL"),
        };

        Ok(Self {
            host: args.host.map_or_else(|| text("RUFH_HOST", "0.0.0.0"), Ok)?,
            port: args.port.unwrap_or(env_port),
            storage_dir: args
                .storage_dir
                .map_or_else(|| text("RUFH_STORAGE_DIR", "./data/uploads"), Ok)?,
            database_url: args
                .database_url
                .map_or_else(|| text("RUFH_DATABASE_URL", "sqlite://./data/meta/rufh.db"), Ok)?,
            upload_path: args
                .upload_path
                .map_or_else(|| text("RUFH_UPLOAD_PATH", "/uploads"), Ok)?,
            public_base_url: args.public_base_url.or(env_public),
            max_db_connections: number("RUFH_MAX_DB_CONNECTIONS", 5)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
