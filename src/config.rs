use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr};

/// Which repository implementation backs the service.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Metadata documents and per-app index files on local disk.
    Filesystem,
    /// Metadata rows in SQLite, binaries on local disk.
    Sqlite,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        <Backend as ValueEnum>::from_str(s, true)
            .map_err(|_| anyhow::anyhow!("unknown backend `{s}` (expected filesystem or sqlite)"))
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
    pub storage_dir: String,
    pub database_url: String,
    pub max_upload_mb: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Mobile app build distribution server")]
pub struct Args {
    /// Host to bind to (overrides APP_DIST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides APP_DIST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Repository backend (overrides APP_DIST_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Directory where builds are stored (overrides APP_DIST_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL for the sqlite backend (overrides APP_DIST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Largest accepted upload in MiB (overrides APP_DIST_MAX_UPLOAD_MB)
    #[arg(long)]
    pub max_upload_mb: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Parse an optional numeric environment variable.
fn env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::from_args(Args::parse())
    }

    /// Merge already-parsed CLI args over the environment.
    pub fn from_args(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_host = env::var("APP_DIST_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parsed("APP_DIST_PORT", 8080u16)?;
        let env_backend = match env::var("APP_DIST_BACKEND") {
            Ok(value) => value
                .parse::<Backend>()
                .context("parsing APP_DIST_BACKEND")?,
            Err(_) => Backend::Filesystem,
        };
        let env_storage = env::var("APP_DIST_STORAGE_DIR").unwrap_or_else(|_| "./storage".into());
        let env_db = env::var("APP_DIST_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/app_distribution.db".into());
        let env_max_upload = env_parsed("APP_DIST_MAX_UPLOAD_MB", 512usize)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            backend: args.backend.unwrap_or(env_backend),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            max_upload_mb: args.max_upload_mb.unwrap_or(env_max_upload),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_args_override_defaults() {
        let args = Args::parse_from([
            "app-distribution",
            "--port",
            "9000",
            "--backend",
            "sqlite",
            "--storage-dir",
            "/tmp/builds",
            "--migrate",
        ]);
        let (cfg, migrate) = AppConfig::from_args(args).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.backend, Backend::Sqlite);
        assert_eq!(cfg.storage_dir, "/tmp/builds");
        assert!(migrate);
        assert!(cfg.addr().ends_with(":9000"));
    }

    #[test]
    fn test_backend_parses_case_insensitively() {
        assert_eq!("SQLite".parse::<Backend>().unwrap(), Backend::Sqlite);
        assert_eq!("filesystem".parse::<Backend>().unwrap(), Backend::Filesystem);
        assert!("postgres".parse::<Backend>().is_err());
    }

    #[test]
    fn test_upload_limit_in_bytes() {
        let (cfg, _) = AppConfig::from_args(Args {
            max_upload_mb: Some(2),
            ..Args::default()
        })
        .unwrap();
        assert_eq!(cfg.max_upload_bytes(), 2 * 1024 * 1024);
    }
}
