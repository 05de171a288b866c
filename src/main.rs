use anyhow::{Context, Result};
use axum::Router;
use config::Backend;
use services::{
    fs_repository::FileBuildRepository,
    repository::SharedRepository,
    sql_repository::{self, SqlBuildRepository},
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting app-distribution with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize the configured repository ---
    let repo: SharedRepository = match cfg.backend {
        Backend::Filesystem => {
            if migrate {
                tracing::info!("Filesystem backend has no schema; nothing to migrate.");
                return Ok(());
            }
            let repo = FileBuildRepository::new(&cfg.storage_dir)
                .await
                .context("opening filesystem repository")?;
            tracing::debug!("Filesystem repository rooted at {}", repo.root().display());
            Arc::new(repo)
        }
        Backend::Sqlite => {
            let pool = sql_repository::connect_pool(&cfg.database_url)
                .await
                .with_context(|| format!("connecting to {}", cfg.database_url))?;
            let repo = SqlBuildRepository::new(Arc::new(pool), &cfg.storage_dir)
                .await
                .context("opening sqlite repository")?;
            repo.migrate().await.context("running migrations")?;

            // --- Handle migration mode ---
            if migrate {
                tracing::info!("Database migration complete.");
                return Ok(()); // exit after migration
            }
            Arc::new(repo)
        }
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes()).with_state(repo);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
