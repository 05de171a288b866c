//! src/services/sql_repository.rs
//!
//! SQLite-backed build repository. Metadata lives in the `builds` table;
//! binaries are written to `base_path/{bundle_id}/{upload_id}/app.{apk,ipa}`.
//!
//! The client stream is staged to a temp file before any transaction is
//! opened. The row insert and the rename of the staged binary then happen
//! inside one transaction, so a failed rename rolls the row back. A commit
//! failure after the rename removes the binary best-effort; that window is
//! the one place the two can disagree. SQLite's single-writer lock
//! serializes concurrent inserts.

use crate::{
    models::build::{BuildRecord, Platform},
    services::{
        files,
        repository::{
            BuildRepository, ByteStream, RepoResult, RepositoryError, UploadStage,
            check_identifier, collect_latest,
        },
    },
};
use async_trait::async_trait;
use chrono::DateTime;
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::fs::{self, File};
use tracing::{debug, info, warn};

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

const BUILD_COLUMNS: &str = "upload_id, bundle_id, version, build_number, title, icon, \
                             description, file_size, created_at, platform";

/// Raw `builds` row before platform/timestamp decoding.
#[derive(FromRow, Debug)]
struct BuildRow {
    upload_id: String,
    bundle_id: String,
    version: String,
    build_number: String,
    title: String,
    icon: Option<String>,
    description: Option<String>,
    file_size: i64,
    created_at: i64,
    platform: String,
}

impl TryFrom<BuildRow> for BuildRecord {
    type Error = RepositoryError;

    fn try_from(row: BuildRow) -> Result<Self, Self::Error> {
        let platform = Platform::from_str(&row.platform)
            .map_err(|reason| RepositoryError::corrupt(row.upload_id.as_str(), reason))?;
        Ok(BuildRecord {
            created_at: DateTime::from_timestamp_nanos(row.created_at),
            upload_id: row.upload_id,
            bundle_id: row.bundle_id,
            version: row.version,
            build_number: row.build_number,
            title: row.title,
            icon: row.icon,
            description: row.description,
            file_size: row.file_size,
            platform,
        })
    }
}

/// Open a pool for `database_url`, creating the database file if needed.
pub async fn connect_pool(database_url: &str) -> RepoResult<SqlitePool> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                info!("Created missing directory {:?}", parent);
            }
        }
    }
    debug!("Connecting using raw URL => {}", database_url);

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct SqlBuildRepository {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where binaries are stored.
    pub base_path: PathBuf,
}

impl SqlBuildRepository {
    pub async fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> RepoResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { db, base_path })
    }

    /// Create the `builds` table and its index if missing.
    pub async fn migrate(&self) -> RepoResult<()> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    fn bundle_dir(&self, bundle_id: &str) -> PathBuf {
        self.base_path.join(bundle_id)
    }

    fn binary_path(&self, record: &BuildRecord) -> PathBuf {
        self.bundle_dir(&record.bundle_id)
            .join(&record.upload_id)
            .join(record.platform.binary_file_name())
    }

    async fn fetch_one_build(&self, sql: &str, binds: &[&str]) -> RepoResult<Option<BuildRecord>> {
        let mut query = sqlx::query_as::<_, BuildRow>(sql);
        for value in binds {
            query = query.bind(*value);
        }
        query
            .fetch_optional(&*self.db)
            .await?
            .map(BuildRecord::try_from)
            .transpose()
    }

    async fn insert_row(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        record: &BuildRecord,
    ) -> RepoResult<()> {
        let created_at = record.created_at.timestamp_nanos_opt().ok_or_else(|| {
            RepositoryError::InvalidRecord(format!(
                "created_at {} is out of range",
                record.created_at
            ))
        })?;
        let result = sqlx::query(&format!(
            "INSERT INTO builds ({BUILD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&record.upload_id)
        .bind(&record.bundle_id)
        .bind(&record.version)
        .bind(&record.build_number)
        .bind(&record.title)
        .bind(record.icon.as_deref())
        .bind(record.description.as_deref())
        .bind(record.file_size)
        .bind(created_at)
        .bind(record.platform.as_str())
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(RepositoryError::AlreadyExists(record.upload_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl BuildRepository for SqlBuildRepository {
    async fn list_latest_per_app(&self) -> RepoResult<Vec<BuildRecord>> {
        let bundle_ids: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT bundle_id FROM builds ORDER BY bundle_id")
                .fetch_all(&*self.db)
                .await?;
        Ok(collect_latest(self, bundle_ids).await)
    }

    async fn list_versions(&self, bundle_id: &str) -> RepoResult<Vec<BuildRecord>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE bundle_id = ? \
             ORDER BY created_at DESC, upload_id DESC"
        ))
        .bind(bundle_id)
        .fetch_all(&*self.db)
        .await?;

        if rows.is_empty() {
            return Err(RepositoryError::bundle_not_found(bundle_id));
        }

        let mut builds = Vec::with_capacity(rows.len());
        for row in rows {
            match BuildRecord::try_from(row) {
                Ok(build) => builds.push(build),
                Err(err) => warn!(%bundle_id, error = %err, "skipping corrupt build row"),
            }
        }
        if builds.is_empty() {
            return Err(RepositoryError::bundle_not_found(bundle_id));
        }
        Ok(builds)
    }

    async fn latest_version(&self, bundle_id: &str) -> RepoResult<BuildRecord> {
        let sql = format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE bundle_id = ? \
             ORDER BY created_at DESC, upload_id DESC LIMIT 1"
        );
        self.fetch_one_build(&sql, &[bundle_id])
            .await?
            .ok_or_else(|| RepositoryError::bundle_not_found(bundle_id))
    }

    async fn get_build(
        &self,
        bundle_id: &str,
        version: &str,
        build_number: &str,
    ) -> RepoResult<BuildRecord> {
        let sql = format!(
            "SELECT {BUILD_COLUMNS} FROM builds \
             WHERE bundle_id = ? AND version = ? AND build_number = ? \
             ORDER BY created_at DESC, upload_id DESC LIMIT 1"
        );
        self.fetch_one_build(&sql, &[bundle_id, version, build_number])
            .await?
            .ok_or_else(|| {
                RepositoryError::NotFound(format!(
                    "build {version} ({build_number}) not found for bundle ID {bundle_id}"
                ))
            })
    }

    async fn get_upload(&self, bundle_id: &str, upload_id: &str) -> RepoResult<BuildRecord> {
        let sql = format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE upload_id = ? AND bundle_id = ?"
        );
        self.fetch_one_build(&sql, &[upload_id, bundle_id])
            .await?
            .ok_or_else(|| {
                RepositoryError::NotFound(format!(
                    "upload {upload_id} not found for bundle ID {bundle_id}"
                ))
            })
    }

    async fn save_upload(&self, record: &BuildRecord, binary: ByteStream) -> RepoResult<()> {
        record.validate().map_err(RepositoryError::InvalidRecord)?;

        let (tmp_path, written) =
            files::stage_stream(&self.bundle_dir(&record.bundle_id), binary).await?;
        if written != record.file_size as u64 {
            warn!(
                upload_id = %record.upload_id,
                declared = record.file_size,
                written,
                "binary size differs from declared file_size"
            );
        }

        let mut tx = match self.db.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        };

        if let Err(err) = self.insert_row(&mut tx, record).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        let final_path = self.binary_path(record);
        if let Err(err) = files::promote(&tmp_path, &final_path).await {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(upload_id = %record.upload_id, error = %rollback_err, "rollback failed");
            }
            return Err(RepositoryError::partial(
                &record.upload_id,
                UploadStage::Binary,
                err.into(),
            ));
        }

        if let Err(err) = tx.commit().await {
            let _ = fs::remove_file(&final_path).await;
            if let Some(upload_dir) = final_path.parent() {
                let _ = fs::remove_dir(upload_dir).await;
            }
            return Err(RepositoryError::partial(
                &record.upload_id,
                UploadStage::Metadata,
                err.into(),
            ));
        }

        info!(
            bundle_id = %record.bundle_id,
            upload_id = %record.upload_id,
            platform = %record.platform,
            "upload saved"
        );
        Ok(())
    }

    async fn open_binary(&self, record: &BuildRecord) -> RepoResult<File> {
        check_identifier("bundle_id", &record.bundle_id)?;
        check_identifier("upload_id", &record.upload_id)?;
        let path = self.binary_path(record);
        files::open_existing(&path).await?.ok_or_else(|| {
            RepositoryError::NotFound(format!(
                "binary for upload {} not found",
                record.upload_id
            ))
        })
    }

    async fn health_check(&self) -> RepoResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        if one != 1 {
            return Err(RepositoryError::corrupt(
                "readyz",
                format!("unexpected result: {one}"),
            ));
        }
        files::probe_dir(&self.base_path).await?;
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
