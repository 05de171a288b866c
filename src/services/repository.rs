//! src/services/repository.rs
//!
//! The build repository contract shared by the filesystem and SQLite
//! backends. Handlers only ever see `Arc<dyn BuildRepository>`; which
//! implementation sits behind it is decided once at startup.

use crate::models::build::{BuildRecord, validate_identifier};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::{fmt, io, pin::Pin, sync::Arc};
use thiserror::Error;
use tokio::fs::File;

/// A boxed stream of binary chunks handed to `save_upload`.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Shared handle to whichever backend was configured.
pub type SharedRepository = Arc<dyn BuildRepository>;

/// Write sub-step that failed during an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Metadata,
    Binary,
    Index,
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStage::Metadata => "metadata",
            UploadStage::Binary => "binary",
            UploadStage::Index => "index",
        };
        f.write_str(name)
    }
}

/// Errors returned by repository operations.
///
/// `Io` and `Sqlx` together form the "storage unavailable" class: they are
/// always surfaced to the caller and never retried here.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{0}")]
    NotFound(String),
    #[error("corrupt record `{key}`: {reason}")]
    CorruptRecord { key: String, reason: String },
    #[error("invalid build record: {0}")]
    InvalidRecord(String),
    #[error("upload `{0}` already exists")]
    AlreadyExists(String),
    #[error("upload `{upload_id}` failed while writing {stage}: {source}")]
    PartialUpload {
        upload_id: String,
        stage: UploadStage,
        #[source]
        source: Box<RepositoryError>,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RepositoryError {
    pub fn bundle_not_found(bundle_id: &str) -> Self {
        RepositoryError::NotFound(format!("no versions found for bundle ID {bundle_id}"))
    }

    pub fn corrupt(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        RepositoryError::CorruptRecord {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn partial(upload_id: &str, stage: UploadStage, source: RepositoryError) -> Self {
        RepositoryError::PartialUpload {
            upload_id: upload_id.to_string(),
            stage,
            source: Box::new(source),
        }
    }

    /// True for I/O and database failures.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, RepositoryError::Io(_) | RepositoryError::Sqlx(_))
    }
}

pub type RepoResult<T> = Result<T, RepositoryError>;

/// Reject identifiers that cannot be used as a single path segment.
pub(crate) fn check_identifier(field: &str, value: &str) -> RepoResult<()> {
    validate_identifier(field, value).map_err(RepositoryError::InvalidRecord)
}

/// Persistence contract for uploaded builds.
///
/// List operations skip individual unreadable records with a warning;
/// point lookups surface every error.
#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// The newest build of every known app. Empty store yields an empty list.
    async fn list_latest_per_app(&self) -> RepoResult<Vec<BuildRecord>>;

    /// All builds of `bundle_id`, newest first. `NotFound` for unknown apps.
    async fn list_versions(&self, bundle_id: &str) -> RepoResult<Vec<BuildRecord>>;

    /// The newest build of `bundle_id`.
    async fn latest_version(&self, bundle_id: &str) -> RepoResult<BuildRecord>;

    /// The newest build of `bundle_id` matching both version strings.
    async fn get_build(
        &self,
        bundle_id: &str,
        version: &str,
        build_number: &str,
    ) -> RepoResult<BuildRecord>;

    /// A single upload of `bundle_id`.
    async fn get_upload(&self, bundle_id: &str, upload_id: &str) -> RepoResult<BuildRecord>;

    /// Persist metadata and binary, then make the build discoverable.
    async fn save_upload(&self, record: &BuildRecord, binary: ByteStream) -> RepoResult<()>;

    /// Open the stored binary of `record` for reading.
    async fn open_binary(&self, record: &BuildRecord) -> RepoResult<File>;

    /// Round-trip probe against the backing storage.
    async fn health_check(&self) -> RepoResult<()>;
}

/// Resolve the latest build of each app, skipping apps that fail.
///
/// Shared by both backends once they have enumerated their bundle ids.
pub(crate) async fn collect_latest<R>(repo: &R, bundle_ids: Vec<String>) -> Vec<BuildRecord>
where
    R: BuildRepository + ?Sized,
{
    let mut latest = Vec::with_capacity(bundle_ids.len());
    for bundle_id in bundle_ids {
        match repo.latest_version(&bundle_id).await {
            Ok(build) => latest.push(build),
            Err(err) => {
                tracing::warn!(%bundle_id, error = %err, "skipping app while listing latest builds");
            }
        }
    }
    latest.sort_by(|a, b| a.bundle_id.cmp(&b.bundle_id));
    latest
}
