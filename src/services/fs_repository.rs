//! src/services/fs_repository.rs
//!
//! Filesystem-backed build repository.
//!
//! Layout beneath `root`:
//! - `{upload_id}/build_info.json`: the record, source of truth for content
//! - `{upload_id}/app.apk|app.ipa`: the binary
//! - `_indexes/by_bundle_id/{bundle_id}.json`: newest-first list of
//!   `(upload_id, created_at)` used to discover an app's uploads
//!
//! An index entry is only written after both files of its upload are in
//! place, so readers never see an entry pointing at nothing they could not
//! skip. Index rewrites are serialized per `bundle_id`.

use crate::{
    models::{
        build::BuildRecord,
        index::{self, IndexEntry},
    },
    services::{
        files,
        locks::KeyedLocks,
        repository::{
            BuildRepository, ByteStream, RepoResult, RepositoryError, UploadStage,
            check_identifier, collect_latest,
        },
    },
};
use async_trait::async_trait;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::fs::{self, File};
use tracing::{debug, info, warn};

const INDEXES_DIR: &str = "_indexes";
const BY_BUNDLE_ID_DIR: &str = "by_bundle_id";
const BUILD_INFO_FILE: &str = "build_info.json";
const INDEX_EXTENSION: &str = ".json";

pub struct FileBuildRepository {
    /// Storage root holding upload directories and the index tree.
    root: PathBuf,

    index_locks: KeyedLocks,
}

impl FileBuildRepository {
    /// Open (and create if needed) a repository rooted at `root`.
    pub async fn new(root: impl Into<PathBuf>) -> RepoResult<Self> {
        let root = root.into();
        let repo = Self {
            root,
            index_locks: KeyedLocks::new(),
        };
        fs::create_dir_all(repo.index_dir()).await?;
        info!(root = %repo.root.display(), "filesystem build repository ready");
        Ok(repo)
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(upload_id)
    }

    fn build_info_path(&self, upload_id: &str) -> PathBuf {
        self.upload_dir(upload_id).join(BUILD_INFO_FILE)
    }

    fn binary_path(&self, record: &BuildRecord) -> PathBuf {
        self.upload_dir(&record.upload_id)
            .join(record.platform.binary_file_name())
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join(INDEXES_DIR).join(BY_BUNDLE_ID_DIR)
    }

    fn index_path(&self, bundle_id: &str) -> PathBuf {
        self.index_dir()
            .join(format!("{bundle_id}{INDEX_EXTENSION}"))
    }

    /// Load the index for `bundle_id`. `None` when the app has no index.
    async fn read_index(&self, bundle_id: &str) -> RepoResult<Option<Vec<IndexEntry>>> {
        let path = self.index_path(bundle_id);
        let Some(bytes) = files::read_existing(&path).await? else {
            return Ok(None);
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Some(Vec::new()));
        }
        let mut entries: Vec<IndexEntry> = serde_json::from_slice(&bytes)
            .map_err(|err| RepositoryError::corrupt(path.display().to_string(), err))?;
        index::sort_newest_first(&mut entries);
        Ok(Some(entries))
    }

    /// Load one upload's metadata. `None` when the document is missing.
    async fn read_build_info(&self, upload_id: &str) -> RepoResult<Option<BuildRecord>> {
        let path = self.build_info_path(upload_id);
        let Some(bytes) = files::read_existing(&path).await? else {
            return Ok(None);
        };
        let record: BuildRecord = serde_json::from_slice(&bytes)
            .map_err(|err| RepositoryError::corrupt(upload_id, err))?;
        if record.upload_id != upload_id {
            return Err(RepositoryError::corrupt(
                upload_id,
                format!("document names upload `{}`", record.upload_id),
            ));
        }
        Ok(Some(record))
    }

    /// Resolve an index entry to its record, or `None` if it should be skipped.
    ///
    /// Orphans (no metadata) and corrupt documents are logged and skipped.
    /// Storage failures are returned.
    async fn hydrate_entry(
        &self,
        bundle_id: &str,
        entry: &IndexEntry,
    ) -> RepoResult<Option<BuildRecord>> {
        match self.read_build_info(&entry.upload_id).await {
            Ok(Some(record)) if record.bundle_id == bundle_id => Ok(Some(record)),
            Ok(Some(record)) => {
                warn!(
                    %bundle_id,
                    upload_id = %entry.upload_id,
                    found = %record.bundle_id,
                    "index entry points at another app's upload, skipping"
                );
                Ok(None)
            }
            Ok(None) => {
                warn!(%bundle_id, upload_id = %entry.upload_id, "orphan index entry, skipping");
                Ok(None)
            }
            Err(err @ RepositoryError::CorruptRecord { .. }) => {
                warn!(%bundle_id, upload_id = %entry.upload_id, error = %err, "skipping corrupt build record");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn write_build_info(&self, record: &BuildRecord) -> RepoResult<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|err| RepositoryError::corrupt(record.upload_id.as_str(), err))?;
        files::write_atomic(&self.build_info_path(&record.upload_id), &json).await?;
        Ok(())
    }

    async fn write_binary(&self, record: &BuildRecord, binary: ByteStream) -> RepoResult<()> {
        let dir = self.upload_dir(&record.upload_id);
        let (tmp_path, written) = files::stage_stream(&dir, binary).await?;
        let final_path = self.binary_path(record);
        files::promote(&tmp_path, &final_path).await?;

        if written != record.file_size as u64 {
            warn!(
                upload_id = %record.upload_id,
                declared = record.file_size,
                written,
                "binary size differs from declared file_size"
            );
        }
        debug!(path = %final_path.display(), written, "stored binary");
        Ok(())
    }

    /// Add the upload to its app's index.
    ///
    /// Read-modify-write under the per-app lock, then an atomic rename, so
    /// concurrent uploads cannot drop each other's entries and readers never
    /// see a torn file.
    async fn append_to_index(&self, record: &BuildRecord) -> RepoResult<()> {
        let _guard = self.index_locks.lock(&record.bundle_id).await;

        let mut entries = self.read_index(&record.bundle_id).await?.unwrap_or_default();
        index::insert_entry(
            &mut entries,
            IndexEntry {
                upload_id: record.upload_id.clone(),
                created_at: record.created_at,
            },
        );
        let json = serde_json::to_vec_pretty(&entries)
            .map_err(|err| RepositoryError::corrupt(record.bundle_id.as_str(), err))?;
        files::write_atomic(&self.index_path(&record.bundle_id), &json).await?;

        debug!(bundle_id = %record.bundle_id, entries = entries.len(), "index updated");
        Ok(())
    }

    /// Every bundle id that has an index document, sorted.
    async fn bundle_ids(&self) -> RepoResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut dir = match fs::read_dir(self.index_dir()).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if let Some(bundle_id) = name.strip_suffix(INDEX_EXTENSION) {
                ids.push(bundle_id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Storage root, for diagnostics.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BuildRepository for FileBuildRepository {
    async fn list_latest_per_app(&self) -> RepoResult<Vec<BuildRecord>> {
        let bundle_ids = self.bundle_ids().await?;
        Ok(collect_latest(self, bundle_ids).await)
    }

    async fn list_versions(&self, bundle_id: &str) -> RepoResult<Vec<BuildRecord>> {
        check_identifier("bundle_id", bundle_id)?;
        let entries = match self.read_index(bundle_id).await? {
            Some(entries) if !entries.is_empty() => entries,
            _ => return Err(RepositoryError::bundle_not_found(bundle_id)),
        };

        let mut builds = Vec::with_capacity(entries.len());
        for entry in &entries {
            if let Some(record) = self.hydrate_entry(bundle_id, entry).await? {
                builds.push(record);
            }
        }
        if builds.is_empty() {
            return Err(RepositoryError::bundle_not_found(bundle_id));
        }
        builds.sort_by(BuildRecord::newest_first);
        Ok(builds)
    }

    async fn latest_version(&self, bundle_id: &str) -> RepoResult<BuildRecord> {
        check_identifier("bundle_id", bundle_id)?;
        let entries = self
            .read_index(bundle_id)
            .await?
            .ok_or_else(|| RepositoryError::bundle_not_found(bundle_id))?;

        for entry in &entries {
            match self.read_build_info(&entry.upload_id).await? {
                Some(record) if record.bundle_id == bundle_id => return Ok(record),
                Some(record) => {
                    warn!(
                        %bundle_id,
                        upload_id = %entry.upload_id,
                        found = %record.bundle_id,
                        "index entry points at another app's upload, trying next"
                    );
                }
                None => {
                    warn!(%bundle_id, upload_id = %entry.upload_id, "orphan index entry, trying next");
                }
            }
        }
        Err(RepositoryError::bundle_not_found(bundle_id))
    }

    async fn get_build(
        &self,
        bundle_id: &str,
        version: &str,
        build_number: &str,
    ) -> RepoResult<BuildRecord> {
        self.list_versions(bundle_id)
            .await?
            .into_iter()
            .find(|b| b.version == version && b.build_number == build_number)
            .ok_or_else(|| {
                RepositoryError::NotFound(format!(
                    "build {version} ({build_number}) not found for bundle ID {bundle_id}"
                ))
            })
    }

    async fn get_upload(&self, bundle_id: &str, upload_id: &str) -> RepoResult<BuildRecord> {
        check_identifier("bundle_id", bundle_id)?;
        check_identifier("upload_id", upload_id)?;
        let not_found = || {
            RepositoryError::NotFound(format!(
                "upload {upload_id} not found for bundle ID {bundle_id}"
            ))
        };

        // Uploads missing from the index are orphans and stay invisible.
        let indexed = self
            .read_index(bundle_id)
            .await?
            .is_some_and(|entries| entries.iter().any(|e| e.upload_id == upload_id));
        if !indexed {
            return Err(not_found());
        }
        match self.read_build_info(upload_id).await? {
            Some(record) if record.bundle_id == bundle_id => Ok(record),
            _ => Err(not_found()),
        }
    }

    async fn save_upload(&self, record: &BuildRecord, binary: ByteStream) -> RepoResult<()> {
        record.validate().map_err(RepositoryError::InvalidRecord)?;

        let dir = self.upload_dir(&record.upload_id);
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(RepositoryError::AlreadyExists(record.upload_id.clone()));
            }
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = self.write_build_info(record).await {
            // Nothing durable yet; free the upload id again.
            let _ = fs::remove_dir_all(&dir).await;
            return Err(err);
        }

        self.write_binary(record, binary)
            .await
            .map_err(|err| RepositoryError::partial(&record.upload_id, UploadStage::Binary, err))?;

        self.append_to_index(record)
            .await
            .map_err(|err| RepositoryError::partial(&record.upload_id, UploadStage::Index, err))?;

        info!(
            bundle_id = %record.bundle_id,
            upload_id = %record.upload_id,
            platform = %record.platform,
            "upload saved"
        );
        Ok(())
    }

    async fn open_binary(&self, record: &BuildRecord) -> RepoResult<File> {
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
        if !fs::try_exists(self.index_dir()).await? {
            return Err(RepositoryError::Io(io::Error::new(
                ErrorKind::NotFound,
                "index directory missing",
            )));
        }
        files::probe_dir(&self.root).await?;
        Ok(())
    }
}
