//! Durable file helpers shared by both repository backends.
//!
//! Every write goes to a `.tmp-<uuid>` sibling first, is fsynced, and is then
//! renamed into place so readers never observe a partially written file.

use crate::services::repository::ByteStream;
use futures::StreamExt;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use uuid::Uuid;

/// Prefix of in-flight temp files. Never a valid identifier.
pub const TEMP_PREFIX: &str = ".tmp-";

fn temp_path_in(dir: &Path) -> PathBuf {
    dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()))
}

/// Atomically replace `path` with `contents`.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("target path missing parent directory"))?;
    let tmp_path = temp_path_in(parent);

    let result = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

/// Stream `stream` into a fresh temp file inside `dir`.
///
/// Returns the temp path and the number of bytes written. The caller moves
/// the file into place with [`promote`]; on error the temp file is removed.
pub async fn stage_stream(dir: &Path, mut stream: ByteStream) -> io::Result<(PathBuf, u64)> {
    fs::create_dir_all(dir).await?;
    let tmp_path = temp_path_in(dir);
    let mut file = File::create(&tmp_path).await?;

    let result = async {
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok::<_, io::Error>(written)
    }
    .await;

    match result {
        Ok(written) => Ok((tmp_path, written)),
        Err(err) => {
            let _ = fs::remove_file(&tmp_path).await;
            Err(err)
        }
    }
}

/// Rename a staged temp file to its final location.
///
/// The temp file is removed if either step fails.
pub async fn promote(tmp_path: &Path, final_path: &Path) -> io::Result<()> {
    let result = async {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(tmp_path, final_path).await
    }
    .await;

    if let Err(err) = result {
        let _ = fs::remove_file(tmp_path).await;
        return Err(err);
    }
    Ok(())
}

/// Open a stored file, mapping a missing file to `None`.
pub async fn open_existing(path: &Path) -> io::Result<Option<File>> {
    match File::open(path).await {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Read a whole file, mapping a missing file to `None`.
pub async fn read_existing(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Write, read back and delete a small probe file under `dir`.
pub async fn probe_dir(dir: &Path) -> io::Result<()> {
    let probe = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    fs::write(&probe, b"readyz").await?;
    let read_back = fs::read(&probe).await;
    let _ = fs::remove_file(&probe).await;
    if read_back? != b"readyz" {
        return Err(io::Error::other("probe file content mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn chunks(parts: Vec<io::Result<Bytes>>) -> ByteStream {
        Box::pin(futures::stream::iter(parts))
    }

    async fn leftover_temp_files(dir: &Path) -> usize {
        let mut count = 0;
        let mut entries = fs::read_dir(dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"second");
        assert_eq!(leftover_temp_files(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn test_stage_and_promote_stream() {
        let dir = TempDir::new().unwrap();
        let stream = chunks(vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"de"))]);
        let (tmp, written) = stage_stream(dir.path(), stream).await.unwrap();
        assert_eq!(written, 5);

        let target = dir.path().join("nested").join("app.apk");
        promote(&tmp, &target).await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"abcde");
        assert_eq!(leftover_temp_files(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn test_promote_into_blocked_parent_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let stream = chunks(vec![Ok(Bytes::from_static(b"abc"))]);
        let (tmp, _) = stage_stream(dir.path(), stream).await.unwrap();

        // A regular file where the parent directory should go.
        fs::write(dir.path().join("blocked"), b"").await.unwrap();
        let target = dir.path().join("blocked").join("app.apk");

        assert!(promote(&tmp, &target).await.is_err());
        assert!(!fs::try_exists(&tmp).await.unwrap());
        assert_eq!(leftover_temp_files(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let stream = chunks(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);
        let err = stage_stream(dir.path(), stream).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(leftover_temp_files(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn test_missing_files_map_to_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_existing(&dir.path().join("nope")).await.unwrap().is_none());
        assert!(open_existing(&dir.path().join("nope")).await.unwrap().is_none());
        probe_dir(dir.path()).await.unwrap();
    }
}
