use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::storage::paths::PathManager;
use crate::storage::{ShardBody, ShardHandle, StorageAdapter};
use crate::utils::validation::is_valid_key;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::{
    fs::{File, ReadDir, create_dir_all, metadata, read_dir, remove_file, rename},
    io::{self, AsyncWriteExt, BufWriter},
};

/// How `put` lands a payload on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Truncate `<root>/<key>` and stream the payload straight into it.
    /// A concurrent reader may observe a partially written shard.
    #[default]
    Overwrite,
    /// Stream into `<root>/.uploads/<uuid>` and rename onto `<root>/<key>`
    /// once the payload is complete.
    Atomic,
}

/// Stores each shard as a regular file named after its key, directly
/// under a single root directory.
#[derive(Clone, Debug)]
pub struct FileStorageAdapter {
    path_manager: PathManager,
    write_mode: WriteMode,
}

impl FileStorageAdapter {
    /// Opens the store rooted at `root`, creating the directory and any
    /// missing parents first.
    ///
    /// Fails with [`StoreError::InvalidPath`] when `root` exists but is not
    /// a directory. Opening the same directory again is harmless.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_options(root, WriteMode::default())
    }

    pub fn with_options(
        root: impl AsRef<Path>,
        write_mode: WriteMode,
    ) -> Result<Self, StoreError> {
        let root = std::path::absolute(root.as_ref())?;
        validate_root(&root)?;

        Ok(FileStorageAdapter {
            path_manager: PathManager::new(root),
            write_mode,
        })
    }

    pub fn root(&self) -> &Path {
        self.path_manager.root_path()
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    fn shard_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_key(key) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.path_manager.shard_path(key))
    }

    async fn write_atomic(&self, path: &Path, shard: ShardBody) -> io::Result<()> {
        create_dir_all(self.path_manager.uploads_path()).await?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        let mut upload = Upload::new(self.path_manager.upload_path(&upload_id));

        write_file(upload.path(), shard).await?;
        rename(upload.path(), path).await?;
        upload.persisted();
        Ok(())
    }
}

/// An in-flight file under the upload area. Unless it was renamed into place,
/// it is removed when dropped: on error, and when the `put` is cancelled.
struct Upload {
    path: PathBuf,
    persisted: bool,
}

impl Upload {
    fn new(path: PathBuf) -> Self {
        Upload {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persisted(&mut self) {
        self.persisted = true;
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        // Drop cannot await.
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(upload = %self.path.display(), "failed to remove upload: {err}");
            }
        }
    }
}

fn validate_root(root: &Path) -> Result<(), StoreError> {
    if !root.exists() {
        match std::fs::create_dir_all(root) {
            Ok(()) => tracing::info!(root = %root.display(), "created storage root"),
            // lost a race with another creator; the check below decides
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
        }
    }

    if !std::fs::metadata(root)?.is_dir() {
        tracing::debug!(root = %root.display(), "storage root is not a directory");
        return Err(StoreError::InvalidPath(root.to_path_buf()));
    }

    tracing::debug!(root = %root.display(), "using storage root");
    Ok(())
}

async fn write_file(path: &Path, shard: ShardBody) -> io::Result<()> {
    let mut body_reader = shard.into_reader();

    let file = File::create(path).await?;
    let mut file_writer = BufWriter::new(file);

    tokio::io::copy(&mut body_reader, &mut file_writer).await?;
    file_writer.flush().await?;

    Ok(())
}

fn not_found_or(key: &str, err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        tracing::debug!(key, "shard access failed: {err}");
        StoreError::Io(err)
    }
}

enum KeysState {
    Start(PathBuf),
    Listing(ReadDir),
}

async fn next_key(state: KeysState) -> Option<(Result<String, StoreError>, Option<KeysState>)> {
    let mut entries = match state {
        KeysState::Start(root) => match read_dir(&root).await {
            Ok(entries) => entries,
            Err(err) => return Some((Err(err.into()), None)),
        },
        KeysState::Listing(entries) => entries,
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(err) => return Some((Err(err.into()), None)),
        };

        // Follow symlinks, the same way `get` opens the key.
        match metadata(entry.path()).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => continue,
            // removed while we were listing, or a dangling symlink
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Some((Err(err.into()), None)),
        }

        match entry.file_name().into_string() {
            Ok(key) => return Some((Ok(key), Some(KeysState::Listing(entries)))),
            Err(name) => tracing::warn!(?name, "skipping shard file with a non UTF-8 name"),
        }
    }
}

#[async_trait::async_trait]
impl StorageAdapter for FileStorageAdapter {
    async fn get(&self, key: &str) -> Result<ShardHandle, StoreError> {
        tracing::debug!(key, "FileStorageAdapter::get");
        let path = self.shard_path(key)?;

        let file = File::open(&path).await.map_err(|err| not_found_or(key, err))?;
        // Directories (such as the upload area) are never shards.
        if file.metadata().await?.is_dir() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(ShardHandle::new(key, file))
    }

    async fn peek(&self, key: &str) -> Result<ShardHandle, StoreError> {
        tracing::debug!(key, "FileStorageAdapter::peek");
        self.get(key).await
    }

    async fn put(&self, key: &str, shard: ShardBody) -> Result<(), StoreError> {
        tracing::debug!(key, mode = ?self.write_mode, "FileStorageAdapter::put");
        let path = self.shard_path(key)?;

        let result = match self.write_mode {
            WriteMode::Overwrite => write_file(&path, shard).await,
            WriteMode::Atomic => self.write_atomic(&path, shard).await,
        };
        result.map_err(|err| {
            tracing::debug!(key, "shard write failed: {err}");
            StoreError::Io(err)
        })
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        tracing::debug!(key, "FileStorageAdapter::del");
        let path = self.shard_path(key)?;

        remove_file(&path).await.map_err(|err| {
            tracing::debug!(key, "shard removal failed: {err}");
            StoreError::Io(err)
        })
    }

    async fn flush(&self) -> Result<(), StoreError> {
        // Nothing is buffered, every put has reached the filesystem already.
        tracing::debug!("FileStorageAdapter::flush");
        Ok(())
    }

    async fn size(&self, key: Option<&str>) -> Result<u64, StoreError> {
        tracing::debug!(?key, "FileStorageAdapter::size");

        if let Some(key) = key {
            let path = self.shard_path(key)?;
            let meta = metadata(&path).await.map_err(|err| not_found_or(key, err))?;
            if !meta.is_file() {
                return Err(StoreError::NotFound(key.to_string()));
            }
            return Ok(meta.len());
        }

        let mut total = 0;
        let mut entries = read_dir(self.root()).await?;
        while let Some(entry) = entries.next_entry().await? {
            match metadata(entry.path()).await {
                Ok(meta) if meta.is_file() => total += meta.len(),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(total)
    }

    fn keys(&self) -> BoxStream<'static, Result<String, StoreError>> {
        tracing::debug!("FileStorageAdapter::keys");
        let start = KeysState::Start(self.root().to_path_buf());

        stream::unfold(Some(start), |state| async move {
            match state {
                Some(state) => next_key(state).await,
                None => None,
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[test]
    fn test_creates_missing_root() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().join("nested").join("shards");

        let adapter = FileStorageAdapter::new(&root)?;
        assert!(root.is_dir());
        assert_eq!(adapter.root(), root);
        assert_eq!(adapter.write_mode(), WriteMode::Overwrite);
        Ok(())
    }

    #[test]
    fn test_existing_root_is_reused() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        std::fs::write(temp_dir.path().join("abc123"), b"test")?;

        FileStorageAdapter::new(temp_dir.path())?;
        FileStorageAdapter::new(temp_dir.path())?;
        assert_eq!(std::fs::read(temp_dir.path().join("abc123"))?, b"test");
        Ok(())
    }

    #[test]
    fn test_file_root_is_rejected() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let file = temp_dir.path().join("not-a-dir");
        std::fs::write(&file, b"")?;

        let err = FileStorageAdapter::new(&file).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath(ref path) if path == &file));
        assert_eq!(err.to_string(), "Invalid directory path supplied");
        Ok(())
    }

    #[test]
    fn test_parent_file_fails_with_io() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let file = temp_dir.path().join("blocker");
        std::fs::write(&file, b"")?;

        let err = FileStorageAdapter::new(file.join("shards")).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_key_has_no_side_effect() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let adapter = FileStorageAdapter::new(temp_dir.path().join("shards"))?;

        for key in ["", ".", "..", "../escape", "a/b"] {
            let err = adapter.put(key, "test".into()).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey(_)), "{key:?}");
            assert!(matches!(adapter.get(key).await, Err(StoreError::InvalidKey(_))));
            assert!(matches!(adapter.del(key).await, Err(StoreError::InvalidKey(_))));
        }
        assert!(!temp_dir.path().join("escape").exists());
        assert_eq!(std::fs::read_dir(adapter.root())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_atomic_failure_leaves_no_shard() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let adapter = FileStorageAdapter::with_options(temp_dir.path(), WriteMode::Atomic)?;

        let body = ShardBody::from_stream(stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"half")),
            Err(io::Error::other("Failed")),
        ]));
        let err = adapter.put("abc123", body).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed");
        assert!(!temp_dir.path().join("abc123").exists());

        let uploads = adapter.path_manager.uploads_path();
        assert_eq!(std::fs::read_dir(uploads)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_atomic_uploads_are_not_keys() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let adapter = FileStorageAdapter::with_options(temp_dir.path(), WriteMode::Atomic)?;

        adapter.put("abc123", "test".into()).await?;
        adapter.put("abc123", "replaced".into()).await?;
        assert!(adapter.path_manager.uploads_path().is_dir());

        let keys: Vec<String> = adapter.keys().try_collect().await?;
        assert_eq!(keys, vec!["abc123".to_string()]);
        assert_eq!(adapter.size(None).await?, "replaced".len() as u64);
        assert!(adapter.get(".uploads").await.unwrap_err().is_not_found());

        let mut handle = adapter.get("abc123").await?;
        assert_eq!(handle.read_to_vec().await?, b"replaced");
        Ok(())
    }

    #[tokio::test]
    async fn test_keys_on_removed_root_errors_then_ends() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().join("shards");
        let adapter = FileStorageAdapter::new(&root)?;
        std::fs::remove_dir(&root)?;

        let items: Vec<_> = adapter.keys().collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            &items[0],
            Err(StoreError::Io(err)) if err.kind() == io::ErrorKind::NotFound
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_atomic_put_removes_upload() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let adapter = FileStorageAdapter::with_options(temp_dir.path(), WriteMode::Atomic)?;

        let stalled = ShardBody::from_stream(
            stream::iter(vec![Ok(bytes::Bytes::from_static(b"ne"))]).chain(stream::pending()),
        );
        let put = adapter.put("abc123", stalled);
        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(50), put).await;
        assert!(cancelled.is_err());

        let uploads = adapter.path_manager.uploads_path();
        assert_eq!(std::fs::read_dir(uploads)?.count(), 0);
        assert!(!temp_dir.path().join("abc123").exists());
        assert_eq!(adapter.size(None).await?, 0);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_shard_is_listed_and_readable() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let outside = temp_dir.path().join("outside");
        std::fs::write(&outside, b"test")?;
        let adapter = FileStorageAdapter::new(temp_dir.path().join("shards"))?;
        std::os::unix::fs::symlink(&outside, adapter.root().join("linked"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("gone"), adapter.root().join("dangling"))?;

        let keys: Vec<String> = adapter.keys().try_collect().await?;
        assert_eq!(keys, vec!["linked".to_string()]);
        assert_eq!(adapter.size(None).await?, 4);

        let mut handle = adapter.get("linked").await?;
        assert_eq!(handle.read_to_vec().await?, b"test");
        assert!(adapter.get("dangling").await.unwrap_err().is_not_found());
        Ok(())
    }
}
