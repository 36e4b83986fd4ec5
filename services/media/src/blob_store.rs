use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Durable storage for processed media, addressed by flat object names.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `bytes` under `name`. Either the whole object becomes visible
    /// or nothing does.
    async fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()>;

    /// Remove `name`. Returns whether an object existed.
    async fn delete(&self, name: &str) -> io::Result<bool>;

    /// Check whether `name` is present.
    async fn exists(&self, name: &str) -> io::Result<bool>;
}

/// Blob store backed by a single directory on the local filesystem.
///
/// Objects are written under `staging` first and renamed into `dir` once
/// complete, so `staging` must live on the same filesystem as `dir` and
/// outside any directory that is served publicly.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    dir: PathBuf,
    staging: PathBuf,
}

impl LocalBlobStore {
    pub fn new(dir: impl Into<PathBuf>, staging: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            staging: staging.into(),
        }
    }

    /// Create the object and staging directories if they do not exist yet
    pub async fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        fs::create_dir_all(&self.staging).await?;
        info!(
            dir = %self.dir.display(),
            staging = %self.staging.display(),
            "Media directory ready"
        );
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> io::Result<PathBuf> {
        if !is_valid_object_name(name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid object name: {name:?}"),
            ));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.path_for(name)?;
        let partial = PartialFile::new(self.staging.join(format!("{name}.part")));

        let mut file = fs::File::create(partial.path()).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(partial.path(), &path).await?;
        partial.disarm();

        debug!(path = %path.display(), "Object written");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str) -> io::Result<bool> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Object deleted");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, name: &str) -> io::Result<bool> {
        fs::try_exists(self.path_for(name)?).await
    }
}

/// Temporary file removed on drop unless the write completed.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed partial upload"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove partial upload"),
        }
    }
}

/// Object names are single path components made of a safe character set
pub fn is_valid_object_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    async fn store(dir: &TempDir) -> LocalBlobStore {
        let store = LocalBlobStore::new(dir.path().join("objects"), dir.path().join("staging"));
        store.ensure_dir().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_write_exists_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.write("a.jpg", b"hello").await.unwrap();
        assert!(store.exists("a.jpg").await.unwrap());
        assert_eq!(std::fs::read(store.dir().join("a.jpg")).unwrap(), b"hello");
        assert_eq!(entries(store.dir()), vec!["a.jpg".to_string()]);
        assert!(entries(&dir.path().join("staging")).is_empty());

        assert!(store.delete("a.jpg").await.unwrap());
        assert!(!store.exists("a.jpg").await.unwrap());
        assert!(!store.delete("a.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        // Staging directory was never created, so the temporary file cannot be opened
        let store = LocalBlobStore::new(dir.path(), dir.path().join("missing"));

        assert!(store.write("a.jpg", b"hello").await.is_err());
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_rename_cleans_staging() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir(&staging).unwrap();
        let store = LocalBlobStore::new(dir.path().join("objects"), &staging);

        assert!(store.write("a.jpg", b"hello").await.is_err());
        assert!(entries(&staging).is_empty());
        assert!(!dir.path().join("objects").exists());
    }

    #[tokio::test]
    async fn test_partial_files_stay_out_of_object_dir() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.write("a.mp4", b"video").await.unwrap();
        store.write("b.jpg", b"image").await.unwrap();

        let mut names = entries(store.dir());
        names.sort();
        assert_eq!(names, vec!["a.mp4", "b.jpg"]);
        assert!(names.iter().all(|n| !n.ends_with(".part")));
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        for name in ["../escape.jpg", "a/b.jpg", ".hidden", ""] {
            let err = store.write(name, b"x").await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{name:?}");
        }
        assert!(store.delete("../escape.jpg").await.is_err());
        assert!(entries(&dir.path().join("staging")).is_empty());
    }

    #[tokio::test]
    async fn test_ensure_dir_creates_nested() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(
            dir.path().join("media").join("recipe_steps"),
            dir.path().join(".media-staging"),
        );

        store.ensure_dir().await.unwrap();
        store.write("b.mp4", b"video").await.unwrap();
        assert!(store.dir().join("b.mp4").exists());
        assert!(dir.path().join(".media-staging").is_dir());
    }

    #[test]
    fn test_partial_file_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.part");
        std::fs::write(&path, b"half").unwrap();

        drop(PartialFile::new(path.clone()));
        assert!(!path.exists());
    }
}
