use crate::blob_store::BlobStore;
use crate::config::MediaConfig;
use crate::normalizer::{ImageNormalizer, ProcessingError, NORMALIZED_EXTENSION};
use crate::validation::{
    extension_of, BoundedReadError, MediaKind, UploadCandidate, ValidationError, ValidationPolicy,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Attempts at drawing an identifier that is not already taken
const MAX_IDENTIFIER_ATTEMPTS: usize = 3;

/// Errors that can occur while saving media.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("Maximum {max} files per step, got {count}")]
    TooManyFiles { count: usize, max: usize },

    #[error("File save error: {0}")]
    Io(#[from] io::Error),

    #[error("Media processing task failed: {0}")]
    Task(String),
}

impl From<BoundedReadError> for StoreError {
    fn from(err: BoundedReadError) -> Self {
        match err {
            BoundedReadError::Rejected(e) => StoreError::Validation(e),
            BoundedReadError::Io(e) => StoreError::Io(e),
        }
    }
}

/// Durable record of a stored media file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    /// Opaque, collision-free name of the stored file
    #[serde(rename = "filename")]
    pub identifier: String,
    /// Filename as uploaded
    pub original_filename: String,
    /// Image or video
    #[serde(rename = "type")]
    pub kind: MediaKind,
    /// Public URL of the stored file
    pub url: String,
    /// Stored size in bytes
    pub size: u64,
}

/// Validates, normalizes and persists uploads, one file or one batch at a time
pub struct MediaStore {
    blobs: Arc<dyn BlobStore>,
    policy: ValidationPolicy,
    normalizer: ImageNormalizer,
    max_files_per_batch: usize,
    base_url: String,
}

impl MediaStore {
    pub fn new(blobs: Arc<dyn BlobStore>, config: &MediaConfig) -> Self {
        info!(
            base_url = %config.public_base_url(),
            max_file_size_bytes = config.max_file_size_bytes,
            max_files_per_batch = config.max_files_per_batch,
            "Media store initialized"
        );

        Self {
            blobs,
            policy: ValidationPolicy::from_config(config),
            normalizer: ImageNormalizer::from_config(config),
            max_files_per_batch: config.max_files_per_batch,
            base_url: config.public_base_url(),
        }
    }

    /// Save a single upload.
    ///
    /// Validation and image processing finish before anything is written. If
    /// the write fails, whatever landed under the new identifier is removed
    /// before the error is returned.
    #[instrument(skip(self, candidate), fields(filename = ?candidate.filename))]
    pub async fn save_one(
        &self,
        mut candidate: UploadCandidate,
    ) -> Result<MediaDescriptor, StoreError> {
        if let Err(e) = self.policy.validate(&mut candidate) {
            metrics::counter!("media.files.rejected").increment(1);
            return Err(e.into());
        }

        let UploadCandidate { filename, body, .. } = candidate;
        let original_filename = filename.ok_or(ValidationError::MissingFilename)?;
        let kind = self.policy.classify(&original_filename)?;
        let extension = match kind {
            MediaKind::Image => NORMALIZED_EXTENSION.to_string(),
            MediaKind::Video => extension_of(&original_filename).unwrap_or_default(),
        };

        let normalizer = self.normalizer;
        let max_size = self.policy.max_file_size();
        let payload = tokio::task::spawn_blocking(move || -> Result<Bytes, StoreError> {
            let raw = body.read_bounded(max_size)?;
            match kind {
                MediaKind::Image => Ok(Bytes::from(normalizer.normalize(&raw)?)),
                MediaKind::Video => Ok(raw),
            }
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?;

        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                metrics::counter!("media.files.rejected").increment(1);
                return Err(e);
            }
        };

        let identifier = self.new_identifier(&extension).await?;

        if let Err(e) = self.blobs.write(&identifier, &payload).await {
            match self.blobs.delete(&identifier).await {
                Ok(removed) => debug!(identifier = %identifier, removed, "Cleaned up failed write"),
                Err(cleanup) => warn!(
                    identifier = %identifier,
                    error = %cleanup,
                    "Failed to clean up after write error"
                ),
            }
            return Err(StoreError::Io(e));
        }

        metrics::counter!("media.files.saved").increment(1);
        info!(
            identifier = %identifier,
            kind = ?kind,
            size_bytes = payload.len(),
            "Media file saved"
        );

        Ok(MediaDescriptor {
            url: self.url_for(&identifier),
            identifier,
            original_filename,
            kind,
            size: payload.len() as u64,
        })
    }

    /// Save a batch of uploads atomically.
    ///
    /// Candidates without a filename are skipped. If any other candidate
    /// fails, every file already saved for this batch is deleted and the
    /// original error is returned.
    #[instrument(skip(self, candidates), fields(count = candidates.len()))]
    pub async fn save_batch(
        &self,
        candidates: Vec<UploadCandidate>,
    ) -> Result<Vec<MediaDescriptor>, StoreError> {
        if candidates.len() > self.max_files_per_batch {
            metrics::counter!("media.files.rejected").increment(candidates.len() as u64);
            return Err(StoreError::TooManyFiles {
                count: candidates.len(),
                max: self.max_files_per_batch,
            });
        }

        let mut saved = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if candidate.is_unnamed() {
                debug!("Skipping upload without a filename");
                continue;
            }

            match self.save_one(candidate).await {
                Ok(descriptor) => saved.push(descriptor),
                Err(e) => {
                    self.roll_back(&saved).await;
                    return Err(e);
                }
            }
        }

        Ok(saved)
    }

    /// Delete a stored file. Returns whether it existed.
    #[instrument(skip(self))]
    pub async fn delete(&self, identifier: &str) -> bool {
        match self.blobs.delete(identifier).await {
            Ok(removed) => {
                if removed {
                    metrics::counter!("media.files.deleted").increment(1);
                    info!(identifier = %identifier, "Media file deleted");
                }
                removed
            }
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Failed to delete media file");
                false
            }
        }
    }

    pub fn max_files_per_batch(&self) -> usize {
        self.max_files_per_batch
    }

    /// Public URL for a stored identifier
    pub fn url_for(&self, identifier: &str) -> String {
        format!("{}/{}", self.base_url, identifier)
    }

    async fn roll_back(&self, saved: &[MediaDescriptor]) {
        if saved.is_empty() {
            return;
        }

        metrics::counter!("media.batches.rolled_back").increment(1);
        warn!(files = saved.len(), "Rolling back partially saved batch");

        for descriptor in saved {
            if let Err(e) = self.blobs.delete(&descriptor.identifier).await {
                warn!(
                    identifier = %descriptor.identifier,
                    error = %e,
                    "Failed to roll back saved file"
                );
            }
        }
    }

    async fn new_identifier(&self, extension: &str) -> Result<String, StoreError> {
        for _ in 0..MAX_IDENTIFIER_ATTEMPTS {
            let identifier = if extension.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                format!("{}.{}", Uuid::new_v4(), extension)
            };

            if !self.blobs.exists(&identifier).await? {
                return Ok(identifier);
            }
            warn!(identifier = %identifier, "Identifier collision, drawing a new one");
        }

        Err(StoreError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not allocate a unique media identifier",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{LocalBlobStore, MockBlobStore};
    use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::path::Path;
    use tempfile::TempDir;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 128]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn config(max_file_size: u64) -> MediaConfig {
        MediaConfig {
            max_file_size_bytes: max_file_size,
            ..Default::default()
        }
    }

    fn local_store(dir: &TempDir, max_file_size: u64) -> MediaStore {
        let blobs = Arc::new(LocalBlobStore::new(dir.path(), std::env::temp_dir()));
        MediaStore::new(blobs, &config(max_file_size))
    }

    fn file_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_save_image_is_normalized() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir, 10 * 1024 * 1024);

        let descriptor = store
            .save_one(UploadCandidate::from_bytes("Dough.PNG", png(1600, 400)))
            .await
            .unwrap();

        assert_eq!(descriptor.kind, MediaKind::Image);
        assert_eq!(descriptor.original_filename, "Dough.PNG");
        assert!(descriptor.identifier.ends_with(".jpg"));
        assert_eq!(
            descriptor.url,
            format!("/static/recipe_steps/{}", descriptor.identifier)
        );

        let stored = std::fs::read(dir.path().join(&descriptor.identifier)).unwrap();
        assert_eq!(stored.len() as u64, descriptor.size);
        let decoded = image::load_from_memory(&stored).unwrap();
        assert_eq!(decoded.dimensions(), (800, 200));
    }

    #[tokio::test]
    async fn test_save_video_passes_through() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir, 1024);
        let bytes = vec![42u8; 512];

        let descriptor = store
            .save_one(UploadCandidate::from_bytes("clip.MP4", bytes.clone()))
            .await
            .unwrap();

        assert_eq!(descriptor.kind, MediaKind::Video);
        assert!(descriptor.identifier.ends_with(".mp4"));
        assert_eq!(descriptor.size, 512);
        assert_eq!(std::fs::read(dir.path().join(&descriptor.identifier)).unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_identifiers_are_unique() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir, 1024);

        let a = store
            .save_one(UploadCandidate::from_bytes("a.mp4", vec![1u8; 8]))
            .await
            .unwrap();
        let b = store
            .save_one(UploadCandidate::from_bytes("a.mp4", vec![1u8; 8]))
            .await
            .unwrap();

        assert_ne!(a.identifier, b.identifier);
        assert_eq!(file_count(dir.path()), 2);
    }

    #[tokio::test]
    async fn test_save_then_delete() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir, 10 * 1024 * 1024);

        let descriptor = store
            .save_one(UploadCandidate::from_bytes("photo.webp", png(64, 64)))
            .await
            .unwrap();
        let path = dir.path().join(&descriptor.identifier);
        assert!(path.exists());

        assert!(store.delete(&descriptor.identifier).await);
        assert!(!path.exists());
        assert!(!store.delete(&descriptor.identifier).await);
    }

    #[tokio::test]
    async fn test_delete_rejects_foreign_paths() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir, 1024);

        assert!(!store.delete("../Cargo.toml").await);
    }

    #[tokio::test]
    async fn test_oversized_file_never_written() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir, 1024);

        let result = store
            .save_one(UploadCandidate::from_bytes("clip.mp4", vec![0u8; 1025]))
            .await;

        assert!(matches!(
            result,
            Err(StoreError::Validation(ValidationError::FileTooLarge { size: 1025, max: 1024 }))
        ));
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_oversized_stream_never_written() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir, 1024);

        let candidate =
            UploadCandidate::streaming("clip.webm", None, Cursor::new(vec![0u8; 4096]));
        let result = store.save_one(candidate).await;

        assert!(matches!(
            result,
            Err(StoreError::Validation(ValidationError::FileTooLarge { .. }))
        ));
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_malformed_image_never_written() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir, 1024);

        let result = store
            .save_one(UploadCandidate::from_bytes("broken.jpg", b"not a jpeg".to_vec()))
            .await;

        assert!(matches!(
            result,
            Err(StoreError::Processing(ProcessingError::Decode(_)))
        ));
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_batch_saves_all_and_skips_unnamed() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir, 10 * 1024 * 1024);

        let mut unnamed = UploadCandidate::from_bytes("", vec![1u8; 4]);
        unnamed.filename = None;

        let descriptors = store
            .save_batch(vec![
                UploadCandidate::from_bytes("one.png", png(30, 30)),
                unnamed,
                UploadCandidate::from_bytes("two.mov", vec![5u8; 64]),
                UploadCandidate::from_bytes("", vec![1u8; 4]),
            ])
            .await
            .unwrap();

        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].original_filename, "one.png");
        assert_eq!(descriptors[1].original_filename, "two.mov");
        assert_eq!(file_count(dir.path()), 2);
    }

    #[tokio::test]
    async fn test_batch_rolls_back_on_invalid_file() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir, 10 * 1024 * 1024);

        let result = store
            .save_batch(vec![
                UploadCandidate::from_bytes("a.png", png(20, 20)),
                UploadCandidate::from_bytes("b.jpg", png(20, 40)),
                UploadCandidate::from_bytes("c.mp4", vec![9u8; 16]),
                UploadCandidate::from_bytes("d.exe", vec![0u8; 16]),
            ])
            .await;

        assert!(matches!(
            result,
            Err(StoreError::Validation(ValidationError::UnsupportedType { .. }))
        ));
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_batch_over_limit_rejected_without_writes() {
        let mut blobs = MockBlobStore::new();
        blobs.expect_write().never();
        blobs.expect_exists().never();
        let store = MediaStore::new(Arc::new(blobs), &config(1024));

        let candidates = (0..6)
            .map(|i| UploadCandidate::from_bytes(format!("{i}.mp4"), vec![0u8; 8]))
            .collect();

        let result = store.save_batch(candidates).await;
        assert!(matches!(
            result,
            Err(StoreError::TooManyFiles { count: 6, max: 5 })
        ));
    }

    #[tokio::test]
    async fn test_write_failure_cleans_up_and_rolls_back() {
        let mut blobs = MockBlobStore::new();
        blobs.expect_exists().returning(|_| Ok(false));

        let mut writes = 0;
        blobs.expect_write().times(2).returning(move |_, _| {
            writes += 1;
            if writes == 1 {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            }
        });
        // One cleanup for the failed write, one rollback for the first file
        blobs.expect_delete().times(2).returning(|_| Ok(true));

        let store = MediaStore::new(Arc::new(blobs), &config(1024));
        let result = store
            .save_batch(vec![
                UploadCandidate::from_bytes("a.mp4", vec![1u8; 8]),
                UploadCandidate::from_bytes("b.mp4", vec![2u8; 8]),
                UploadCandidate::from_bytes("c.mp4", vec![3u8; 8]),
            ])
            .await;

        assert!(matches!(result, Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_identifier_collision_draws_again() {
        let mut blobs = MockBlobStore::new();
        let mut checks = 0;
        blobs.expect_exists().times(2).returning(move |_| {
            checks += 1;
            Ok(checks == 1)
        });
        blobs.expect_write().times(1).returning(|_, _| Ok(()));

        let store = MediaStore::new(Arc::new(blobs), &config(1024));
        let descriptor = store
            .save_one(UploadCandidate::from_bytes("a.ogg", vec![1u8; 8]))
            .await
            .unwrap();

        assert!(descriptor.identifier.ends_with(".ogg"));
    }

    #[test]
    fn test_descriptor_json_shape() {
        let descriptor = MediaDescriptor {
            identifier: "abc.jpg".to_string(),
            original_filename: "photo.png".to_string(),
            kind: MediaKind::Image,
            url: "/static/recipe_steps/abc.jpg".to_string(),
            size: 1234,
        };

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "filename": "abc.jpg",
                "original_filename": "photo.png",
                "type": "image",
                "url": "/static/recipe_steps/abc.jpg",
                "size": 1234
            })
        );
    }
}
