//! Upload validation.
//!
//! Every candidate passes through [`ValidationPolicy::validate`] before any
//! decoding or disk access happens. The gate only reads: the one side effect
//! it may have is seeking a seekable body to learn its length, and the
//! original position is restored before returning.

use crate::config::MediaConfig;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Client-caused upload rejections. Never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("File must have a name")]
    MissingFilename,

    #[error("Unsupported file type: {extension}. Allowed: {allowed}")]
    UnsupportedType { extension: String, allowed: String },

    #[error("File too large. Maximum size: {:.1}MB", megabytes(.max))]
    FileTooLarge { size: u64, max: u64 },
}

fn megabytes(bytes: &u64) -> f64 {
    *bytes as f64 / 1024.0 / 1024.0
}

/// A body that can report its length by seeking.
pub trait SeekRead: Read + Seek + Send {}

impl<T: Read + Seek + Send> SeekRead for T {}

/// Raw bytes of an upload.
pub enum UploadBody {
    /// Fully buffered body, e.g. a multipart field
    Bytes(Bytes),
    /// Spooled or file-backed body whose length can be found by seeking
    Seekable(Box<dyn SeekRead>),
    /// Forward-only stream with no cheap way to learn its length
    Stream(Box<dyn Read + Send>),
}

impl UploadBody {
    /// Remaining length of the body, if it can be learned without reading it.
    ///
    /// Seekable bodies are left at the position they started from.
    pub fn known_len(&mut self) -> io::Result<Option<u64>> {
        match self {
            UploadBody::Bytes(bytes) => Ok(Some(bytes.len() as u64)),
            UploadBody::Seekable(reader) => {
                let start = reader.stream_position()?;
                let end = reader.seek(SeekFrom::End(0))?;
                reader.seek(SeekFrom::Start(start))?;
                Ok(Some(end.saturating_sub(start)))
            }
            UploadBody::Stream(_) => Ok(None),
        }
    }

    /// Read the whole body, failing with `FileTooLarge` as soon as more than
    /// `max` bytes have arrived.
    pub fn read_bounded(self, max: u64) -> Result<Bytes, BoundedReadError> {
        let reader: Box<dyn Read + Send> = match self {
            UploadBody::Bytes(bytes) => {
                let size = bytes.len() as u64;
                if size > max {
                    return Err(ValidationError::FileTooLarge { size, max }.into());
                }
                return Ok(bytes);
            }
            UploadBody::Seekable(reader) => Box::new(reader),
            UploadBody::Stream(reader) => reader,
        };

        let mut buf = Vec::new();
        reader.take(max.saturating_add(1)).read_to_end(&mut buf)?;

        let size = buf.len() as u64;
        if size > max {
            return Err(ValidationError::FileTooLarge { size, max }.into());
        }

        Ok(Bytes::from(buf))
    }
}

impl fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadBody::Bytes(bytes) => write!(f, "UploadBody::Bytes({} bytes)", bytes.len()),
            UploadBody::Seekable(_) => f.write_str("UploadBody::Seekable"),
            UploadBody::Stream(_) => f.write_str("UploadBody::Stream"),
        }
    }
}

/// Failure while draining an upload body.
#[derive(Debug, Error)]
pub enum BoundedReadError {
    #[error(transparent)]
    Rejected(#[from] ValidationError),

    #[error("Failed to read upload: {0}")]
    Io(#[from] io::Error),
}

/// An unvalidated upload. Lives for one request.
#[derive(Debug)]
pub struct UploadCandidate {
    /// Filename as sent by the client
    pub filename: Option<String>,
    /// Size announced by the client, if any
    pub declared_size: Option<u64>,
    /// Upload content
    pub body: UploadBody,
}

impl UploadCandidate {
    /// Candidate backed by an in-memory buffer
    pub fn from_bytes(filename: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            filename: Some(filename.into()),
            declared_size: None,
            body: UploadBody::Bytes(bytes.into()),
        }
    }

    /// Candidate backed by a seekable reader
    pub fn seekable(filename: impl Into<String>, reader: impl SeekRead + 'static) -> Self {
        Self {
            filename: Some(filename.into()),
            declared_size: None,
            body: UploadBody::Seekable(Box::new(reader)),
        }
    }

    /// Candidate backed by a forward-only stream
    pub fn streaming(
        filename: impl Into<String>,
        declared_size: Option<u64>,
        reader: impl Read + Send + 'static,
    ) -> Self {
        Self {
            filename: Some(filename.into()),
            declared_size,
            body: UploadBody::Stream(Box::new(reader)),
        }
    }

    /// True when the client sent no usable filename
    pub fn is_unnamed(&self) -> bool {
        self.filename.as_deref().map_or(true, str::is_empty)
    }
}

/// Kind of stored media, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// Type and size policy applied to every candidate.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    max_file_size: u64,
    image_extensions: Vec<String>,
    video_extensions: Vec<String>,
}

impl ValidationPolicy {
    pub fn new(
        max_file_size: u64,
        image_extensions: Vec<String>,
        video_extensions: Vec<String>,
    ) -> Self {
        let normalize = |exts: Vec<String>| -> Vec<String> {
            exts.into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect()
        };

        Self {
            max_file_size,
            image_extensions: normalize(image_extensions),
            video_extensions: normalize(video_extensions),
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(
            config.max_file_size_bytes,
            config.allowed_image_extensions.clone(),
            config.allowed_video_extensions.clone(),
        )
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Check name, type and size of a candidate.
    ///
    /// The size check uses the real body length when it is cheap to learn and
    /// the declared size otherwise. Forward-only streams without a declared
    /// size pass this check; `read_bounded` enforces the limit for them while
    /// the body is drained.
    pub fn validate(&self, candidate: &mut UploadCandidate) -> Result<(), ValidationError> {
        let filename = match candidate.filename.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => return Err(ValidationError::MissingFilename),
        };

        self.classify(filename)?;

        let size = match candidate.body.known_len() {
            Ok(Some(size)) => Some(size),
            Ok(None) => candidate.declared_size,
            Err(e) => {
                debug!(error = %e, filename = %filename, "Could not determine upload size");
                candidate.declared_size
            }
        };

        if let Some(size) = size {
            if size > self.max_file_size {
                return Err(ValidationError::FileTooLarge {
                    size,
                    max: self.max_file_size,
                });
            }
        }

        Ok(())
    }

    /// Classify a filename by its extension, case-insensitively.
    pub fn classify(&self, filename: &str) -> Result<MediaKind, ValidationError> {
        let extension = extension_of(filename).unwrap_or_default();

        if self.image_extensions.contains(&extension) {
            Ok(MediaKind::Image)
        } else if self.video_extensions.contains(&extension) {
            Ok(MediaKind::Video)
        } else {
            Err(ValidationError::UnsupportedType {
                extension: if extension.is_empty() {
                    "(none)".to_string()
                } else {
                    format!(".{extension}")
                },
                allowed: self.allowed_list(),
            })
        }
    }

    fn allowed_list(&self) -> String {
        self.image_extensions
            .iter()
            .chain(&self.video_extensions)
            .map(|e| format!(".{e}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Lowercased extension of a filename without the leading dot
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}
