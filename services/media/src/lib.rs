//! Recipe Media Service
//!
//! Media ingestion and reference-data caching for the recipe backend. Step
//! photos and videos are validated, normalized and written to local storage
//! in all-or-nothing batches; categories, tags and rating summaries are
//! served through an in-process TTL cache that is invalidated on every write.
//!
//! ## Features
//!
//! - **Upload Validation**: Filename, extension and size checks before any
//!   byte is decoded or written
//! - **Image Normalization**: Every image is flattened onto white, fitted to
//!   the target box and re-encoded as JPEG
//! - **Atomic Batches**: A failing file rolls back every file already saved
//!   for its batch
//! - **TTL Cache**: Per-read expiry with invalidate-on-write for reference data
//!
//! ## Architecture
//!
//! ```text
//!  multipart upload           media root                PostgreSQL
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Validation   │           │ recipe_steps/│          │ categories   │
//! │ Policy       │           │   {uuid}.jpg │          │ tags         │
//! └──────────────┘           │   {uuid}.mp4 │          │ ratings      │
//!        │                   └──────────────┘          └──────────────┘
//!        ▼                          ▲                         ▲
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Image        │──────────▶│ Media Store  │          │ Reference    │
//! │ Normalizer   │           │ (Blob Store) │          │ Data         │
//! └──────────────┘           └──────────────┘          └──────────────┘
//!                                                             │
//!                                                             ▼
//!                                                      ┌──────────────┐
//!                                                      │ TTL Cache    │
//!                                                      └──────────────┘
//! ```

pub mod api;
pub mod blob_store;
pub mod cache;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod media_store;
pub mod normalizer;
pub mod reference_store;
pub mod validation;

pub use api::{create_router, start_api_server, AppState};
pub use blob_store::{BlobStore, LocalBlobStore};
pub use cache::{CacheError, Clock, SystemClock, TtlCache};
pub use config::Config;
pub use error::{ApiError, ErrorResponse};
pub use invalidation::{CachedValue, ReferenceCache, ReferenceData};
pub use media_store::{MediaDescriptor, MediaStore, StoreError};
pub use normalizer::{ImageNormalizer, ProcessingError};
pub use reference_store::{
    Category, PgReferenceStore, RecipeStats, ReferenceError, ReferenceStore, Tag,
};
pub use validation::{
    MediaKind, UploadBody, UploadCandidate, ValidationError, ValidationPolicy,
};
