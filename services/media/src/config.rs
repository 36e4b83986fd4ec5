use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the media service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Upload, normalization and media storage configuration
    #[serde(default)]
    pub media: MediaConfig,
    /// Reference-data cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Media upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Root directory served under `url_prefix`
    #[serde(default = "default_media_root")]
    pub root: PathBuf,
    /// Subdirectory of `root` holding recipe step media
    #[serde(default = "default_media_subdir")]
    pub subdir: String,
    /// Public URL prefix mapped to `root`
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
    /// Directory for in-progress writes. Must be on the same filesystem as
    /// `root` and outside it. Defaults to a hidden sibling of `root`.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    /// Largest accepted upload in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// Largest number of files accepted in one batch
    #[serde(default = "default_max_files_per_batch")]
    pub max_files_per_batch: usize,
    /// Bounding box width for normalized images
    #[serde(default = "default_target_width")]
    pub target_width: u32,
    /// Bounding box height for normalized images
    #[serde(default = "default_target_height")]
    pub target_height: u32,
    /// JPEG quality (1-100) for normalized images
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Image extensions accepted (lowercase, no dot)
    #[serde(default = "default_image_extensions")]
    pub allowed_image_extensions: Vec<String>,
    /// Video extensions accepted (lowercase, no dot)
    #[serde(default = "default_video_extensions")]
    pub allowed_video_extensions: Vec<String>,
}

/// Reference-data cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL for categories and tags
    #[serde(default = "default_reference_ttl_secs")]
    pub reference_ttl_secs: u64,
    /// TTL for per-recipe rating summaries
    #[serde(default = "default_recipe_stats_ttl_secs")]
    pub recipe_stats_ttl_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Bearer token accepted on admin endpoints. Admin endpoints are
    /// refused outright when unset.
    #[serde(default)]
    pub admin_token: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "recipe-media".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_media_root() -> PathBuf {
    PathBuf::from("media")
}

fn default_media_subdir() -> String {
    "recipe_steps".to_string()
}

fn default_url_prefix() -> String {
    "/static".to_string()
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_max_files_per_batch() -> usize {
    5
}

fn default_target_width() -> u32 {
    800
}

fn default_target_height() -> u32 {
    600
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_video_extensions() -> Vec<String> {
    ["mp4", "webm", "ogg", "mov"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_reference_ttl_secs() -> u64 {
    600 // 10 minutes
}

fn default_recipe_stats_ttl_secs() -> u64 {
    300
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "recipe-media")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/media").required(false))
            .add_source(config::File::with_name("/etc/recipe/media").required(false))
            // Override with environment variables
            // MEDIA__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("MEDIA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl MediaConfig {
    /// Directory the step media files are written to
    pub fn storage_dir(&self) -> PathBuf {
        self.root.join(&self.subdir)
    }

    /// Directory in-progress writes are staged in before being renamed
    /// into `storage_dir`
    pub fn staging_dir(&self) -> PathBuf {
        if let Some(dir) = &self.staging_dir {
            return dir.clone();
        }
        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".to_string());
        self.root.with_file_name(format!(".{name}-staging"))
    }

    /// URL prefix under which stored step media is served
    pub fn public_base_url(&self) -> String {
        format!("{}/{}", self.url_prefix.trim_end_matches('/'), self.subdir)
    }

    /// Request body limit covering a full batch plus multipart framing
    pub fn upload_body_limit(&self) -> usize {
        let files = self.max_files_per_batch.max(1) as u64;
        let limit = self.max_file_size_bytes.saturating_mul(files) + 1024 * 1024;
        usize::try_from(limit).unwrap_or(usize::MAX)
    }
}

impl CacheConfig {
    /// TTL applied when reading categories and tags
    pub fn reference_ttl(&self) -> Duration {
        Duration::from_secs(self.reference_ttl_secs)
    }

    /// TTL applied when reading recipe rating summaries
    pub fn recipe_stats_ttl(&self) -> Duration {
        Duration::from_secs(self.recipe_stats_ttl_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: default_media_root(),
            subdir: default_media_subdir(),
            url_prefix: default_url_prefix(),
            staging_dir: None,
            max_file_size_bytes: default_max_file_size(),
            max_files_per_batch: default_max_files_per_batch(),
            target_width: default_target_width(),
            target_height: default_target_height(),
            jpeg_quality: default_jpeg_quality(),
            allowed_image_extensions: default_image_extensions(),
            allowed_video_extensions: default_video_extensions(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reference_ttl_secs: default_reference_ttl_secs(),
            recipe_stats_ttl_secs: default_recipe_stats_ttl_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            admin_token: None,
        }
    }
}
