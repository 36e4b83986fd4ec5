use crate::config::{ApiConfig, MediaConfig};
use crate::error::ApiError;
use crate::invalidation::{ReferenceCache, ReferenceData};
use crate::media_store::{MediaDescriptor, MediaStore, StoreError};
use crate::reference_store::{Category, RecipeStats, Tag};
use crate::validation::{UploadBody, UploadCandidate};
use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, State},
    http::{header, request::Parts, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Multipart field carrying upload files
const FILES_FIELD: &str = "files";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub media: Arc<MediaStore>,
    pub reference: Arc<ReferenceData>,
    pub cache: Arc<ReferenceCache>,
    pub admin_token: Option<Arc<str>>,
}

/// Body of category and tag mutations
#[derive(Debug, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

impl NameRequest {
    fn validated(&self) -> Result<&str, ApiError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ApiError::InvalidInput("Name must not be empty".to_string()));
        }
        Ok(name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheStatsResponse {
    pub entries: usize,
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheClearResponse {
    pub cleared: usize,
}

/// Proof that the request carried the admin bearer token
pub struct AdminAccess;

#[async_trait]
impl FromRequestParts<AppState> for AdminAccess {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.admin_token.as_deref() else {
            return Err(ApiError::Forbidden);
        };

        let provided = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .unwrap_or_default();

        if timing_safe_eq(provided, expected) {
            Ok(AdminAccess)
        } else {
            warn!(path = %parts.uri.path(), "Rejected admin request");
            Err(ApiError::Unauthorized)
        }
    }
}

/// Compare two strings without short-circuiting on the first mismatch
fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}

/// Create the API router
pub fn create_router(state: AppState, api: &ApiConfig, media: &MediaConfig) -> Router {
    let cors = if api.cors_enabled {
        if api.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = api
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let static_prefix = format!("/{}", media.url_prefix.trim_matches('/'));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/media/recipe-steps", post(upload_step_media))
        .route("/api/media/recipe-steps/:filename", delete(delete_step_media))
        .route("/api/categories", get(list_categories).post(create_category))
        .route("/api/categories/:id", put(update_category).delete(delete_category))
        .route("/api/tags", get(list_tags).post(create_tag))
        .route("/api/tags/:id", put(update_tag).delete(delete_tag))
        .route("/api/recipes/:id/stats", get(recipe_stats))
        .route("/api/monitoring/cache/stats", get(cache_stats))
        .route("/api/monitoring/cache/clear", post(clear_cache))
        .nest_service(&static_prefix, ServeDir::new(&media.root))
        .layer(DefaultBodyLimit::max(media.upload_body_limit()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "recipe-media"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.reference.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Upload media for a recipe step.
///
/// File parts are counted as they arrive so an oversized batch is refused
/// before the body limit is reached.
#[instrument(skip(state, multipart))]
async fn upload_step_media(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Vec<MediaDescriptor>>, ApiError> {
    let max = state.media.max_files_per_batch();
    let mut candidates = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILES_FIELD) {
            continue;
        }

        if candidates.len() == max {
            metrics::counter!("media.files.rejected").increment(1);
            warn!(max, "Upload refused, too many files");
            return Err(StoreError::TooManyFiles {
                count: max + 1,
                max,
            }
            .into());
        }

        let filename = field.file_name().map(str::to_string);
        let bytes = field.bytes().await?;

        candidates.push(UploadCandidate {
            filename,
            declared_size: None,
            body: UploadBody::Bytes(bytes),
        });
    }

    let descriptors = state.media.save_batch(candidates).await?;
    info!(count = descriptors.len(), "Step media uploaded");

    Ok(Json(descriptors))
}

/// Delete one stored step media file
async fn delete_step_media(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Json<DeleteResponse> {
    let deleted = state.media.delete(&filename).await;
    Json(DeleteResponse { deleted })
}

async fn list_categories(State(state): State<AppState>) -> Result<Json<Vec<Category>>, ApiError> {
    let categories = state.reference.categories().await?;
    Ok(Json(categories.to_vec()))
}

async fn create_category(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Json(request): Json<NameRequest>,
) -> Result<(StatusCode, Json<Category>), ApiError> {
    let category = state.reference.create_category(request.validated()?).await?;
    Ok((StatusCode::CREATED, Json(category)))
}

async fn update_category(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Path(id): Path<i64>,
    Json(request): Json<NameRequest>,
) -> Result<Json<Category>, ApiError> {
    let category = state.reference.update_category(id, request.validated()?).await?;
    Ok(Json(category))
}

async fn delete_category(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.reference.delete_category(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_tags(State(state): State<AppState>) -> Result<Json<Vec<Tag>>, ApiError> {
    let tags = state.reference.tags().await?;
    Ok(Json(tags.to_vec()))
}

async fn create_tag(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Json(request): Json<NameRequest>,
) -> Result<(StatusCode, Json<Tag>), ApiError> {
    let tag = state.reference.create_tag(request.validated()?).await?;
    Ok((StatusCode::CREATED, Json(tag)))
}

async fn update_tag(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Path(id): Path<i64>,
    Json(request): Json<NameRequest>,
) -> Result<Json<Tag>, ApiError> {
    let tag = state.reference.update_tag(id, request.validated()?).await?;
    Ok(Json(tag))
}

async fn delete_tag(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.reference.delete_tag(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn recipe_stats(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RecipeStats>, ApiError> {
    Ok(Json(state.reference.recipe_stats(id).await?))
}

async fn cache_stats(
    State(state): State<AppState>,
    _admin: AdminAccess,
) -> Result<Json<CacheStatsResponse>, ApiError> {
    let keys = state.cache.keys()?;
    Ok(Json(CacheStatsResponse {
        entries: keys.len(),
        keys,
    }))
}

async fn clear_cache(
    State(state): State<AppState>,
    _admin: AdminAccess,
) -> Result<Json<CacheClearResponse>, ApiError> {
    let cleared = state.cache.clear()?;
    info!(cleared, "Cache cleared by admin");
    Ok(Json(CacheClearResponse { cleared }))
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    api: &ApiConfig,
    media: &MediaConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, api, media);
    let addr = format!("{}:{}", api.host, api.port);

    info!(address = %addr, "Starting media API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
