//! Cached reads of reference data and invalidate-on-write mutations.
//!
//! Reads try the cache first, fall back to the reference store on a miss and
//! populate the cache with what they fetched. Mutations go to the store and,
//! once it has committed, drop the cached collection. Nothing is written
//! through to the cache on mutation.

use crate::cache::TtlCache;
use crate::config::CacheConfig;
use crate::reference_store::{Category, RecipeStats, ReferenceError, ReferenceStore, Tag};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CATEGORIES_KEY: &str = "categories";
pub const TAGS_KEY: &str = "tags";

/// Cache key for the rating summary of one recipe
pub fn recipe_stats_key(recipe_id: i64) -> String {
    format!("recipe_stats:{recipe_id}")
}

/// Values held in the reference cache
#[derive(Debug, Clone)]
pub enum CachedValue {
    Categories(Arc<Vec<Category>>),
    Tags(Arc<Vec<Tag>>),
    RecipeStats(RecipeStats),
}

pub type ReferenceCache = TtlCache<CachedValue>;

/// Reference data with a read-through cache in front of the store
pub struct ReferenceData {
    cache: Arc<ReferenceCache>,
    store: Arc<dyn ReferenceStore>,
    reference_ttl: Duration,
    stats_ttl: Duration,
}

impl ReferenceData {
    pub fn new(
        cache: Arc<ReferenceCache>,
        store: Arc<dyn ReferenceStore>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            cache,
            store,
            reference_ttl: config.reference_ttl(),
            stats_ttl: config.recipe_stats_ttl(),
        }
    }

    pub async fn categories(&self) -> Result<Arc<Vec<Category>>, ReferenceError> {
        if let Some(CachedValue::Categories(categories)) =
            self.cached(CATEGORIES_KEY, self.reference_ttl)
        {
            return Ok(categories);
        }

        let categories = Arc::new(self.store.list_categories().await?);
        self.populate(CATEGORIES_KEY, CachedValue::Categories(categories.clone()));
        Ok(categories)
    }

    pub async fn tags(&self) -> Result<Arc<Vec<Tag>>, ReferenceError> {
        if let Some(CachedValue::Tags(tags)) = self.cached(TAGS_KEY, self.reference_ttl) {
            return Ok(tags);
        }

        let tags = Arc::new(self.store.list_tags().await?);
        self.populate(TAGS_KEY, CachedValue::Tags(tags.clone()));
        Ok(tags)
    }

    pub async fn recipe_stats(&self, recipe_id: i64) -> Result<RecipeStats, ReferenceError> {
        let key = recipe_stats_key(recipe_id);
        if let Some(CachedValue::RecipeStats(stats)) = self.cached(&key, self.stats_ttl) {
            return Ok(stats);
        }

        let stats = self.store.recipe_stats(recipe_id).await?;
        self.populate(&key, CachedValue::RecipeStats(stats.clone()));
        Ok(stats)
    }

    pub async fn create_category(&self, name: &str) -> Result<Category, ReferenceError> {
        let category = self.store.create_category(name).await?;
        self.invalidate_categories_cache();
        info!(id = category.id, name = %category.name, "Category created");
        Ok(category)
    }

    pub async fn update_category(&self, id: i64, name: &str) -> Result<Category, ReferenceError> {
        let category = self.store.update_category(id, name).await?;
        self.invalidate_categories_cache();
        info!(id, name = %category.name, "Category updated");
        Ok(category)
    }

    pub async fn delete_category(&self, id: i64) -> Result<(), ReferenceError> {
        self.store.delete_category(id).await?;
        self.invalidate_categories_cache();
        info!(id, "Category deleted");
        Ok(())
    }

    pub async fn create_tag(&self, name: &str) -> Result<Tag, ReferenceError> {
        let tag = self.store.create_tag(name).await?;
        self.invalidate_tags_cache();
        info!(id = tag.id, name = %tag.name, "Tag created");
        Ok(tag)
    }

    pub async fn update_tag(&self, id: i64, name: &str) -> Result<Tag, ReferenceError> {
        let tag = self.store.update_tag(id, name).await?;
        self.invalidate_tags_cache();
        info!(id, name = %tag.name, "Tag updated");
        Ok(tag)
    }

    pub async fn delete_tag(&self, id: i64) -> Result<(), ReferenceError> {
        self.store.delete_tag(id).await?;
        self.invalidate_tags_cache();
        info!(id, "Tag deleted");
        Ok(())
    }

    pub fn invalidate_categories_cache(&self) {
        self.invalidate(CATEGORIES_KEY);
    }

    pub fn invalidate_tags_cache(&self) {
        self.invalidate(TAGS_KEY);
    }

    pub async fn ping(&self) -> Result<(), ReferenceError> {
        self.store.ping().await
    }

    fn cached(&self, key: &str, ttl: Duration) -> Option<CachedValue> {
        match self.cache.get(key, ttl) {
            Ok(Some(value)) => {
                metrics::counter!("cache.hits").increment(1);
                debug!(key = %key, "Cache hit");
                Some(value)
            }
            Ok(None) => {
                metrics::counter!("cache.misses").increment(1);
                debug!(key = %key, "Cache miss");
                None
            }
            Err(e) => {
                metrics::counter!("cache.misses").increment(1);
                warn!(key = %key, error = %e, "Cache read failed, falling back to store");
                None
            }
        }
    }

    fn populate(&self, key: &str, value: CachedValue) {
        if let Err(e) = self.cache.set(key, value) {
            warn!(key = %key, error = %e, "Failed to populate cache");
        }
    }

    fn invalidate(&self, key: &str) {
        match self.cache.delete(key) {
            Ok(_) => {
                metrics::counter!("cache.invalidations").increment(1);
                debug!(key = %key, "Cache invalidated");
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to invalidate cache"),
        }
    }
}
