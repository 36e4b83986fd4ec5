use crate::config::DatabaseConfig;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Recipe category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Recipe tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Rating summary for one recipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RecipeStats {
    pub recipe_id: i64,
    /// Mean score, 0 when the recipe has no ratings
    pub average_rating: f64,
    pub rating_count: i64,
}

/// Errors from the reference-data system of record.
#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("{0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ReferenceError {
    fn from_write(err: sqlx::Error, entity: &'static str, name: &str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                ReferenceError::Conflict(format!("{entity} '{name}' already exists"))
            }
            _ => ReferenceError::Database(err),
        }
    }
}

/// System of record for categories, tags and recipe ratings.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn list_categories(&self) -> Result<Vec<Category>, ReferenceError>;
    async fn create_category(&self, name: &str) -> Result<Category, ReferenceError>;
    async fn update_category(&self, id: i64, name: &str) -> Result<Category, ReferenceError>;
    async fn delete_category(&self, id: i64) -> Result<(), ReferenceError>;

    async fn list_tags(&self) -> Result<Vec<Tag>, ReferenceError>;
    async fn create_tag(&self, name: &str) -> Result<Tag, ReferenceError>;
    async fn update_tag(&self, id: i64, name: &str) -> Result<Tag, ReferenceError>;
    async fn delete_tag(&self, id: i64) -> Result<(), ReferenceError>;

    async fn recipe_stats(&self, recipe_id: i64) -> Result<RecipeStats, ReferenceError>;

    /// Cheap round trip used by readiness checks
    async fn ping(&self) -> Result<(), ReferenceError>;
}

/// PostgreSQL-backed reference store
pub struct PgReferenceStore {
    pool: PgPool,
}

impl PgReferenceStore {
    /// Create a new store with its own connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl ReferenceStore for PgReferenceStore {
    async fn list_categories(&self) -> Result<Vec<Category>, ReferenceError> {
        let categories = sqlx::query_as::<_, Category>(
            "SELECT id, name, created_at FROM categories ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        debug!(count = categories.len(), "Loaded categories");
        Ok(categories)
    }

    #[instrument(skip(self))]
    async fn create_category(&self, name: &str) -> Result<Category, ReferenceError> {
        sqlx::query_as::<_, Category>(
            "INSERT INTO categories (name) VALUES ($1) RETURNING id, name, created_at",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ReferenceError::from_write(e, "Category", name))
    }

    #[instrument(skip(self))]
    async fn update_category(&self, id: i64, name: &str) -> Result<Category, ReferenceError> {
        sqlx::query_as::<_, Category>(
            "UPDATE categories SET name = $2 WHERE id = $1 RETURNING id, name, created_at",
        )
        .bind(id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReferenceError::from_write(e, "Category", name))?
        .ok_or(ReferenceError::NotFound { entity: "Category", id })
    }

    #[instrument(skip(self))]
    async fn delete_category(&self, id: i64) -> Result<(), ReferenceError> {
        let result = sqlx::query("DELETE FROM categories WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ReferenceError::NotFound { entity: "Category", id });
        }
        Ok(())
    }

    async fn list_tags(&self) -> Result<Vec<Tag>, ReferenceError> {
        let tags = sqlx::query_as::<_, Tag>("SELECT id, name, created_at FROM tags ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        debug!(count = tags.len(), "Loaded tags");
        Ok(tags)
    }

    #[instrument(skip(self))]
    async fn create_tag(&self, name: &str) -> Result<Tag, ReferenceError> {
        sqlx::query_as::<_, Tag>("INSERT INTO tags (name) VALUES ($1) RETURNING id, name, created_at")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ReferenceError::from_write(e, "Tag", name))
    }

    #[instrument(skip(self))]
    async fn update_tag(&self, id: i64, name: &str) -> Result<Tag, ReferenceError> {
        sqlx::query_as::<_, Tag>(
            "UPDATE tags SET name = $2 WHERE id = $1 RETURNING id, name, created_at",
        )
        .bind(id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReferenceError::from_write(e, "Tag", name))?
        .ok_or(ReferenceError::NotFound { entity: "Tag", id })
    }

    #[instrument(skip(self))]
    async fn delete_tag(&self, id: i64) -> Result<(), ReferenceError> {
        let result = sqlx::query("DELETE FROM tags WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ReferenceError::NotFound { entity: "Tag", id });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recipe_stats(&self, recipe_id: i64) -> Result<RecipeStats, ReferenceError> {
        let stats = sqlx::query_as::<_, RecipeStats>(
            r#"
            SELECT
                $1::BIGINT AS recipe_id,
                COALESCE(AVG(score), 0)::DOUBLE PRECISION AS average_rating,
                COUNT(*) AS rating_count
            FROM ratings
            WHERE recipe_id = $1
            "#,
        )
        .bind(recipe_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    async fn ping(&self) -> Result<(), ReferenceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Reference store held in memory that counts list fetches
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct InMemoryReferenceStore {
        categories: Mutex<Vec<Category>>,
        tags: Mutex<Vec<Tag>>,
        ratings: Mutex<HashMap<i64, Vec<i32>>>,
        next_id: AtomicUsize,
        pub(crate) category_fetches: AtomicUsize,
        pub(crate) tag_fetches: AtomicUsize,
        pub(crate) stats_fetches: AtomicUsize,
    }

    impl InMemoryReferenceStore {
        pub(crate) fn rate(&self, recipe_id: i64, score: i32) {
            self.ratings
                .lock()
                .unwrap()
                .entry(recipe_id)
                .or_default()
                .push(score);
        }

        fn next_id(&self) -> i64 {
            self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1
        }
    }

    #[async_trait]
    impl ReferenceStore for InMemoryReferenceStore {
        async fn list_categories(&self) -> Result<Vec<Category>, ReferenceError> {
            self.category_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.categories.lock().unwrap().clone())
        }

        async fn create_category(&self, name: &str) -> Result<Category, ReferenceError> {
            let mut categories = self.categories.lock().unwrap();
            if categories.iter().any(|c| c.name == name) {
                return Err(ReferenceError::Conflict(format!("Category '{name}' already exists")));
            }
            let category = Category {
                id: self.next_id(),
                name: name.to_string(),
                created_at: Utc::now(),
            };
            categories.push(category.clone());
            Ok(category)
        }

        async fn update_category(&self, id: i64, name: &str) -> Result<Category, ReferenceError> {
            let mut categories = self.categories.lock().unwrap();
            let category = categories
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or(ReferenceError::NotFound { entity: "Category", id })?;
            category.name = name.to_string();
            Ok(category.clone())
        }

        async fn delete_category(&self, id: i64) -> Result<(), ReferenceError> {
            let mut categories = self.categories.lock().unwrap();
            let before = categories.len();
            categories.retain(|c| c.id != id);
            if categories.len() == before {
                return Err(ReferenceError::NotFound { entity: "Category", id });
            }
            Ok(())
        }

        async fn list_tags(&self) -> Result<Vec<Tag>, ReferenceError> {
            self.tag_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.tags.lock().unwrap().clone())
        }

        async fn create_tag(&self, name: &str) -> Result<Tag, ReferenceError> {
            let tag = Tag {
                id: self.next_id(),
                name: name.to_string(),
                created_at: Utc::now(),
            };
            self.tags.lock().unwrap().push(tag.clone());
            Ok(tag)
        }

        async fn update_tag(&self, id: i64, name: &str) -> Result<Tag, ReferenceError> {
            let mut tags = self.tags.lock().unwrap();
            let tag = tags
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(ReferenceError::NotFound { entity: "Tag", id })?;
            tag.name = name.to_string();
            Ok(tag.clone())
        }

        async fn delete_tag(&self, id: i64) -> Result<(), ReferenceError> {
            let mut tags = self.tags.lock().unwrap();
            let before = tags.len();
            tags.retain(|t| t.id != id);
            if tags.len() == before {
                return Err(ReferenceError::NotFound { entity: "Tag", id });
            }
            Ok(())
        }

        async fn recipe_stats(&self, recipe_id: i64) -> Result<RecipeStats, ReferenceError> {
            self.stats_fetches.fetch_add(1, Ordering::SeqCst);
            let ratings = self.ratings.lock().unwrap();
            let scores = ratings.get(&recipe_id).map(Vec::as_slice).unwrap_or_default();
            let average_rating = if scores.is_empty() {
                0.0
            } else {
                scores.iter().map(|&s| f64::from(s)).sum::<f64>() / scores.len() as f64
            };
            Ok(RecipeStats {
                recipe_id,
                average_rating,
                rating_count: scores.len() as i64,
            })
        }

        async fn ping(&self) -> Result<(), ReferenceError> {
            Ok(())
        }
    }
}
