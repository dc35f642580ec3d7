// Image reference allocation for posters and backdrops.
// Only references live in entity rows; fetching and storing the bytes happens elsewhere.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Poster,
    Backdrop,
}

impl ImageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::Poster => "poster",
            ImageKind::Backdrop => "backdrop",
        }
    }
}

/// Opaque handle to an allocated image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub id: String,
}

impl ImageRef {
    pub fn url(&self) -> String {
        format!("/img/{}", self.id)
    }

    pub fn small_url(&self) -> String {
        format!("/img/{}?size=small", self.id)
    }
}

#[async_trait]
pub trait ImageAllocator: Send + Sync {
    async fn allocate(
        &self,
        media_item_id: i64,
        season_id: Option<i64>,
        kind: ImageKind,
    ) -> Result<ImageRef>;
}

/// Records allocations in the `image` table
#[derive(Debug, Clone)]
pub struct SqliteImageStore {
    pool: SqlitePool,
}

impl SqliteImageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImageAllocator for SqliteImageStore {
    async fn allocate(
        &self,
        media_item_id: i64,
        season_id: Option<i64>,
        kind: ImageKind,
    ) -> Result<ImageRef> {
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO image (id, media_item_id, season_id, image_type) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(media_item_id)
        .bind(season_id)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Allocated {} image {} for media item {}",
            kind.as_str(),
            id,
            media_item_id
        );

        Ok(ImageRef { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[test]
    fn test_image_urls() {
        let image = ImageRef {
            id: "abc".to_string(),
        };
        assert_eq!(image.url(), "/img/abc");
        assert_eq!(image.small_url(), "/img/abc?size=small");
    }

    #[tokio::test]
    async fn test_allocate_records_row() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO media_item (id, media_type, source, title) VALUES (5, 'movie', 'user', 'Heat')")
            .execute(&pool)
            .await
            .unwrap();

        let store = SqliteImageStore::new(pool.clone());
        let first = store.allocate(5, None, ImageKind::Poster).await.unwrap();
        let second = store.allocate(5, None, ImageKind::Backdrop).await.unwrap();
        assert_ne!(first, second);

        let row: (i64, Option<i64>, String) =
            sqlx::query_as("SELECT media_item_id, season_id, image_type FROM image WHERE id = ?")
                .bind(&first.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(row, (5, None, "poster".to_string()));
    }
}
