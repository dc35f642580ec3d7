// Per-user rows that reference media items by id: seen events, watchlist, ratings.

use sqlx::SqlitePool;

use crate::db::store::{Store, Value};
use crate::error::Result;
use crate::models::{now_millis, Seen, UserRating, Watchlist};

#[derive(Debug, Clone)]
pub struct SeenRepository {
    store: Store<Seen>,
}

impl SeenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            store: Store::new(pool),
        }
    }

    /// Append a viewing; rewatches are separate rows
    pub async fn add(&self, seen: &Seen) -> Result<i64> {
        let id = self.store.create(seen).await?;
        tracing::debug!(
            "User {} saw media item {} (episode {:?})",
            seen.user_id,
            seen.media_item_id,
            seen.episode_id
        );
        Ok(id)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        self.store.delete(id).await
    }

    pub async fn find_for_item(&self, user_id: i64, media_item_id: i64) -> Result<Vec<Seen>> {
        self.store
            .find(vec![
                ("user_id", user_id.into()),
                ("media_item_id", media_item_id.into()),
            ])
            .await
    }
}

#[derive(Debug, Clone)]
pub struct WatchlistRepository {
    store: Store<Watchlist>,
}

impl WatchlistRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            store: Store::new(pool),
        }
    }

    /// Adding an item that is already listed is a no-op
    pub async fn add(&self, user_id: i64, media_item_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO watchlist (user_id, media_item_id, added_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(media_item_id)
        .bind(now_millis())
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Returns whether a row was removed
    pub async fn remove(&self, user_id: i64, media_item_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM watchlist WHERE user_id = ? AND media_item_id = ?")
            .bind(user_id)
            .bind(media_item_id)
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn contains(&self, user_id: i64, media_item_id: i64) -> Result<bool> {
        let count = self
            .store
            .count(vec![
                ("user_id", user_id.into()),
                ("media_item_id", media_item_id.into()),
            ])
            .await?;
        Ok(count > 0)
    }
}

#[derive(Debug, Clone)]
pub struct UserRatingRepository {
    store: Store<UserRating>,
}

impl UserRatingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            store: Store::new(pool),
        }
    }

    /// At most one rating per (user, item, episode): the first write inserts,
    /// later ones overwrite it. A single statement, so concurrent writers
    /// cannot both insert.
    pub async fn set(&self, rating: &UserRating) -> Result<UserRating> {
        let stored = sqlx::query_as::<_, UserRating>(
            r#"
            INSERT INTO user_rating (media_item_id, episode_id, user_id, rating, review, date)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, media_item_id, IFNULL(episode_id, -1)) DO UPDATE SET
                rating = excluded.rating,
                review = excluded.review,
                date = excluded.date
            RETURNING *
            "#,
        )
        .bind(rating.media_item_id)
        .bind(rating.episode_id)
        .bind(rating.user_id)
        .bind(rating.rating)
        .bind(&rating.review)
        .bind(rating.date)
        .fetch_one(self.store.pool())
        .await?;

        tracing::debug!(
            "User {} rated media item {} (episode {:?})",
            stored.user_id,
            stored.media_item_id,
            stored.episode_id
        );
        Ok(stored)
    }

    pub async fn find_one(
        &self,
        user_id: i64,
        media_item_id: i64,
        episode_id: Option<i64>,
    ) -> Result<Option<UserRating>> {
        self.store
            .find_one(vec![
                ("user_id", user_id.into()),
                ("media_item_id", media_item_id.into()),
                ("episode_id", Value::from(episode_id)),
            ])
            .await
    }
}
