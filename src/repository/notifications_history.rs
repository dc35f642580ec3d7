use sqlx::SqlitePool;

use crate::db::store::{Store, Value};
use crate::error::Result;
use crate::models::{now_millis, NotificationsHistory};

/// Record of release notifications already sent
#[derive(Debug, Clone)]
pub struct NotificationsHistoryRepository {
    store: Store<NotificationsHistory>,
}

impl NotificationsHistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            store: Store::new(pool),
        }
    }

    pub async fn record(&self, media_item_id: i64, episode_id: Option<i64>) -> Result<i64> {
        self.store
            .create(&NotificationsHistory {
                id: None,
                media_item_id,
                episode_id,
                send_date: now_millis(),
            })
            .await
    }

    pub async fn was_sent(&self, media_item_id: i64, episode_id: Option<i64>) -> Result<bool> {
        let count = self
            .store
            .count(vec![
                ("media_item_id", media_item_id.into()),
                ("episode_id", Value::from(episode_id)),
            ])
            .await?;
        Ok(count > 0)
    }
}
