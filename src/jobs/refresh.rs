// Background metadata refresh. Each item is refreshed under its lock so two
// refreshes never interleave writes to the same season/episode tree.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::{now_millis, MediaItem, MediaItemTree};
use crate::repository::MediaItemRepository;

/// Source of canonical metadata, already normalized into the stored shape
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Value of `MediaItem::source` for items this provider owns
    fn source(&self) -> &str;

    async fn details(&self, item: &MediaItem) -> anyhow::Result<MediaItemTree>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub skipped_locked: usize,
    pub failed: usize,
}

/// Run `future` while holding the lock on `media_item_id`.
///
/// The future and the unlock run on their own task, so the lock is released
/// even if the future panics (reported as `RefreshAborted`) or the caller stops
/// waiting. A held lock fails fast with `Locked` and the caller should try
/// again on a later run.
pub async fn with_lock<T, F>(repo: &MediaItemRepository, media_item_id: i64, future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    repo.lock(media_item_id).await?;

    let repo = repo.clone();
    let guarded = tokio::spawn(async move {
        let outcome = match tokio::spawn(future).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Refresh of media item {} panicked: {}", media_item_id, e);
                Err(Error::RefreshAborted(media_item_id))
            }
        };

        if let Err(e) = repo.unlock(media_item_id).await {
            tracing::error!("Failed to unlock media item {}: {}", media_item_id, e);
            return outcome.and(Err(e));
        }

        outcome
    });

    match guarded.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Lock guard for media item {} failed: {}", media_item_id, e);
            Err(Error::RefreshAborted(media_item_id))
        }
    }
}

/// Carry stored ids onto freshly fetched data. Seasons match on season number,
/// episodes on (season number, episode number); anything unmatched is new.
pub fn merge_ids(stored: &MediaItemTree, fetched: MediaItemTree) -> MediaItemTree {
    let season_ids: HashMap<i64, Option<i64>> = stored
        .seasons
        .iter()
        .map(|s| (s.season.season_number, s.season.id))
        .collect();
    let episode_ids: HashMap<(i64, i64), Option<i64>> = stored
        .episodes()
        .map(|e| ((e.season_number, e.episode_number), e.id))
        .collect();

    let mut merged = fetched;
    let item = &mut merged.item;
    item.id = stored.item.id;
    item.media_type = stored.item.media_type;
    item.source = stored.item.source.clone();
    item.locked_at = stored.item.locked_at;
    // Allocated image references survive a refresh
    item.poster = stored.item.poster.clone().or(item.poster.take());
    item.poster_small = stored.item.poster_small.clone().or(item.poster_small.take());
    item.backdrop = stored.item.backdrop.clone().or(item.backdrop.take());

    for season in &mut merged.seasons {
        season.season.id = season_ids
            .get(&season.season.season_number)
            .copied()
            .flatten();
        for episode in &mut season.episodes {
            episode.id = episode_ids
                .get(&(episode.season_number, episode.episode_number))
                .copied()
                .flatten();
        }
    }

    merged
}

/// Fetch fresh metadata for one item and write it over the stored tree
pub async fn refresh_item(
    repo: &MediaItemRepository,
    provider: Arc<dyn MetadataProvider>,
    media_item_id: i64,
) -> Result<MediaItemTree> {
    if repo.find_by_id(media_item_id).await?.is_none() {
        return Err(Error::NotFound {
            table: "media_item",
            id: media_item_id,
        });
    }

    let task_repo = repo.clone();
    with_lock(repo, media_item_id, async move {
        let stored = task_repo
            .tree(media_item_id)
            .await?
            .ok_or(Error::NotFound {
                table: "media_item",
                id: media_item_id,
            })?;

        let fetched = provider
            .details(&stored.item)
            .await
            .map_err(|e| Error::Provider(format!("{:#}", e)))?;

        let mut merged = merge_ids(&stored, fetched);
        merged.item.last_time_updated = Some(now_millis());

        let updated = task_repo.update(&merged).await?;
        tracing::info!(
            "Refreshed \"{}\" ({}) from {}",
            updated.item.title,
            media_item_id,
            provider.source()
        );
        Ok(updated)
    })
    .await
}

/// Refresh every tracked item owned by `provider`. Locked items are skipped,
/// other failures are logged, and the run carries on.
pub async fn refresh_all(
    repo: &MediaItemRepository,
    provider: Arc<dyn MetadataProvider>,
) -> Result<RefreshSummary> {
    let items = repo.items_to_possibly_update().await?;
    let mut summary = RefreshSummary::default();

    for item in items.into_iter().filter(|i| i.source == provider.source()) {
        let Some(id) = item.id else { continue };

        match refresh_item(repo, provider.clone(), id).await {
            Ok(_) => summary.refreshed += 1,
            Err(Error::Locked(_)) => {
                tracing::info!("Skipping \"{}\" ({}): refresh already running", item.title, id);
                summary.skipped_locked += 1;
            }
            Err(e) => {
                tracing::error!("Failed to refresh \"{}\" ({}): {}", item.title, id, e);
                summary.failed += 1;
            }
        }
    }

    tracing::info!(
        "Metadata refresh from {}: {} refreshed, {} locked, {} failed",
        provider.source(),
        summary.refreshed,
        summary.skipped_locked,
        summary.failed
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::{MediaType, SeasonTree, TvEpisode, TvSeason};
    use crate::repository::WatchlistRepository;
    use std::time::Duration;

    struct FakeProvider;

    #[async_trait]
    impl MetadataProvider for FakeProvider {
        fn source(&self) -> &str {
            "tmdb"
        }

        async fn details(&self, item: &MediaItem) -> anyhow::Result<MediaItemTree> {
            if item.title == "broken" {
                anyhow::bail!("provider returned 500");
            }
            if item.title == "panics" {
                panic!("provider bug");
            }

            Ok(MediaItemTree::with_seasons(
                MediaItem {
                    overview: Some("fresh".to_string()),
                    ..MediaItem::new(MediaType::Tv, "tmdb", &item.title)
                },
                vec![SeasonTree::new(
                    TvSeason::new(1),
                    vec![
                        TvEpisode::new(1, 1, Some("2001-02-20")),
                        TvEpisode::new(1, 2, Some("2001-02-27")),
                    ],
                )],
            ))
        }
    }

    async fn tracked_show(pool: &sqlx::SqlitePool, repo: &MediaItemRepository, id: i64, title: &str) {
        repo.create(&MediaItemTree::with_seasons(
            MediaItem {
                id: Some(id),
                ..MediaItem::new(MediaType::Tv, "tmdb", title)
            },
            vec![SeasonTree::new(
                TvSeason::new(1),
                vec![TvEpisode::new(1, 1, Some("2001-02-20"))],
            )],
        ))
        .await
        .unwrap();
        WatchlistRepository::new(pool.clone()).add(1, id).await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_keeps_ids_and_adds_new_episode() {
        let pool = test_pool().await;
        let repo = MediaItemRepository::new(pool.clone());
        tracked_show(&pool, &repo, 1, "Show").await;
        let before = repo.tree(1).await.unwrap().unwrap();

        let refreshed = refresh_item(&repo, Arc::new(FakeProvider), 1).await.unwrap();

        assert_eq!(refreshed.item.id, Some(1));
        assert_eq!(refreshed.item.overview.as_deref(), Some("fresh"));
        assert_eq!(refreshed.seasons[0].season.id, before.seasons[0].season.id);
        assert_eq!(
            refreshed.seasons[0].episodes[0].id,
            before.seasons[0].episodes[0].id
        );
        assert!(refreshed.seasons[0].episodes[1].id.is_some());

        let stored = repo.find_by_id(1).await.unwrap().unwrap();
        assert!(stored.locked_at.is_none());
        assert!(stored.last_time_updated >= before.item.last_time_updated);
    }

    #[tokio::test]
    async fn test_failures_release_the_lock() {
        let pool = test_pool().await;
        let repo = MediaItemRepository::new(pool.clone());
        tracked_show(&pool, &repo, 1, "broken").await;
        tracked_show(&pool, &repo, 2, "panics").await;

        let err = refresh_item(&repo, Arc::new(FakeProvider), 1).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert!(repo.find_by_id(1).await.unwrap().unwrap().locked_at.is_none());

        let err = refresh_item(&repo, Arc::new(FakeProvider), 2).await.unwrap_err();
        assert!(matches!(err, Error::RefreshAborted(2)));
        assert!(repo.find_by_id(2).await.unwrap().unwrap().locked_at.is_none());
    }

    #[tokio::test]
    async fn test_abandoned_refresh_still_unlocks() {
        let pool = test_pool().await;
        let repo = MediaItemRepository::new(pool.clone());
        tracked_show(&pool, &repo, 1, "Show").await;

        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, Error>(())
        };
        let waited = tokio::time::timeout(Duration::from_millis(50), with_lock(&repo, 1, slow)).await;
        assert!(waited.is_err());
        assert!(matches!(repo.lock(1).await, Err(Error::Locked(1))));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(repo.find_by_id(1).await.unwrap().unwrap().locked_at.is_none());
    }

    #[tokio::test]
    async fn test_refresh_all_skips_locked_items() {
        let pool = test_pool().await;
        let repo = MediaItemRepository::new(pool.clone());
        tracked_show(&pool, &repo, 1, "Show").await;
        tracked_show(&pool, &repo, 2, "Other").await;
        tracked_show(&pool, &repo, 3, "broken").await;

        repo.lock(2).await.unwrap();
        let summary = refresh_all(&repo, Arc::new(FakeProvider)).await.unwrap();
        assert_eq!(
            summary,
            RefreshSummary {
                refreshed: 1,
                skipped_locked: 1,
                failed: 1
            }
        );

        // The lock taken outside the job is left alone
        assert!(repo.find_by_id(2).await.unwrap().unwrap().locked_at.is_some());
    }

    #[tokio::test]
    async fn test_refresh_missing_item() {
        let pool = test_pool().await;
        let repo = MediaItemRepository::new(pool);
        let err = refresh_item(&repo, Arc::new(FakeProvider), 9).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { id: 9, .. }));
    }

    #[test]
    fn test_merge_ids_matches_by_number() {
        let stored = MediaItemTree::with_seasons(
            MediaItem {
                id: Some(5),
                poster: Some("/img/abc".to_string()),
                ..MediaItem::new(MediaType::Tv, "tmdb", "Show")
            },
            vec![SeasonTree::new(
                TvSeason {
                    id: Some(50),
                    ..TvSeason::new(1)
                },
                vec![TvEpisode {
                    id: Some(500),
                    ..TvEpisode::new(1, 1, None)
                }],
            )],
        );
        let fetched = MediaItemTree::with_seasons(
            MediaItem {
                poster: Some("https://image.example/p.jpg".to_string()),
                ..MediaItem::new(MediaType::Tv, "other", "Show (2001)")
            },
            vec![
                SeasonTree::new(
                    TvSeason::new(1),
                    vec![TvEpisode::new(1, 1, None), TvEpisode::new(1, 2, None)],
                ),
                SeasonTree::new(TvSeason::new(2), vec![]),
            ],
        );

        let merged = merge_ids(&stored, fetched);
        assert_eq!(merged.item.id, Some(5));
        assert_eq!(merged.item.source, "tmdb");
        assert_eq!(merged.item.title, "Show (2001)");
        assert_eq!(merged.item.poster.as_deref(), Some("/img/abc"));
        assert_eq!(merged.seasons[0].season.id, Some(50));
        assert_eq!(merged.seasons[0].episodes[0].id, Some(500));
        assert_eq!(merged.seasons[0].episodes[1].id, None);
        assert_eq!(merged.seasons[1].season.id, None);
    }
}
