// Media item aggregate: tree sync, de-duplication lookups, the refresh lock,
// notification selection and per-user reads.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::Sqlite;
use sqlx::{QueryBuilder, SqlitePool};
use std::collections::HashMap;

use crate::db::store::{push_value, Entity, Store, Value};
use crate::enrichment::{self, UserHistory};
use crate::error::{Error, Result};
use crate::models::{
    now_millis, EpisodeToNotify, ExternalIdSet, ExternalIds, MediaItem, MediaItemDetails,
    MediaItemSummary, MediaItemTree, MediaType, SeasonTree, Seen, TvEpisode, TvSeason,
    UserRating, Watchlist, USER_SOURCE,
};
use crate::query::{Items, ItemsQuery, Page};
use crate::services::images::{ImageAllocator, ImageKind};

use super::sync::{NodeOp, SyncMode, SyncPlan};

/// Window bound in a form `julianday()` understands
fn sql_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Bucket rows by their owning media item
fn group_by_show<T>(rows: Vec<T>, key: impl Fn(&T) -> Option<i64>) -> HashMap<i64, Vec<T>> {
    let mut grouped: HashMap<i64, Vec<T>> = HashMap::new();
    for row in rows {
        if let Some(id) = key(&row) {
            grouped.entry(id).or_default().push(row);
        }
    }
    grouped
}

fn push_any_in(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: Vec<Value>) {
    if values.is_empty() {
        return;
    }
    qb.push(" OR ").push(column).push(" IN (");
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        push_value(qb, value);
    }
    qb.push(")");
}

fn push_release_year(qb: &mut QueryBuilder<'_, Sqlite>, release_year: Option<i32>) {
    if let Some(year) = release_year {
        qb.push(" AND julianday(release_date) >= julianday(")
            .push_bind(format!("{:04}-01-01", year))
            .push(") AND julianday(release_date) < julianday(")
            .push_bind(format!("{:04}-01-01", year + 1))
            .push(")");
    }
}

/// Execute one planned node write and return the row id
async fn write<E: Entity + Sync>(store: &Store<E>, op: NodeOp, entity: &E) -> Result<i64> {
    match op {
        NodeOp::Insert { .. } => store.create(entity).await,
        NodeOp::Update(id) => {
            store.update(entity).await?;
            Ok(id)
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaItemRepository {
    pool: SqlitePool,
    items: Store<MediaItem>,
    seasons: Store<TvSeason>,
    episodes: Store<TvEpisode>,
}

impl MediaItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            items: Store::new(pool.clone()),
            seasons: Store::new(pool.clone()),
            episodes: Store::new(pool.clone()),
            pool,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<MediaItem>> {
        self.items.find_by_id(id).await
    }

    // =========================================================================
    // Tree sync
    // =========================================================================

    /// Write an item with its seasons and episodes, parent before child.
    /// Returns a copy of the tree with every id and parent reference filled in.
    /// Rows missing from the input are left alone, and a failure part way
    /// through keeps whatever was already written.
    pub async fn synchronize(&self, tree: &MediaItemTree, mode: SyncMode) -> Result<MediaItemTree> {
        let plan = SyncPlan::build(tree, mode)?;
        tracing::debug!(
            "Syncing \"{}\" ({:?}): {} inserts, {} updates",
            plan.item.title,
            plan.mode,
            plan.inserts(),
            plan.updates()
        );

        let mut item = plan.item;
        if item.last_time_updated.is_none() {
            item.last_time_updated = Some(now_millis());
        }
        let item_id = write(&self.items, plan.op, &item).await?;
        item.id = Some(item_id);

        let mut seasons = Vec::with_capacity(plan.seasons.len());
        for season_plan in plan.seasons {
            let mut season = season_plan.season;
            season.tv_show_id = Some(item_id);
            let season_id = write(&self.seasons, season_plan.op, &season).await?;
            season.id = Some(season_id);

            let mut episodes = Vec::with_capacity(season_plan.episodes.len());
            for episode_plan in season_plan.episodes {
                let mut episode = episode_plan.episode;
                episode.tv_show_id = Some(item_id);
                episode.season_id = Some(season_id);
                let episode_id = write(&self.episodes, episode_plan.op, &episode).await?;
                episode.id = Some(episode_id);
                episodes.push(episode);
            }

            seasons.push(SeasonTree::new(season, episodes));
        }

        Ok(MediaItemTree::with_seasons(item, seasons))
    }

    pub async fn create(&self, tree: &MediaItemTree) -> Result<MediaItemTree> {
        self.synchronize(tree, SyncMode::Create).await
    }

    pub async fn update(&self, tree: &MediaItemTree) -> Result<MediaItemTree> {
        self.synchronize(tree, SyncMode::Update).await
    }

    /// Create every tree concurrently. The first failure is returned;
    /// trees that were already written stay written.
    pub async fn create_many(&self, trees: &[MediaItemTree]) -> Result<Vec<MediaItemTree>> {
        futures::future::try_join_all(trees.iter().map(|tree| self.create(tree))).await
    }

    /// Create a tree and swap the poster and backdrop sources for allocated image references
    pub async fn add(
        &self,
        tree: &MediaItemTree,
        images: &dyn ImageAllocator,
    ) -> Result<MediaItemTree> {
        let mut stripped = tree.clone();
        let poster = stripped.item.poster.take();
        let backdrop = stripped.item.backdrop.take();
        stripped.item.poster_small = None;
        let season_posters: Vec<Option<String>> = stripped
            .seasons
            .iter_mut()
            .map(|s| {
                s.season.poster_small = None;
                s.season.poster.take()
            })
            .collect();

        let mut created = self.create(&stripped).await?;
        let item_id = created
            .item
            .id
            .ok_or_else(|| Error::validation("media item was not assigned an id"))?;

        if poster.is_some() {
            let image = images.allocate(item_id, None, ImageKind::Poster).await?;
            created.item.poster = Some(image.url());
            created.item.poster_small = Some(image.small_url());
        }
        if backdrop.is_some() {
            let image = images.allocate(item_id, None, ImageKind::Backdrop).await?;
            created.item.backdrop = Some(image.url());
        }
        if poster.is_some() || backdrop.is_some() {
            self.items.update(&created.item).await?;
        }

        for (season, source) in created.seasons.iter_mut().zip(season_posters) {
            if source.is_none() {
                continue;
            }
            let image = images
                .allocate(item_id, season.season.id, ImageKind::Poster)
                .await?;
            season.season.poster = Some(image.url());
            season.season.poster_small = Some(image.small_url());
            self.seasons.update(&season.season).await?;
        }

        tracing::info!("Added {} \"{}\" ({})", created.item.media_type.as_str(), created.item.title, item_id);

        Ok(created)
    }

    /// Stored seasons ordered by number, each with its episodes
    pub async fn seasons_with_episodes(&self, media_item_id: i64) -> Result<Vec<SeasonTree>> {
        let seasons: Vec<TvSeason> = sqlx::query_as(
            "SELECT * FROM season WHERE tv_show_id = ? ORDER BY season_number, id",
        )
        .bind(media_item_id)
        .fetch_all(&self.pool)
        .await?;

        let episodes: Vec<TvEpisode> = sqlx::query_as(
            "SELECT * FROM episode WHERE tv_show_id = ? ORDER BY season_number, episode_number, id",
        )
        .bind(media_item_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_season = group_by_show(episodes, |e| e.season_id);

        Ok(seasons
            .into_iter()
            .map(|season| {
                let episodes = season
                    .id
                    .and_then(|id| by_season.remove(&id))
                    .unwrap_or_default();
                SeasonTree::new(season, episodes)
            })
            .collect())
    }

    /// The stored tree for an item, or None when the item does not exist
    pub async fn tree(&self, media_item_id: i64) -> Result<Option<MediaItemTree>> {
        let Some(item) = self.items.find_by_id(media_item_id).await? else {
            return Ok(None);
        };
        let seasons = if item.is_tv() {
            self.seasons_with_episodes(media_item_id).await?
        } else {
            Vec::new()
        };
        Ok(Some(MediaItemTree::with_seasons(item, seasons)))
    }

    // =========================================================================
    // De-duplication lookups
    // =========================================================================

    /// Items of the given type matching any of the listed provider ids
    pub async fn find_by_external_ids(
        &self,
        ids: &ExternalIdSet,
        media_type: MediaType,
    ) -> Result<Vec<MediaItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM media_item WHERE media_type = ");
        qb.push_bind(media_type.as_str()).push(" AND (0");
        push_any_in(&mut qb, "tmdb_id", ids.tmdb_id.iter().copied().map(Value::from).collect());
        push_any_in(&mut qb, "imdb_id", ids.imdb_id.iter().cloned().map(Value::from).collect());
        push_any_in(&mut qb, "tvmaze_id", ids.tvmaze_id.iter().copied().map(Value::from).collect());
        push_any_in(&mut qb, "igdb_id", ids.igdb_id.iter().copied().map(Value::from).collect());
        push_any_in(
            &mut qb,
            "openlibrary_id",
            ids.openlibrary_id.iter().cloned().map(Value::from).collect(),
        );
        push_any_in(&mut qb, "audible_id", ids.audible_id.iter().cloned().map(Value::from).collect());
        qb.push(") ORDER BY id");

        Ok(qb.build_query_as::<MediaItem>().fetch_all(&self.pool).await?)
    }

    /// First item of the given type sharing any provider id
    pub async fn find_by_external_id(
        &self,
        ids: &ExternalIds,
        media_type: MediaType,
    ) -> Result<Option<MediaItem>> {
        let set = ExternalIdSet {
            tmdb_id: ids.tmdb_id.into_iter().collect(),
            imdb_id: ids.imdb_id.iter().cloned().collect(),
            tvmaze_id: ids.tvmaze_id.into_iter().collect(),
            igdb_id: ids.igdb_id.into_iter().collect(),
            openlibrary_id: ids.openlibrary_id.iter().cloned().collect(),
            audible_id: ids.audible_id.iter().cloned().collect(),
        };
        Ok(self
            .find_by_external_ids(&set, media_type)
            .await?
            .into_iter()
            .next())
    }

    /// Closest title containing `title`, ranked by how little the lengths differ
    pub async fn find_by_title(
        &self,
        media_type: MediaType,
        title: &str,
        release_year: Option<i32>,
    ) -> Result<Option<MediaItem>> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::validation("title must not be empty"));
        }
        let needle = title.to_lowercase();

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM media_item WHERE media_type = ");
        qb.push_bind(media_type.as_str())
            .push(" AND (instr(LOWER(title), ")
            .push_bind(needle.clone())
            .push(") > 0 OR instr(LOWER(COALESCE(original_title, '')), ")
            .push_bind(needle)
            .push(") > 0)");
        push_release_year(&mut qb, release_year);
        qb.push(" ORDER BY ABS(LENGTH(title) - ")
            .push_bind(title.chars().count() as i64)
            .push("), id LIMIT 1");

        Ok(qb.build_query_as::<MediaItem>().fetch_optional(&self.pool).await?)
    }

    /// Case-insensitive equality on title or original title
    pub async fn find_by_exact_title(
        &self,
        media_type: MediaType,
        title: &str,
        release_year: Option<i32>,
    ) -> Result<Option<MediaItem>> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::validation("title must not be empty"));
        }
        let needle = title.to_lowercase();

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM media_item WHERE media_type = ");
        qb.push_bind(media_type.as_str())
            .push(" AND (LOWER(title) = ")
            .push_bind(needle.clone())
            .push(" OR LOWER(original_title) = ")
            .push_bind(needle)
            .push(")");
        push_release_year(&mut qb, release_year);
        qb.push(" ORDER BY id LIMIT 1");

        Ok(qb.build_query_as::<MediaItem>().fetch_optional(&self.pool).await?)
    }

    // =========================================================================
    // Refresh lock
    // =========================================================================

    /// Take the refresh lock. A single conditional write, so two callers can never both win.
    pub async fn lock(&self, media_item_id: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE media_item SET locked_at = ? WHERE id = ? AND locked_at IS NULL")
                .bind(now_millis())
                .bind(media_item_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Locked(media_item_id));
        }

        tracing::debug!("Locked media item {}", media_item_id);
        Ok(())
    }

    pub async fn unlock(&self, media_item_id: i64) -> Result<()> {
        sqlx::query("UPDATE media_item SET locked_at = NULL WHERE id = ?")
            .bind(media_item_id)
            .execute(&self.pool)
            .await?;

        tracing::debug!("Unlocked media item {}", media_item_id);
        Ok(())
    }

    /// Provider-sourced items some user has seen, rated or put on a watchlist
    pub async fn items_to_possibly_update(&self) -> Result<Vec<MediaItem>> {
        let items = sqlx::query_as::<_, MediaItem>(
            r#"
            SELECT media_item.* FROM media_item
            WHERE media_item.source != ?
              AND (
                EXISTS (SELECT 1 FROM seen WHERE seen.media_item_id = media_item.id)
                OR EXISTS (SELECT 1 FROM watchlist WHERE watchlist.media_item_id = media_item.id)
                OR EXISTS (SELECT 1 FROM user_rating WHERE user_rating.media_item_id = media_item.id)
              )
            ORDER BY media_item.id
            "#,
        )
        .bind(USER_SOURCE)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    // =========================================================================
    // Notification eligibility
    // =========================================================================

    /// Non-TV items released in `[from, to)` that have not been notified yet
    pub async fn items_to_notify(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MediaItem>> {
        let items = sqlx::query_as::<_, MediaItem>(
            r#"
            SELECT media_item.* FROM media_item
            LEFT JOIN notifications_history
              ON notifications_history.media_item_id = media_item.id
             AND notifications_history.episode_id IS NULL
            WHERE media_item.media_type != 'tv'
              AND julianday(media_item.release_date) >= julianday(?)
              AND julianday(media_item.release_date) < julianday(?)
              AND notifications_history.id IS NULL
            GROUP BY media_item.id
            ORDER BY media_item.id
            "#,
        )
        .bind(sql_timestamp(from))
        .bind(sql_timestamp(to))
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    /// Regular episodes released in `[from, to)` that have not been notified yet, with their show
    pub async fn episodes_to_notify(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EpisodeToNotify>> {
        let episodes = sqlx::query_as::<_, TvEpisode>(
            r#"
            SELECT episode.* FROM episode
            LEFT JOIN notifications_history
              ON notifications_history.episode_id = episode.id
            WHERE episode.is_special_episode = 0
              AND julianday(episode.release_date) >= julianday(?)
              AND julianday(episode.release_date) < julianday(?)
              AND notifications_history.id IS NULL
            GROUP BY episode.id
            ORDER BY julianday(episode.release_date), episode.id
            "#,
        )
        .bind(sql_timestamp(from))
        .bind(sql_timestamp(to))
        .fetch_all(&self.pool)
        .await?;

        let mut show_ids: Vec<i64> = episodes.iter().filter_map(|e| e.tv_show_id).collect();
        show_ids.sort_unstable();
        show_ids.dedup();

        let shows: HashMap<i64, MediaItem> = self
            .fetch_in::<MediaItem>("id", &show_ids)
            .await?
            .into_iter()
            .filter_map(|show| show.id.map(|id| (id, show)))
            .collect();

        Ok(episodes
            .into_iter()
            .filter_map(|episode| {
                let show = episode.tv_show_id.and_then(|id| shows.get(&id)).cloned();
                if show.is_none() {
                    tracing::warn!("Episode {:?} has no show, skipping", episode.id);
                }
                show.map(|tv_show| EpisodeToNotify { episode, tv_show })
            })
            .collect())
    }

    // =========================================================================
    // Per-user reads
    // =========================================================================

    /// Listing for a user: the full match set, or one page of it when `page` is set
    pub async fn items(&self, query: &ItemsQuery) -> Result<Items> {
        self.items_as_of(query, Utc::now()).await
    }

    pub async fn items_as_of(&self, query: &ItemsQuery, now: DateTime<Utc>) -> Result<Items> {
        query.validate()?;

        let mut qb = query.candidates();
        let candidates: Vec<MediaItem> = qb.build_query_as().fetch_all(&self.pool).await?;
        let summaries = self.summaries(query.user_id, candidates, now).await?;
        let arranged = query.arrange(summaries, now);

        tracing::debug!("Items query for user {} matched {}", query.user_id, arranged.len());

        Ok(match query.page {
            Some(page) => Items::Paged(Page::slice(arranged, page)),
            None => Items::All(arranged),
        })
    }

    pub async fn details(&self, media_item_id: i64, user_id: i64) -> Result<MediaItemDetails> {
        self.details_as_of(media_item_id, user_id, Utc::now()).await
    }

    pub async fn details_as_of(
        &self,
        media_item_id: i64,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<MediaItemDetails> {
        let item = self
            .items
            .find_by_id(media_item_id)
            .await?
            .ok_or(Error::NotFound {
                table: MediaItem::TABLE,
                id: media_item_id,
            })?;

        let (seasons, episodes) = if item.is_tv() {
            (
                self.fetch_in::<TvSeason>("tv_show_id", &[media_item_id]).await?,
                self.fetch_in::<TvEpisode>("tv_show_id", &[media_item_id]).await?,
            )
        } else {
            (Vec::new(), Vec::new())
        };
        let history = self.user_history(user_id, &[media_item_id]).await?;

        Ok(enrichment::details(item, &seasons, &episodes, &history, now))
    }

    async fn summaries(
        &self,
        user_id: i64,
        candidates: Vec<MediaItem>,
        now: DateTime<Utc>,
    ) -> Result<Vec<MediaItemSummary>> {
        let ids: Vec<i64> = candidates.iter().filter_map(|i| i.id).collect();
        let tv_ids: Vec<i64> = candidates
            .iter()
            .filter(|i| i.is_tv())
            .filter_map(|i| i.id)
            .collect();

        let history = self.user_history(user_id, &ids).await?;
        let seasons = group_by_show(
            self.fetch_in::<TvSeason>("tv_show_id", &tv_ids).await?,
            |s| s.tv_show_id,
        );
        let episodes = group_by_show(
            self.fetch_in::<TvEpisode>("tv_show_id", &tv_ids).await?,
            |e| e.tv_show_id,
        );

        Ok(candidates
            .into_iter()
            .map(|item| {
                let id = item.id.unwrap_or_default();
                enrichment::summarize(
                    item,
                    seasons.get(&id).map(Vec::as_slice).unwrap_or_default(),
                    episodes.get(&id).map(Vec::as_slice).unwrap_or_default(),
                    &history,
                    now,
                )
            })
            .collect())
    }

    /// Batch fetch rows whose `column` is one of `ids`
    async fn fetch_in<E: Entity>(&self, column: &'static str, ids: &[i64]) -> Result<Vec<E>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM ");
        qb.push(E::TABLE).push(" WHERE ").push(column).push(" IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        qb.push(" ORDER BY ").push(E::PRIMARY_KEY);

        Ok(qb.build_query_as::<E>().fetch_all(&self.pool).await?)
    }

    /// Batch fetch one user's rows that reference any of `ids`
    async fn fetch_for_user<E: Entity>(&self, user_id: i64, ids: &[i64]) -> Result<Vec<E>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM ");
        qb.push(E::TABLE)
            .push(" WHERE user_id = ")
            .push_bind(user_id)
            .push(" AND media_item_id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        qb.push(" ORDER BY ").push(E::PRIMARY_KEY);

        Ok(qb.build_query_as::<E>().fetch_all(&self.pool).await?)
    }

    async fn user_history(&self, user_id: i64, ids: &[i64]) -> Result<UserHistory> {
        let seen = self.fetch_for_user::<Seen>(user_id, ids).await?;
        let ratings = self.fetch_for_user::<UserRating>(user_id, ids).await?;
        let watchlist = self.fetch_for_user::<Watchlist>(user_id, ids).await?;

        Ok(UserHistory::new(
            seen,
            ratings,
            watchlist.into_iter().map(|w| w.media_item_id),
        ))
    }
}
