// Items listing query: candidate SQL, derived-field filters, sorting and paging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};
use std::cmp::Ordering;

use crate::enrichment::parse_release_date;
use crate::error::{Error, Result};
use crate::models::{MediaItemSummary, MediaType};

pub const PAGE_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderBy {
    #[default]
    Title,
    LastSeen,
    UnseenEpisodes,
    ReleaseDate,
    NextAiring,
    Status,
    MediaType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

/// Listing parameters, as received on the query string
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemsQuery {
    pub user_id: i64,
    pub media_type: Option<MediaType>,
    pub order_by: Option<OrderBy>,
    pub sort_order: Option<SortOrder>,
    /// Case-insensitive substring of the title or original title
    pub filter: Option<String>,
    pub only_on_watchlist: bool,
    pub only_seen_items: bool,
    pub only_with_next_episodes_to_watch: bool,
    pub only_with_next_airing: bool,
    pub only_with_user_rating: bool,
    pub only_without_user_rating: bool,
    /// 1-indexed; absent returns every match
    pub page: Option<usize>,
    #[serde(skip)]
    pub media_item_ids: Option<Vec<i64>>,
}

impl ItemsQuery {
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.page == Some(0) {
            return Err(Error::validation("page numbers start at 1"));
        }
        if self.only_with_user_rating && self.only_without_user_rating {
            return Err(Error::validation(
                "onlyWithUserRating and onlyWithoutUserRating are mutually exclusive",
            ));
        }
        Ok(())
    }

    /// Items on the user's watchlist, seen or rated by the user, narrowed by the stored-column filters
    pub(crate) fn candidates(&self) -> QueryBuilder<'static, Sqlite> {
        let user_id = self.user_id;
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT media_item.* FROM media_item WHERE (");
        qb.push("EXISTS (SELECT 1 FROM watchlist WHERE watchlist.media_item_id = media_item.id AND watchlist.user_id = ")
            .push_bind(user_id)
            .push(") OR EXISTS (SELECT 1 FROM seen WHERE seen.media_item_id = media_item.id AND seen.user_id = ")
            .push_bind(user_id)
            .push(") OR EXISTS (SELECT 1 FROM user_rating WHERE user_rating.media_item_id = media_item.id AND user_rating.user_id = ")
            .push_bind(user_id)
            .push("))");

        if let Some(media_type) = self.media_type {
            qb.push(" AND media_item.media_type = ")
                .push_bind(media_type.as_str());
        }

        if let Some(filter) = self.filter.as_deref().map(str::trim) {
            if !filter.is_empty() {
                let needle = filter.to_lowercase();
                qb.push(" AND (instr(LOWER(media_item.title), ")
                    .push_bind(needle.clone())
                    .push(") > 0 OR instr(LOWER(COALESCE(media_item.original_title, '')), ")
                    .push_bind(needle)
                    .push(") > 0)");
            }
        }

        if self.only_on_watchlist {
            qb.push(" AND EXISTS (SELECT 1 FROM watchlist WHERE watchlist.media_item_id = media_item.id AND watchlist.user_id = ")
                .push_bind(user_id)
                .push(")");
        }

        if self.only_seen_items {
            qb.push(" AND EXISTS (SELECT 1 FROM seen WHERE seen.media_item_id = media_item.id AND seen.user_id = ")
                .push_bind(user_id)
                .push(")");
        }

        if self.only_with_user_rating || self.only_without_user_rating {
            qb.push(if self.only_with_user_rating {
                " AND EXISTS"
            } else {
                " AND NOT EXISTS"
            });
            qb.push(" (SELECT 1 FROM user_rating WHERE user_rating.media_item_id = media_item.id AND user_rating.episode_id IS NULL AND user_rating.rating IS NOT NULL AND user_rating.user_id = ")
                .push_bind(user_id)
                .push(")");
        }

        if let Some(ids) = &self.media_item_ids {
            if ids.is_empty() {
                qb.push(" AND 0");
            } else {
                qb.push(" AND media_item.id IN (");
                let mut separated = qb.separated(", ");
                for id in ids {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
            }
        }

        qb
    }

    /// Apply the filters that need derived fields, then sort
    pub(crate) fn arrange(
        &self,
        summaries: Vec<MediaItemSummary>,
        now: DateTime<Utc>,
    ) -> Vec<MediaItemSummary> {
        let mut items: Vec<MediaItemSummary> = summaries
            .into_iter()
            .filter(|s| {
                !self.only_with_next_episodes_to_watch
                    || (s.item.is_tv() && s.first_unwatched_episode.is_some())
            })
            .filter(|s| !self.only_with_next_airing || next_airing(s, now).is_some())
            .collect();

        let order_by = self.order_by.unwrap_or_default();
        let sort_order = self.sort_order.unwrap_or_default();

        items.sort_by_cached_key(|s| {
            (
                NullsLast(sort_key(s, order_by, now), sort_order),
                s.item.title.to_lowercase(),
                s.id(),
            )
        });
        items
    }
}

/// Next release still ahead of `now`: the upcoming episode for shows, the item itself otherwise
fn next_airing(summary: &MediaItemSummary, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if summary.item.is_tv() {
        summary
            .upcoming_episode
            .as_ref()
            .and_then(|e| e.episode.release_date.as_deref())
            .and_then(parse_release_date)
    } else {
        summary
            .item
            .release_date
            .as_deref()
            .and_then(parse_release_date)
            .filter(|date| *date > now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Number(i64),
    Text(String),
}

fn sort_key(summary: &MediaItemSummary, order_by: OrderBy, now: DateTime<Utc>) -> Option<SortKey> {
    match order_by {
        OrderBy::Title => Some(SortKey::Text(summary.item.title.to_lowercase())),
        OrderBy::LastSeen => summary.last_seen_at.map(SortKey::Number),
        OrderBy::UnseenEpisodes => summary.unseen_episodes_count.map(SortKey::Number),
        OrderBy::ReleaseDate => summary
            .item
            .release_date
            .as_deref()
            .and_then(parse_release_date)
            .map(|d| SortKey::Number(d.timestamp_millis())),
        OrderBy::NextAiring => next_airing(summary, now).map(|d| SortKey::Number(d.timestamp_millis())),
        OrderBy::Status => summary
            .item
            .status
            .as_ref()
            .map(|s| SortKey::Text(s.to_lowercase())),
        OrderBy::MediaType => Some(SortKey::Text(summary.item.media_type.as_str().to_string())),
    }
}

/// Orders present keys by the requested direction and puts missing keys last either way
#[derive(Debug, PartialEq, Eq)]
struct NullsLast(Option<SortKey>, SortOrder);

impl PartialOrd for NullsLast {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NullsLast {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => self.1.apply(a.cmp(b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

/// One page of a larger result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    /// Zero-based index of the first element of `data` in the full result
    pub from: usize,
    /// Zero-based index one past the last element of `data`
    pub to: usize,
    pub data: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    pub fn slice(items: Vec<T>, page: usize) -> Self {
        let total = items.len();
        let total_pages = total.div_ceil(PAGE_SIZE);
        let start = page.saturating_sub(1).saturating_mul(PAGE_SIZE).min(total);
        let end = (start + PAGE_SIZE).min(total);

        let data: Vec<T> = items.into_iter().skip(start).take(end - start).collect();
        let (from, to) = if data.is_empty() { (0, 0) } else { (start, end) };

        Self {
            from,
            to,
            data,
            total,
            page,
            total_pages,
        }
    }
}

/// Listing result: the full sequence, or a page of it when a page was requested
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Items {
    All(Vec<MediaItemSummary>),
    Paged(Page<MediaItemSummary>),
}

impl Items {
    pub fn into_vec(self) -> Vec<MediaItemSummary> {
        match self {
            Items::All(items) => items,
            Items::Paged(page) => page.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MediaItem, USER_SOURCE};

    fn summary(id: i64, title: &str, last_seen_at: Option<i64>) -> MediaItemSummary {
        MediaItemSummary {
            item: MediaItem {
                id: Some(id),
                ..MediaItem::new(MediaType::Movie, USER_SOURCE, title)
            },
            seen: last_seen_at.is_some(),
            last_seen_at,
            user_rating: None,
            on_watchlist: true,
            number_of_seasons: None,
            number_of_episodes: None,
            unseen_episodes_count: None,
            upcoming_episode: None,
            first_unwatched_episode: None,
        }
    }

    fn ids(items: &[MediaItemSummary]) -> Vec<i64> {
        items.iter().map(MediaItemSummary::id).collect()
    }

    #[test]
    fn test_validate() {
        let mut query = ItemsQuery::for_user(1);
        assert!(query.validate().is_ok());

        query.page = Some(0);
        assert!(matches!(query.validate(), Err(Error::Validation(_))));

        query.page = Some(1);
        query.only_with_user_rating = true;
        query.only_without_user_rating = true;
        assert!(matches!(query.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_page_slicing() {
        let page = Page::slice((0..81).collect::<Vec<_>>(), 3);
        assert_eq!((page.from, page.to, page.total, page.total_pages), (80, 81, 81, 3));
        assert_eq!(page.data, vec![80]);

        let page = Page::slice(vec![7], 1);
        assert_eq!((page.from, page.to, page.total, page.total_pages), (0, 1, 1, 1));

        let past_end = Page::slice((0..10).collect::<Vec<_>>(), 5);
        assert!(past_end.data.is_empty());
        assert_eq!((past_end.from, past_end.to, past_end.total), (0, 0, 10));

        let empty: Page<i32> = Page::slice(vec![], 1);
        assert_eq!((empty.from, empty.to, empty.total_pages), (0, 0, 0));
    }

    #[test]
    fn test_page_json_field_order() {
        let json = serde_json::to_string(&Page::slice(vec![1], 1)).unwrap();
        assert_eq!(
            json,
            r#"{"from":0,"to":1,"data":[1],"total":1,"page":1,"totalPages":1}"#
        );
    }

    #[test]
    fn test_nulls_sort_last_in_both_directions() {
        let items = vec![
            summary(1, "b", None),
            summary(2, "a", Some(10)),
            summary(3, "c", Some(30)),
            summary(4, "a", None),
        ];

        let mut query = ItemsQuery {
            order_by: Some(OrderBy::LastSeen),
            ..ItemsQuery::for_user(1)
        };
        assert_eq!(ids(&query.arrange(items.clone(), Utc::now())), [2, 3, 4, 1]);

        query.sort_order = Some(SortOrder::Desc);
        assert_eq!(ids(&query.arrange(items, Utc::now())), [3, 2, 4, 1]);
    }

    #[test]
    fn test_title_sort_is_case_insensitive_with_id_tiebreak() {
        let items = vec![
            summary(3, "beta", None),
            summary(2, "Alpha", None),
            summary(1, "alpha", None),
        ];
        let query = ItemsQuery::for_user(1);
        assert_eq!(ids(&query.arrange(items, Utc::now())), [1, 2, 3]);
    }

    #[test]
    fn test_next_airing_filter_for_non_tv() {
        let now = parse_release_date("2020-01-01").unwrap();
        let mut released = summary(1, "old", None);
        released.item.release_date = Some("2019-05-01".to_string());
        let mut future = summary(2, "new", None);
        future.item.release_date = Some("2021-05-01".to_string());

        let query = ItemsQuery {
            only_with_next_airing: true,
            ..ItemsQuery::for_user(1)
        };
        assert_eq!(ids(&query.arrange(vec![released, future], now)), [2]);
    }
}
