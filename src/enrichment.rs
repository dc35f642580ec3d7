// Per-user derived fields: seen state, upcoming and first unwatched episodes, counts.
// Nothing here touches storage; the repository bulk-loads rows and hands them in.

use chrono::{DateTime, NaiveDate, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::models::{
    EpisodeWithUserData, MediaItem, MediaItemDetails, MediaItemSummary, SeasonDetails, Seen,
    TvEpisode, TvSeason, UserRating,
};

/// Parse a stored release date. Date-only values are midnight UTC.
pub fn parse_release_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn release_of(release_date: Option<&str>) -> Option<DateTime<Utc>> {
    release_date.and_then(parse_release_date)
}

/// Released at or before `now`; unknown dates are never released
fn is_released(episode: &TvEpisode, now: DateTime<Utc>) -> bool {
    matches!(release_of(episode.release_date.as_deref()), Some(date) if date <= now)
}

fn is_upcoming(episode: &TvEpisode, now: DateTime<Utc>) -> bool {
    matches!(release_of(episode.release_date.as_deref()), Some(date) if date > now)
}

/// Chronological order, ties by season then episode number
fn chronological(a: &TvEpisode, b: &TvEpisode) -> Ordering {
    release_of(a.release_date.as_deref())
        .cmp(&release_of(b.release_date.as_deref()))
        .then(a.season_number.cmp(&b.season_number))
        .then(a.episode_number.cmp(&b.episode_number))
}

/// One user's seen events, ratings and watchlist, loaded for a whole candidate set
#[derive(Debug, Clone, Default)]
pub struct UserHistory {
    seen: HashMap<i64, Vec<Seen>>,
    ratings: HashMap<(i64, Option<i64>), UserRating>,
    watchlist: HashSet<i64>,
}

impl UserHistory {
    pub fn new(
        seen: Vec<Seen>,
        ratings: Vec<UserRating>,
        watchlist: impl IntoIterator<Item = i64>,
    ) -> Self {
        let mut by_item: HashMap<i64, Vec<Seen>> = HashMap::new();
        for event in seen {
            by_item.entry(event.media_item_id).or_default().push(event);
        }

        Self {
            seen: by_item,
            ratings: ratings
                .into_iter()
                .map(|r| ((r.media_item_id, r.episode_id), r))
                .collect(),
            watchlist: watchlist.into_iter().collect(),
        }
    }

    /// Every event for the item, episode events included
    fn events(&self, media_item_id: i64) -> &[Seen] {
        self.seen
            .get(&media_item_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn events_by_episode(&self, media_item_id: i64) -> HashMap<i64, Vec<&Seen>> {
        let mut map: HashMap<i64, Vec<&Seen>> = HashMap::new();
        for event in self.events(media_item_id) {
            if let Some(episode_id) = event.episode_id {
                map.entry(episode_id).or_default().push(event);
            }
        }
        map
    }

    fn rating(&self, media_item_id: i64, episode_id: Option<i64>) -> Option<UserRating> {
        self.ratings.get(&(media_item_id, episode_id)).cloned()
    }

    pub fn on_watchlist(&self, media_item_id: i64) -> bool {
        self.watchlist.contains(&media_item_id)
    }
}

/// Most recent first; events without a date go last. None when there are no events.
fn seen_history<'a>(events: impl IntoIterator<Item = &'a Seen>) -> Option<Vec<Seen>> {
    let mut history: Vec<Seen> = events.into_iter().cloned().collect();
    if history.is_empty() {
        return None;
    }
    history.sort_by(|a, b| match (a.date, b.date) {
        (Some(x), Some(y)) => y.cmp(&x).then(b.id.cmp(&a.id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.id.cmp(&a.id),
    });
    Some(history)
}

fn last_seen_at<'a>(events: impl IntoIterator<Item = &'a Seen>) -> Option<i64> {
    events.into_iter().filter_map(|e| e.date).max()
}

fn with_user_data(
    episode: &TvEpisode,
    media_item_id: i64,
    by_episode: &HashMap<i64, Vec<&Seen>>,
    history: &UserHistory,
) -> EpisodeWithUserData {
    let events: &[&Seen] = episode
        .id
        .and_then(|id| by_episode.get(&id))
        .map(Vec::as_slice)
        .unwrap_or_default();

    EpisodeWithUserData {
        episode: episode.clone(),
        seen: !events.is_empty(),
        seen_history: seen_history(events.iter().copied()),
        last_seen_at: last_seen_at(events.iter().copied()),
        user_rating: history.rating(media_item_id, episode.id),
    }
}

fn episode_seen(episode: &TvEpisode, by_episode: &HashMap<i64, Vec<&Seen>>) -> bool {
    episode
        .id
        .map(|id| by_episode.contains_key(&id))
        .unwrap_or(false)
}

/// Seen when there is at least one released regular episode and all of them are seen
fn all_released_seen<'a>(
    episodes: impl IntoIterator<Item = &'a TvEpisode>,
    by_episode: &HashMap<i64, Vec<&Seen>>,
    now: DateTime<Utc>,
) -> bool {
    let mut any = false;
    for episode in episodes {
        if episode.is_special_episode || !is_released(episode, now) {
            continue;
        }
        if !episode_seen(episode, by_episode) {
            return false;
        }
        any = true;
    }
    any
}

/// Listing overlay for one item
pub fn summarize(
    item: MediaItem,
    seasons: &[TvSeason],
    episodes: &[TvEpisode],
    history: &UserHistory,
    now: DateTime<Utc>,
) -> MediaItemSummary {
    let item_id = item.id.unwrap_or_default();
    let events = history.events(item_id);
    let user_rating = history.rating(item_id, None);
    let on_watchlist = history.on_watchlist(item_id);
    let last_seen_at = last_seen_at(events);

    if !item.is_tv() {
        return MediaItemSummary {
            seen: events.iter().any(|e| e.episode_id.is_none()),
            item,
            last_seen_at,
            user_rating,
            on_watchlist,
            number_of_seasons: None,
            number_of_episodes: None,
            unseen_episodes_count: None,
            upcoming_episode: None,
            first_unwatched_episode: None,
        };
    }

    let by_episode = history.events_by_episode(item_id);
    let regular: Vec<&TvEpisode> = episodes.iter().filter(|e| !e.is_special_episode).collect();

    let unseen_released: Vec<&TvEpisode> = regular
        .iter()
        .copied()
        .filter(|e| is_released(e, now) && !episode_seen(e, &by_episode))
        .collect();

    let first_unwatched = unseen_released
        .iter()
        .copied()
        .min_by(|a, b| chronological(a, b))
        .map(|e| with_user_data(e, item_id, &by_episode, history));

    let upcoming = regular
        .iter()
        .copied()
        .filter(|e| is_upcoming(e, now))
        .min_by(|a, b| chronological(a, b))
        .map(|e| with_user_data(e, item_id, &by_episode, history));

    MediaItemSummary {
        seen: all_released_seen(regular.iter().copied(), &by_episode, now),
        item,
        last_seen_at,
        user_rating,
        on_watchlist,
        number_of_seasons: Some(seasons.iter().filter(|s| !s.is_special_season).count() as i64),
        number_of_episodes: Some(regular.len() as i64),
        unseen_episodes_count: Some(unseen_released.len() as i64),
        upcoming_episode: upcoming,
        first_unwatched_episode: first_unwatched,
    }
}

/// Single-item view: the listing overlay plus full history and per-season breakdown
pub fn details(
    item: MediaItem,
    seasons: &[TvSeason],
    episodes: &[TvEpisode],
    history: &UserHistory,
    now: DateTime<Utc>,
) -> MediaItemDetails {
    let item_id = item.id.unwrap_or_default();
    let is_tv = item.is_tv();
    let summary = summarize(item, seasons, episodes, history, now);
    let seen_history = seen_history(history.events(item_id));

    if !is_tv {
        return MediaItemDetails {
            summary,
            seen_history,
            seasons: None,
        };
    }

    let by_episode = history.events_by_episode(item_id);
    let mut ordered_seasons: Vec<&TvSeason> = seasons.iter().collect();
    ordered_seasons.sort_by_key(|s| s.season_number);

    let seasons = ordered_seasons
        .into_iter()
        .map(|season| {
            let mut season_episodes: Vec<&TvEpisode> = episodes
                .iter()
                .filter(|e| e.season_id.is_some() && e.season_id == season.id)
                .collect();
            season_episodes.sort_by_key(|e| e.episode_number);

            SeasonDetails {
                season: season.clone(),
                seen: all_released_seen(season_episodes.iter().copied(), &by_episode, now),
                episodes: season_episodes
                    .into_iter()
                    .map(|e| with_user_data(e, item_id, &by_episode, history))
                    .collect(),
            }
        })
        .collect();

    MediaItemDetails {
        summary,
        seen_history,
        seasons: Some(seasons),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MediaType, USER_SOURCE};

    fn now() -> DateTime<Utc> {
        parse_release_date("2020-06-01").unwrap()
    }

    fn show() -> (MediaItem, Vec<TvSeason>, Vec<TvEpisode>) {
        let item = MediaItem {
            id: Some(1),
            ..MediaItem::new(MediaType::Tv, USER_SOURCE, "title")
        };
        let seasons = vec![
            TvSeason {
                id: Some(1),
                tv_show_id: Some(1),
                ..TvSeason::new(1)
            },
            TvSeason {
                id: Some(2),
                tv_show_id: Some(1),
                ..TvSeason::new(2)
            },
        ];
        let episode = |id, season_id, season, number, date| TvEpisode {
            id: Some(id),
            tv_show_id: Some(1),
            season_id: Some(season_id),
            ..TvEpisode::new(season, number, Some(date))
        };
        let episodes = vec![
            episode(1, 1, 1, 1, "2001-02-20"),
            episode(2, 1, 1, 2, "2001-02-21"),
            episode(3, 2, 2, 1, "2002-02-20"),
            episode(7, 2, 2, 2, "9999-02-20"),
        ];
        (item, seasons, episodes)
    }

    fn seen(id: i64, media_item_id: i64, episode_id: Option<i64>, date: Option<i64>) -> Seen {
        Seen {
            id: Some(id),
            media_item_id,
            episode_id,
            user_id: 1,
            date,
            date_source: None,
        }
    }

    #[test]
    fn test_parse_release_date() {
        let date = parse_release_date("2001-02-20").unwrap();
        assert_eq!(date.to_rfc3339(), "2001-02-20T00:00:00+00:00");

        let ts = parse_release_date("2001-02-20T21:00:00+02:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2001-02-20T19:00:00+00:00");

        assert!(parse_release_date("soon").is_none());
        assert!(parse_release_date("").is_none());
    }

    #[test]
    fn test_first_unwatched_and_upcoming() {
        let (item, seasons, episodes) = show();
        let history = UserHistory::new(
            vec![
                seen(1, 1, Some(1), Some(100)),
                seen(2, 1, Some(2), Some(200)),
            ],
            vec![],
            [1],
        );

        let summary = summarize(item, &seasons, &episodes, &history, now());

        let first = summary.first_unwatched_episode.unwrap();
        assert_eq!(first.episode.release_date.as_deref(), Some("2002-02-20"));
        assert!(!first.seen);

        let upcoming = summary.upcoming_episode.unwrap();
        assert_eq!(upcoming.episode.id, Some(7));
        assert!(!upcoming.seen);
        assert_eq!(upcoming.seen_history, None);
        assert_eq!(upcoming.last_seen_at, None);
        assert_eq!(upcoming.user_rating, None);

        assert_eq!(summary.unseen_episodes_count, Some(1));
        assert_eq!(summary.number_of_seasons, Some(2));
        assert_eq!(summary.number_of_episodes, Some(4));
        assert_eq!(summary.last_seen_at, Some(200));
        assert!(summary.on_watchlist);
        assert!(!summary.seen);
    }

    #[test]
    fn test_show_seen_once_every_released_episode_is_seen() {
        let (item, seasons, episodes) = show();
        let history = UserHistory::new(
            vec![
                seen(1, 1, Some(1), Some(100)),
                seen(2, 1, Some(2), Some(200)),
                seen(3, 1, Some(3), None),
            ],
            vec![],
            [],
        );

        let summary = summarize(item, &seasons, &episodes, &history, now());
        assert!(summary.seen);
        assert_eq!(summary.unseen_episodes_count, Some(0));
        assert!(summary.first_unwatched_episode.is_none());
        assert!(summary.upcoming_episode.is_some());
        assert!(!summary.on_watchlist);
    }

    #[test]
    fn test_specials_and_unknown_dates_are_ignored() {
        let (item, mut seasons, mut episodes) = show();
        seasons.push(TvSeason {
            id: Some(3),
            tv_show_id: Some(1),
            ..TvSeason::new(0)
        });
        episodes.push(TvEpisode {
            id: Some(8),
            season_id: Some(3),
            is_special_episode: true,
            ..TvEpisode::new(0, 1, Some("2000-01-01"))
        });
        episodes.push(TvEpisode {
            id: Some(9),
            season_id: Some(2),
            ..TvEpisode::new(2, 3, None)
        });

        let summary = summarize(item, &seasons, &episodes, &UserHistory::default(), now());

        assert_eq!(summary.number_of_seasons, Some(2));
        assert_eq!(summary.number_of_episodes, Some(5));
        // The two season 1 episodes and S2E1; the undated episode is neither released nor upcoming
        assert_eq!(summary.unseen_episodes_count, Some(3));
        assert_eq!(summary.first_unwatched_episode.unwrap().episode.id, Some(1));
        assert_eq!(summary.upcoming_episode.unwrap().episode.id, Some(7));
    }

    #[test]
    fn test_ties_break_on_season_then_episode() {
        let (item, seasons, _) = show();
        let episodes = vec![
            TvEpisode {
                id: Some(11),
                season_id: Some(2),
                ..TvEpisode::new(2, 1, Some("2001-01-01"))
            },
            TvEpisode {
                id: Some(12),
                season_id: Some(1),
                ..TvEpisode::new(1, 2, Some("2001-01-01"))
            },
            TvEpisode {
                id: Some(13),
                season_id: Some(1),
                ..TvEpisode::new(1, 1, Some("2001-01-01"))
            },
        ];

        let summary = summarize(item, &seasons, &episodes, &UserHistory::default(), now());
        assert_eq!(summary.first_unwatched_episode.unwrap().episode.id, Some(13));
    }

    #[test]
    fn test_show_without_episodes_has_no_episode_fields() {
        let item = MediaItem {
            id: Some(3),
            ..MediaItem::new(MediaType::Tv, USER_SOURCE, "empty")
        };
        let seasons = vec![TvSeason {
            id: Some(4),
            tv_show_id: Some(3),
            ..TvSeason::new(1)
        }];

        let summary = summarize(item, &seasons, &[], &UserHistory::default(), now());
        assert!(summary.upcoming_episode.is_none());
        assert!(summary.first_unwatched_episode.is_none());
        assert_eq!(summary.number_of_episodes, Some(0));
        assert!(!summary.seen);
    }

    #[test]
    fn test_non_tv_items() {
        for media_type in [MediaType::Movie, MediaType::VideoGame, MediaType::Book] {
            let item = MediaItem {
                id: Some(4),
                ..MediaItem::new(media_type, USER_SOURCE, "title")
            };
            let rating = UserRating {
                id: Some(1),
                media_item_id: 4,
                episode_id: None,
                user_id: 1,
                rating: Some(4.5),
                review: None,
                date: 10,
            };
            let history = UserHistory::new(
                vec![seen(1, 4, None, Some(50)), seen(2, 4, None, Some(70))],
                vec![rating.clone()],
                [],
            );

            let details = details(item, &[], &[], &history, now());
            assert!(details.summary.seen);
            assert_eq!(details.summary.last_seen_at, Some(70));
            assert_eq!(details.summary.user_rating, Some(rating));
            assert!(details.summary.upcoming_episode.is_none());
            assert!(details.summary.first_unwatched_episode.is_none());
            assert_eq!(details.summary.number_of_seasons, None);
            assert_eq!(details.seasons, None);

            let order: Vec<Option<i64>> =
                details.seen_history.unwrap().iter().map(|s| s.id).collect();
            assert_eq!(order, [Some(2), Some(1)]);
        }
    }

    #[test]
    fn test_details_breaks_down_seasons() {
        let (item, seasons, episodes) = show();
        let history = UserHistory::new(
            vec![
                seen(1, 1, Some(1), Some(100)),
                seen(2, 1, Some(2), Some(200)),
                seen(3, 1, Some(2), Some(300)),
            ],
            vec![],
            [],
        );

        let details = details(item, &seasons, &episodes, &history, now());
        let seasons = details.seasons.unwrap();
        assert_eq!(seasons.len(), 2);

        assert!(seasons[0].seen);
        assert!(!seasons[1].seen);

        let rewatched = &seasons[0].episodes[1];
        assert_eq!(rewatched.last_seen_at, Some(300));
        let order: Vec<Option<i64>> =
            rewatched.seen_history.as_ref().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(order, [Some(3), Some(2)]);

        assert_eq!(details.seen_history.map(|h| h.len()), Some(3));
    }
}
