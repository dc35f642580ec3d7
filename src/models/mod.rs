use serde::{Deserialize, Serialize};
use std::ops::Deref;

use crate::db::store::{Entity, Value};

/// Source value for items created directly by a user rather than a provider
pub const USER_SOURCE: &str = "user";

/// Current time as epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Movie,
    Tv,
    VideoGame,
    Book,
    Audiobook,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Tv => "tv",
            MediaType::VideoGame => "video_game",
            MediaType::Book => "book",
            MediaType::Audiobook => "audiobook",
        }
    }
}

/// How the user picked the date of a seen event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SeenDateSource {
    Now,
    ReleaseDate,
    Unknown,
    CustomDate,
}

impl SeenDateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeenDateSource::Now => "now",
            SeenDateSource::ReleaseDate => "release_date",
            SeenDateSource::Unknown => "unknown",
            SeenDateSource::CustomDate => "custom_date",
        }
    }
}

/// Ordered list of strings stored as a single comma-joined column.
///
/// The delimiter is not escaped: an element containing a comma
/// ("Le Guin, Ursula K.") reads back as two elements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StringList(pub Vec<String>);

impl StringList {
    pub const DELIMITER: char = ',';

    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split(Self::DELIMITER)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn to_column(&self) -> String {
        self.0.join(",")
    }
}

impl Deref for StringList {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<String>> for StringList {
    fn from(values: Vec<String>) -> Self {
        Self(values)
    }
}

impl<'a> FromIterator<&'a str> for StringList {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(str::to_string).collect())
    }
}

impl sqlx::Type<sqlx::Sqlite> for StringList {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for StringList {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> sqlx::encode::IsNull {
        <String as sqlx::Encode<'q, sqlx::Sqlite>>::encode(self.to_column(), buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for StringList {
    fn decode(
        value: sqlx::sqlite::SqliteValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let raw = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
        Ok(Self::parse(raw))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaItem {
    pub id: Option<i64>,
    pub media_type: MediaType,
    pub source: String,
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
    pub tvmaze_id: Option<i64>,
    pub igdb_id: Option<i64>,
    pub openlibrary_id: Option<String>,
    pub audible_id: Option<String>,
    pub title: String,
    pub original_title: Option<String>,
    pub overview: Option<String>,
    pub release_date: Option<String>,
    /// Minutes, 0 when unknown
    pub runtime: i64,
    pub status: Option<String>,
    pub network: Option<String>,
    pub genres: Option<StringList>,
    pub authors: Option<StringList>,
    pub narrators: Option<StringList>,
    pub tmdb_rating: Option<f64>,
    pub poster: Option<String>,
    pub poster_small: Option<String>,
    pub backdrop: Option<String>,
    pub needs_details: bool,
    /// Epoch millis of the last metadata refresh
    pub last_time_updated: Option<i64>,
    /// Epoch millis, set only while a refresh holds the lock
    pub locked_at: Option<i64>,
}

impl MediaItem {
    pub fn new(media_type: MediaType, source: &str, title: &str) -> Self {
        Self {
            media_type,
            source: source.to_string(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn is_tv(&self) -> bool {
        self.media_type == MediaType::Tv
    }

    pub fn external_ids(&self) -> ExternalIds {
        ExternalIds {
            tmdb_id: self.tmdb_id,
            imdb_id: self.imdb_id.clone(),
            tvmaze_id: self.tvmaze_id,
            igdb_id: self.igdb_id,
            openlibrary_id: self.openlibrary_id.clone(),
            audible_id: self.audible_id.clone(),
        }
    }
}

impl Entity for MediaItem {
    const TABLE: &'static str = "media_item";

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("media_type", self.media_type.into()),
            ("source", self.source.clone().into()),
            ("tmdb_id", self.tmdb_id.into()),
            ("imdb_id", self.imdb_id.clone().into()),
            ("tvmaze_id", self.tvmaze_id.into()),
            ("igdb_id", self.igdb_id.into()),
            ("openlibrary_id", self.openlibrary_id.clone().into()),
            ("audible_id", self.audible_id.clone().into()),
            ("title", self.title.clone().into()),
            ("original_title", self.original_title.clone().into()),
            ("overview", self.overview.clone().into()),
            ("release_date", self.release_date.clone().into()),
            ("runtime", self.runtime.into()),
            ("status", self.status.clone().into()),
            ("network", self.network.clone().into()),
            ("genres", self.genres.clone().into()),
            ("authors", self.authors.clone().into()),
            ("narrators", self.narrators.clone().into()),
            ("tmdb_rating", self.tmdb_rating.into()),
            ("poster", self.poster.clone().into()),
            ("poster_small", self.poster_small.clone().into()),
            ("backdrop", self.backdrop.clone().into()),
            ("needs_details", self.needs_details.into()),
            ("last_time_updated", self.last_time_updated.into()),
            ("locked_at", self.locked_at.into()),
        ]
    }

    /// `source` is fixed at creation and `locked_at` belongs to lock/unlock
    fn update_values(&self) -> Vec<(&'static str, Value)> {
        self.values()
            .into_iter()
            .filter(|(column, _)| !matches!(*column, "source" | "locked_at"))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase", default)]
pub struct TvSeason {
    pub id: Option<i64>,
    pub tv_show_id: Option<i64>,
    /// 0 marks the specials season
    pub season_number: i64,
    pub number_of_episodes: i64,
    pub title: String,
    pub description: Option<String>,
    pub release_date: Option<String>,
    pub tmdb_id: Option<i64>,
    pub tvmaze_id: Option<i64>,
    pub poster: Option<String>,
    pub poster_small: Option<String>,
    pub is_special_season: bool,
}

impl TvSeason {
    pub const SPECIALS_SEASON_NUMBER: i64 = 0;

    pub fn new(season_number: i64) -> Self {
        Self {
            season_number,
            title: format!("Season {}", season_number),
            is_special_season: season_number == Self::SPECIALS_SEASON_NUMBER,
            ..Default::default()
        }
    }
}

impl Entity for TvSeason {
    const TABLE: &'static str = "season";

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("tv_show_id", self.tv_show_id.into()),
            ("season_number", self.season_number.into()),
            ("number_of_episodes", self.number_of_episodes.into()),
            ("title", self.title.clone().into()),
            ("description", self.description.clone().into()),
            ("release_date", self.release_date.clone().into()),
            ("tmdb_id", self.tmdb_id.into()),
            ("tvmaze_id", self.tvmaze_id.into()),
            ("poster", self.poster.clone().into()),
            ("poster_small", self.poster_small.clone().into()),
            ("is_special_season", self.is_special_season.into()),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase", default)]
pub struct TvEpisode {
    pub id: Option<i64>,
    pub tv_show_id: Option<i64>,
    pub season_id: Option<i64>,
    pub season_number: i64,
    pub episode_number: i64,
    pub title: String,
    pub description: Option<String>,
    pub release_date: Option<String>,
    pub runtime: Option<i64>,
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
    pub is_special_episode: bool,
}

impl TvEpisode {
    pub fn new(season_number: i64, episode_number: i64, release_date: Option<&str>) -> Self {
        Self {
            season_number,
            episode_number,
            title: format!("Episode {}", episode_number),
            release_date: release_date.map(str::to_string),
            ..Default::default()
        }
    }
}

impl Entity for TvEpisode {
    const TABLE: &'static str = "episode";

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("tv_show_id", self.tv_show_id.into()),
            ("season_id", self.season_id.into()),
            ("season_number", self.season_number.into()),
            ("episode_number", self.episode_number.into()),
            ("title", self.title.clone().into()),
            ("description", self.description.clone().into()),
            ("release_date", self.release_date.clone().into()),
            ("runtime", self.runtime.into()),
            ("tmdb_id", self.tmdb_id.into()),
            ("imdb_id", self.imdb_id.clone().into()),
            ("is_special_episode", self.is_special_episode.into()),
        ]
    }
}

/// One viewing of an item or episode; rewatches add more rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Seen {
    pub id: Option<i64>,
    pub media_item_id: i64,
    pub episode_id: Option<i64>,
    pub user_id: i64,
    /// Epoch millis, None when the user does not remember
    pub date: Option<i64>,
    pub date_source: Option<SeenDateSource>,
}

impl Entity for Seen {
    const TABLE: &'static str = "seen";

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("media_item_id", self.media_item_id.into()),
            ("episode_id", self.episode_id.into()),
            ("user_id", self.user_id.into()),
            ("date", self.date.into()),
            ("date_source", self.date_source.into()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserRating {
    pub id: Option<i64>,
    pub media_item_id: i64,
    pub episode_id: Option<i64>,
    pub user_id: i64,
    pub rating: Option<f64>,
    pub review: Option<String>,
    pub date: i64,
}

impl Entity for UserRating {
    const TABLE: &'static str = "user_rating";

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("media_item_id", self.media_item_id.into()),
            ("episode_id", self.episode_id.into()),
            ("user_id", self.user_id.into()),
            ("rating", self.rating.into()),
            ("review", self.review.clone().into()),
            ("date", self.date.into()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Watchlist {
    pub id: Option<i64>,
    pub user_id: i64,
    pub media_item_id: i64,
    pub added_at: Option<i64>,
}

impl Entity for Watchlist {
    const TABLE: &'static str = "watchlist";

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("user_id", self.user_id.into()),
            ("media_item_id", self.media_item_id.into()),
            ("added_at", self.added_at.into()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsHistory {
    pub id: Option<i64>,
    pub media_item_id: i64,
    pub episode_id: Option<i64>,
    pub send_date: i64,
}

impl Entity for NotificationsHistory {
    const TABLE: &'static str = "notifications_history";

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("media_item_id", self.media_item_id.into()),
            ("episode_id", self.episode_id.into()),
            ("send_date", self.send_date.into()),
        ]
    }
}

/// Provider identities of a single title, used for de-duplication
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalIds {
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
    pub tvmaze_id: Option<i64>,
    pub igdb_id: Option<i64>,
    pub openlibrary_id: Option<String>,
    pub audible_id: Option<String>,
}

impl ExternalIds {
    pub fn is_empty(&self) -> bool {
        self.tmdb_id.is_none()
            && self.imdb_id.is_none()
            && self.tvmaze_id.is_none()
            && self.igdb_id.is_none()
            && self.openlibrary_id.is_none()
            && self.audible_id.is_none()
    }
}

/// Lists of provider identities; an item matches when any of them matches
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalIdSet {
    pub tmdb_id: Vec<i64>,
    pub imdb_id: Vec<String>,
    pub tvmaze_id: Vec<i64>,
    pub igdb_id: Vec<i64>,
    pub openlibrary_id: Vec<String>,
    pub audible_id: Vec<String>,
}

impl ExternalIdSet {
    pub fn is_empty(&self) -> bool {
        self.tmdb_id.is_empty()
            && self.imdb_id.is_empty()
            && self.tvmaze_id.is_empty()
            && self.igdb_id.is_empty()
            && self.openlibrary_id.is_empty()
            && self.audible_id.is_empty()
    }
}

/// A media item with its nested seasons and episodes, as written and returned by sync
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaItemTree {
    #[serde(flatten)]
    pub item: MediaItem,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seasons: Vec<SeasonTree>,
}

impl MediaItemTree {
    pub fn new(item: MediaItem) -> Self {
        Self {
            item,
            seasons: Vec::new(),
        }
    }

    pub fn with_seasons(item: MediaItem, seasons: Vec<SeasonTree>) -> Self {
        Self { item, seasons }
    }

    pub fn episodes(&self) -> impl Iterator<Item = &TvEpisode> {
        self.seasons.iter().flat_map(|s| s.episodes.iter())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeasonTree {
    #[serde(flatten)]
    pub season: TvSeason,
    #[serde(default)]
    pub episodes: Vec<TvEpisode>,
}

impl SeasonTree {
    pub fn new(season: TvSeason, episodes: Vec<TvEpisode>) -> Self {
        Self { season, episodes }
    }
}

// =============================================================================
// Read models (computed per request, never stored)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeWithUserData {
    #[serde(flatten)]
    pub episode: TvEpisode,
    pub seen: bool,
    pub seen_history: Option<Vec<Seen>>,
    pub last_seen_at: Option<i64>,
    pub user_rating: Option<UserRating>,
}

/// Element of the items listing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItemSummary {
    #[serde(flatten)]
    pub item: MediaItem,
    pub seen: bool,
    pub last_seen_at: Option<i64>,
    pub user_rating: Option<UserRating>,
    pub on_watchlist: bool,
    pub number_of_seasons: Option<i64>,
    pub number_of_episodes: Option<i64>,
    pub unseen_episodes_count: Option<i64>,
    pub upcoming_episode: Option<EpisodeWithUserData>,
    pub first_unwatched_episode: Option<EpisodeWithUserData>,
}

impl MediaItemSummary {
    pub fn id(&self) -> i64 {
        self.item.id.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeasonDetails {
    #[serde(flatten)]
    pub season: TvSeason,
    pub seen: bool,
    pub episodes: Vec<EpisodeWithUserData>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItemDetails {
    #[serde(flatten)]
    pub summary: MediaItemSummary,
    pub seen_history: Option<Vec<Seen>>,
    pub seasons: Option<Vec<SeasonDetails>>,
}

/// Episode eligible for a release notification, with its show
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeToNotify {
    #[serde(flatten)]
    pub episode: TvEpisode,
    pub tv_show: MediaItem,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_list_parse() {
        let list = StringList::parse("Drama, Comedy,,Sci-Fi ");
        assert_eq!(&*list, &["Drama", "Comedy", "Sci-Fi"]);
        assert_eq!(list.to_column(), "Drama,Comedy,Sci-Fi");
        assert!(StringList::parse("").is_empty());
    }

    #[test]
    fn test_string_list_does_not_escape_commas() {
        let authors: StringList = ["Le Guin, Ursula K."].into_iter().collect();
        let stored = StringList::parse(&authors.to_column());
        assert_eq!(&*stored, &["Le Guin", "Ursula K."]);
    }

    #[test]
    fn test_string_list_json_is_plain_array() {
        let item = MediaItem {
            genres: Some(["Drama", "Crime"].into_iter().collect()),
            ..MediaItem::new(MediaType::Tv, USER_SOURCE, "Show")
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["genres"], serde_json::json!(["Drama", "Crime"]));
        assert_eq!(json["mediaType"], "tv");
    }

    #[test]
    fn test_tree_deserializes_from_flat_json() {
        let tree: MediaItemTree = serde_json::from_value(serde_json::json!({
            "mediaType": "tv",
            "source": "tmdb",
            "title": "Show",
            "seasons": [
                {
                    "seasonNumber": 1,
                    "episodes": [{ "seasonNumber": 1, "episodeNumber": 1 }]
                }
            ]
        }))
        .unwrap();

        assert_eq!(tree.item.media_type, MediaType::Tv);
        assert_eq!(tree.item.id, None);
        assert_eq!(tree.seasons.len(), 1);
        assert_eq!(tree.seasons[0].season.season_number, 1);
        assert_eq!(tree.episodes().count(), 1);
    }

    #[test]
    fn test_specials_season() {
        assert!(TvSeason::new(0).is_special_season);
        assert!(!TvSeason::new(3).is_special_season);
    }
}
