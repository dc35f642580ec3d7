use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use super::error_response;
use crate::{
    models::MediaItemDetails,
    query::{Items, ItemsQuery},
    repository::MediaItemRepository,
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/items", get(get_items))
        .route("/details/:mediaItemId", get(get_details))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetailsQuery {
    user_id: i64,
}

/// GET /api/items - array, or a page object when `page` is given
async fn get_items(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ItemsQuery>,
) -> Result<Json<Items>, (StatusCode, String)> {
    let repo = MediaItemRepository::new(state.db.clone());
    let items = repo.items(&query).await.map_err(error_response)?;
    Ok(Json(items))
}

/// GET /api/details/:mediaItemId?userId=
async fn get_details(
    State(state): State<Arc<AppState>>,
    Path(media_item_id): Path<i64>,
    Query(query): Query<DetailsQuery>,
) -> Result<Json<MediaItemDetails>, (StatusCode, String)> {
    let repo = MediaItemRepository::new(state.db.clone());
    let details = repo
        .details(media_item_id, query.user_id)
        .await
        .map_err(error_response)?;
    Ok(Json(details))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::config::AppConfig;
    use crate::db::test_pool;
    use crate::models::{MediaItem, MediaItemTree, MediaType, SeasonTree, TvEpisode, TvSeason};
    use crate::repository::{MediaItemRepository, WatchlistRepository};
    use crate::AppState;

    async fn app() -> Router {
        let pool = test_pool().await;
        let repo = MediaItemRepository::new(pool.clone());
        let watchlist = WatchlistRepository::new(pool.clone());

        repo.create(&MediaItemTree::with_seasons(
            MediaItem {
                id: Some(1),
                ..MediaItem::new(MediaType::Tv, "tmdb", "Show")
            },
            vec![SeasonTree::new(
                TvSeason::new(1),
                vec![TvEpisode::new(1, 1, Some("2001-02-20"))],
            )],
        ))
        .await
        .unwrap();
        repo.create(&MediaItemTree::new(MediaItem {
            id: Some(2),
            release_date: Some("1999-03-31".to_string()),
            ..MediaItem::new(MediaType::Movie, "tmdb", "Movie")
        }))
        .await
        .unwrap();
        watchlist.add(1, 1).await.unwrap();
        watchlist.add(1, 2).await.unwrap();

        super::super::routes().with_state(Arc::new(AppState {
            db: pool,
            config: AppConfig::default(),
        }))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(app().await, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }

    #[tokio::test]
    async fn test_items_without_page_is_array() {
        let (status, body) = get(app().await, "/api/items?userId=1&mediaType=movie").await;
        assert_eq!(status, StatusCode::OK);

        let json: Value = serde_json::from_slice(&body).unwrap();
        let items = json.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["title"], "Movie");
        assert_eq!(items[0]["onWatchlist"], true);
    }

    #[tokio::test]
    async fn test_items_with_page_is_page_object() {
        let (status, body) = get(app().await, "/api/items?userId=1&page=1").await;
        assert_eq!(status, StatusCode::OK);

        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total"], 2);
        assert_eq!(json["totalPages"], 1);
        assert_eq!(json["from"], 0);
        assert_eq!(json["to"], 2);
        assert_eq!(json["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_items_rejects_page_zero() {
        let (status, _) = get(app().await, "/api/items?userId=1&page=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_details() {
        let (status, body) = get(app().await, "/api/details/1?userId=1").await;
        assert_eq!(status, StatusCode::OK);

        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["title"], "Show");
        assert_eq!(json["seasons"][0]["episodes"][0]["seen"], false);
        assert_eq!(json["seen"], false);
    }

    #[tokio::test]
    async fn test_details_not_found() {
        let (status, _) = get(app().await, "/api/details/99?userId=1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
