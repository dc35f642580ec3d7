use axum::{http::StatusCode, routing::get, Router};
use std::sync::Arc;

use crate::{AppState, Error};

mod items;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .nest("/api", items::routes())
}

/// Map engine errors onto HTTP responses
pub(crate) fn error_response(error: Error) -> (StatusCode, String) {
    let status = match &error {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Locked(_) => StatusCode::CONFLICT,
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::RefreshAborted(_) | Error::Provider(_) | Error::Storage(_) => {
            tracing::error!("Request failed: {}", error);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, error.to_string())
}
