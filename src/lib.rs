// Media tracking engine: storage, derivation, locking, notification
// eligibility and paginated listings over SQLite

pub mod api;
pub mod config;
pub mod db;
pub mod enrichment;
pub mod error;
pub mod jobs;
pub mod models;
pub mod query;
pub mod repository;
pub mod services;

pub use error::{Error, Result};

use config::AppConfig;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: AppConfig,
}
