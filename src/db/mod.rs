use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

pub mod store;

/// Open the SQLite pool with the settings the engine relies on
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        // Enable WAL mode for better concurrent performance
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        // NORMAL sync is safe with WAL and much faster
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        // Seasons and episodes cascade with their show
        .foreign_keys(true)
        // Writers serialize on the database lock; wait up to 5 seconds
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                use sqlx::Executor;
                // Cache size: -16000 = 16MB (negative = KB)
                conn.execute("PRAGMA cache_size = -16000").await?;
                // Store temp tables in memory
                conn.execute("PRAGMA temp_store = MEMORY").await?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await?;

    tracing::info!("SQLite configured: WAL mode, foreign keys on, 16MB cache");

    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS media_item (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            media_type TEXT NOT NULL,
            source TEXT NOT NULL,
            tmdb_id INTEGER,
            imdb_id TEXT,
            tvmaze_id INTEGER,
            igdb_id INTEGER,
            openlibrary_id TEXT,
            audible_id TEXT,
            title TEXT NOT NULL,
            original_title TEXT,
            overview TEXT,
            release_date TEXT,
            runtime INTEGER NOT NULL DEFAULT 0,
            status TEXT,
            network TEXT,
            genres TEXT,
            authors TEXT,
            narrators TEXT,
            tmdb_rating REAL,
            poster TEXT,
            poster_small TEXT,
            backdrop TEXT,
            needs_details INTEGER NOT NULL DEFAULT 0,
            last_time_updated INTEGER,
            locked_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS season (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tv_show_id INTEGER NOT NULL REFERENCES media_item(id) ON DELETE CASCADE,
            season_number INTEGER NOT NULL,
            number_of_episodes INTEGER NOT NULL DEFAULT 0,
            title TEXT NOT NULL DEFAULT '',
            description TEXT,
            release_date TEXT,
            tmdb_id INTEGER,
            tvmaze_id INTEGER,
            poster TEXT,
            poster_small TEXT,
            is_special_season INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS episode (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tv_show_id INTEGER NOT NULL REFERENCES media_item(id) ON DELETE CASCADE,
            season_id INTEGER NOT NULL REFERENCES season(id) ON DELETE CASCADE,
            season_number INTEGER NOT NULL,
            episode_number INTEGER NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            description TEXT,
            release_date TEXT,
            runtime INTEGER,
            tmdb_id INTEGER,
            imdb_id TEXT,
            is_special_episode INTEGER NOT NULL DEFAULT 0
        );

        -- One row per viewing; rewatches add rows
        CREATE TABLE IF NOT EXISTS seen (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            media_item_id INTEGER NOT NULL,
            episode_id INTEGER,
            user_id INTEGER NOT NULL,
            date INTEGER,
            date_source TEXT
        );

        CREATE TABLE IF NOT EXISTS user_rating (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            media_item_id INTEGER NOT NULL,
            episode_id INTEGER,
            user_id INTEGER NOT NULL,
            rating REAL,
            review TEXT,
            date INTEGER NOT NULL
        );

        -- One rating per (user, item, episode); a NULL episode is the item itself
        CREATE UNIQUE INDEX IF NOT EXISTS idx_user_rating_unique
            ON user_rating(user_id, media_item_id, IFNULL(episode_id, -1));

        CREATE TABLE IF NOT EXISTS watchlist (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            media_item_id INTEGER NOT NULL,
            added_at INTEGER,
            UNIQUE(user_id, media_item_id)
        );

        -- Existence of a row suppresses a repeated release notification
        CREATE TABLE IF NOT EXISTS notifications_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            media_item_id INTEGER NOT NULL,
            episode_id INTEGER,
            send_date INTEGER NOT NULL
        );

        -- Image references handed out for posters and backdrops
        CREATE TABLE IF NOT EXISTS image (
            id TEXT PRIMARY KEY,
            media_item_id INTEGER NOT NULL REFERENCES media_item(id) ON DELETE CASCADE,
            season_id INTEGER REFERENCES season(id) ON DELETE CASCADE,
            image_type TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes in separate statements for better error handling
    create_indexes(pool).await?;

    Ok(())
}

/// Create all database indexes for optimal query performance
async fn create_indexes(pool: &SqlitePool) -> Result<()> {
    let indexes = [
        // Library listing by type, title lookups
        "CREATE INDEX IF NOT EXISTS idx_media_item_type ON media_item(media_type)",
        "CREATE INDEX IF NOT EXISTS idx_media_item_title ON media_item(title)",
        "CREATE INDEX IF NOT EXISTS idx_media_item_release ON media_item(release_date)",
        // Provider ID lookups (for de-duplication)
        "CREATE INDEX IF NOT EXISTS idx_media_item_tmdb ON media_item(tmdb_id) WHERE tmdb_id IS NOT NULL",
        "CREATE INDEX IF NOT EXISTS idx_media_item_imdb ON media_item(imdb_id) WHERE imdb_id IS NOT NULL",
        "CREATE INDEX IF NOT EXISTS idx_media_item_igdb ON media_item(igdb_id) WHERE igdb_id IS NOT NULL",
        // Tree reassembly
        "CREATE INDEX IF NOT EXISTS idx_season_show ON season(tv_show_id, season_number)",
        "CREATE INDEX IF NOT EXISTS idx_episode_show ON episode(tv_show_id, season_number, episode_number)",
        "CREATE INDEX IF NOT EXISTS idx_episode_season ON episode(season_id)",
        "CREATE INDEX IF NOT EXISTS idx_episode_release ON episode(release_date)",
        // Per-user history lookups
        "CREATE INDEX IF NOT EXISTS idx_seen_user_item ON seen(user_id, media_item_id)",
        "CREATE INDEX IF NOT EXISTS idx_seen_episode ON seen(episode_id) WHERE episode_id IS NOT NULL",
        "CREATE INDEX IF NOT EXISTS idx_user_rating_user_item ON user_rating(user_id, media_item_id)",
        "CREATE INDEX IF NOT EXISTS idx_watchlist_item ON watchlist(media_item_id)",
        // Notification suppression joins
        "CREATE INDEX IF NOT EXISTS idx_notifications_item ON notifications_history(media_item_id)",
        "CREATE INDEX IF NOT EXISTS idx_notifications_episode ON notifications_history(episode_id) WHERE episode_id IS NOT NULL",
    ];

    for index_sql in indexes {
        if let Err(e) = sqlx::query(index_sql).execute(pool).await {
            tracing::warn!("Failed to create index: {} - {}", index_sql, e);
        }
    }

    tracing::debug!("Database indexes created/verified");

    Ok(())
}

/// Optimize the database (run periodically or on demand)
pub async fn optimize(pool: &SqlitePool) -> Result<()> {
    tracing::info!("Running database optimization...");

    sqlx::query("ANALYZE").execute(pool).await?;
    sqlx::query("PRAGMA optimize").execute(pool).await?;

    tracing::info!("Database optimization complete");

    Ok(())
}

/// Fresh migrated in-memory database. A single connection keeps every query on the same database.
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let pool = test_pool().await;
        migrate(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(
            names,
            [
                "episode",
                "image",
                "media_item",
                "notifications_history",
                "season",
                "seen",
                "user_rating",
                "watchlist"
            ]
        );
    }

    #[tokio::test]
    async fn test_seasons_cascade_with_show() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO media_item (id, media_type, source, title) VALUES (1, 'tv', 'user', 'Show')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO season (id, tv_show_id, season_number) VALUES (1, 1, 1)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO episode (tv_show_id, season_id, season_number, episode_number) VALUES (1, 1, 1, 1)")
            .execute(&pool)
            .await
            .unwrap();

        sqlx::query("DELETE FROM media_item WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();

        let (episodes,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM episode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(episodes, 0);
    }
}
