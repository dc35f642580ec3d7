use anyhow::Result;
use axum::Router;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mediatracker::config::AppConfig;
use mediatracker::jobs::notifications::{self, LogNotifier};
use mediatracker::repository::{MediaItemRepository, NotificationsHistoryRepository};
use mediatracker::{api, db, AppState};

/// Tracks all background task handles for graceful shutdown
struct BackgroundTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
    shutdown: CancellationToken,
}

impl BackgroundTasks {
    fn new() -> Self {
        Self {
            handles: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.handles.push((name, handle));
    }

    async fn shutdown(self) {
        tracing::info!("Initiating graceful shutdown...");

        self.shutdown.cancel();

        for (name, handle) in self.handles {
            tracing::debug!("Waiting for {} to finish...", name);
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(Ok(())) => tracing::debug!("{} finished cleanly", name),
                Ok(Err(e)) => tracing::warn!("{} panicked: {}", name, e),
                Err(_) => tracing::warn!("{} timed out during shutdown", name),
            }
        }

        tracing::info!("All background tasks stopped");
    }
}

/// Each run covers the releases since the previous one, `[previous, now)`
async fn notification_loop(pool: sqlx::SqlitePool, interval: Duration, cancel: CancellationToken) {
    let repo = MediaItemRepository::new(pool.clone());
    let history = NotificationsHistoryRepository::new(pool);
    let mut previous: DateTime<Utc> = Utc::now();

    tracing::info!(
        "Release notification job started (interval: {} minutes)",
        interval.as_secs() / 60
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Release notification job received shutdown signal");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                let now = Utc::now();
                match notifications::run(&repo, &history, &LogNotifier, previous, now).await {
                    Ok(_) => previous = now,
                    Err(e) => tracing::error!("Release notification run failed: {}", e),
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediatracker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = AppConfig::load();
    config.paths.ensure_dirs().await?;
    config.log_config();

    let database_url = config.database_url();
    tracing::debug!("Database URL: {}", database_url);

    let pool = db::connect(&database_url).await?;
    db::migrate(&pool).await?;
    db::optimize(&pool).await?;

    let state = Arc::new(AppState {
        db: pool.clone(),
        config: config.clone(),
    });

    let mut bg_tasks = BackgroundTasks::new();

    if config.jobs.notifications_interval_minutes > 0 {
        let interval = Duration::from_secs(config.jobs.notifications_interval_minutes * 60);
        let cancel = bg_tasks.token();
        bg_tasks.spawn(
            "release-notifications",
            notification_loop(pool.clone(), interval, cancel),
        );
    } else {
        tracing::info!("Release notification job disabled (interval set to 0)");
    }

    let app = Router::new()
        .merge(api::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let ip: std::net::IpAddr = config.bind_address.parse()?;
    let addr = SocketAddr::new(ip, config.port);
    tracing::info!("Starting server on {}", addr);

    let shutdown_signal = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    bg_tasks.shutdown().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
