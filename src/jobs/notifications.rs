// Release notifications. History is written before delivery, so a delivery
// that fails or crashes part way is never repeated on the next run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{EpisodeToNotify, MediaItem};
use crate::repository::{MediaItemRepository, NotificationsHistoryRepository};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_item(&self, item: &MediaItem) -> anyhow::Result<()>;

    async fn notify_episode(&self, episode: &EpisodeToNotify) -> anyhow::Result<()>;
}

/// Delivers notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_item(&self, item: &MediaItem) -> anyhow::Result<()> {
        tracing::info!(
            "Released: {} \"{}\"",
            item.media_type.as_str(),
            item.title
        );
        Ok(())
    }

    async fn notify_episode(&self, episode: &EpisodeToNotify) -> anyhow::Result<()> {
        tracing::info!(
            "New episode of \"{}\": S{:02}E{:02} {}",
            episode.tv_show.title,
            episode.episode.season_number,
            episode.episode.episode_number,
            episode.episode.title
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NotificationSummary {
    pub items: usize,
    pub episodes: usize,
    pub failed: usize,
}

/// Notify everything released in `[from, to)` that has not been notified before
pub async fn run(
    repo: &MediaItemRepository,
    history: &NotificationsHistoryRepository,
    notifier: &dyn Notifier,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<NotificationSummary> {
    let mut summary = NotificationSummary::default();

    for item in repo.items_to_notify(from, to).await? {
        let Some(id) = item.id else { continue };
        history.record(id, None).await?;

        match notifier.notify_item(&item).await {
            Ok(()) => summary.items += 1,
            Err(e) => {
                tracing::warn!("Failed to deliver notification for \"{}\": {:#}", item.title, e);
                summary.failed += 1;
            }
        }
    }

    for episode in repo.episodes_to_notify(from, to).await? {
        let Some(show_id) = episode.tv_show.id else { continue };
        history.record(show_id, episode.episode.id).await?;

        match notifier.notify_episode(&episode).await {
            Ok(()) => summary.episodes += 1,
            Err(e) => {
                tracing::warn!(
                    "Failed to deliver notification for \"{}\" episode {:?}: {:#}",
                    episode.tv_show.title,
                    episode.episode.id,
                    e
                );
                summary.failed += 1;
            }
        }
    }

    if summary != NotificationSummary::default() {
        tracing::info!(
            "Notifications for [{}, {}): {} items, {} episodes, {} failed",
            from,
            to,
            summary.items,
            summary.episodes,
            summary.failed
        );
    } else {
        tracing::debug!("No releases to notify in [{}, {})", from, to);
    }

    Ok(summary)
}
