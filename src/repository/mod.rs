// Repositories over the SQLite store

pub mod media_item;
pub mod notifications_history;
pub mod sync;
pub mod user_data;

pub use media_item::MediaItemRepository;
pub use notifications_history::NotificationsHistoryRepository;
pub use sync::{NodeOp, SyncMode, SyncPlan};
pub use user_data::{SeenRepository, UserRatingRepository, WatchlistRepository};
