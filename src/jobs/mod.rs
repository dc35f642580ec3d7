// Background jobs

pub mod notifications;
pub mod refresh;
