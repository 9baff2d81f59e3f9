// src/ingest/providers/mod.rs
pub mod reddit;
pub mod telegram;
pub mod twitter;

pub use reddit::{RedditCollector, RedditSettings};
pub use telegram::{TelegramCollector, TelegramSettings};
pub use twitter::{TwitterCollector, TwitterSettings};
