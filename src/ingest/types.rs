// src/ingest/types.rs
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Upstream source family. Each kind owns exactly one rate-limited fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Reddit,
    Twitter,
    Telegram,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Reddit, SourceKind::Twitter, SourceKind::Telegram];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Reddit => "reddit",
            SourceKind::Twitter => "twitter",
            SourceKind::Telegram => "telegram",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized item produced by every collector (post, tweet or chat message).
///
/// `created_at_ms` is always epoch milliseconds; collectors drop items whose
/// native timestamp cannot be resolved before they get here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    pub kind: SourceKind,
    /// Subreddit, account or chat the item came from.
    pub origin: String,
    pub text: String,
    pub created_at_ms: i64,
    /// Score / likes, when the source exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popularity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Outcome of collecting one unit. Never an `Err` past the collector boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionResult {
    Success(Vec<SourceItem>),
    Failure(FetchError),
}

impl CollectionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CollectionResult::Success(_))
    }

    pub fn items(&self) -> &[SourceItem] {
        match self {
            CollectionResult::Success(items) => items,
            CollectionResult::Failure(_) => &[],
        }
    }

    pub fn into_items(self) -> Vec<SourceItem> {
        match self {
            CollectionResult::Success(items) => items,
            CollectionResult::Failure(_) => Vec::new(),
        }
    }

    pub fn failure(&self) -> Option<&FetchError> {
        match self {
            CollectionResult::Success(_) => None,
            CollectionResult::Failure(e) => Some(e),
        }
    }
}

impl From<Result<Vec<SourceItem>, FetchError>> for CollectionResult {
    fn from(r: Result<Vec<SourceItem>, FetchError>) -> Self {
        match r {
            Ok(items) => CollectionResult::Success(items),
            Err(e) => CollectionResult::Failure(e),
        }
    }
}

/// Per-run knobs handed to a collector for each unit.
#[derive(Debug, Clone)]
pub struct CollectOptions {
    /// Reference "now" in epoch milliseconds.
    pub now_ms: i64,
    /// Items older than this are dropped.
    pub max_age: chrono::Duration,
    /// Per-item text cap applied while normalizing.
    pub max_text_chars: usize,
}

impl CollectOptions {
    pub fn new(now_ms: i64, max_age: chrono::Duration) -> Self {
        Self {
            now_ms,
            max_age,
            max_text_chars: 500,
        }
    }

    pub fn with_max_text_chars(mut self, chars: usize) -> Self {
        self.max_text_chars = chars;
        self
    }

    pub fn cutoff_ms(&self) -> i64 {
        self.now_ms - self.max_age.num_milliseconds()
    }
}

#[async_trait]
pub trait SourceCollector: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Collect a single unit (subreddit / account id / chat handle).
    async fn collect(&self, unit: &str, options: &CollectOptions) -> CollectionResult;
}

/// Progress tick, fired at most once per completed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub source: SourceKind,
    pub current: usize,
    pub total: usize,
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Units to collect, grouped by source, in caller order.
pub type SourceUnits = BTreeMap<SourceKind, Vec<String>>;
