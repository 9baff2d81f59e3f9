// src/ingest/providers/reddit.rs
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::FetchError;
use crate::ingest::fetcher::{FetchRequest, RateLimitedFetcher};
use crate::ingest::types::{CollectOptions, CollectionResult, SourceCollector, SourceItem, SourceKind};
use crate::ingest::{clean_text, filter_recent, is_noise, timestamp, DEFAULT_NOISE_PATTERNS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedditSettings {
    pub base_url: String,
    /// Listing to read: "hot" tracks what is trending, "new" is better for sniping.
    pub sort: String,
    pub page_size: u32,
    pub max_pages: u32,
    /// Posts at or below this score are dropped.
    pub min_score: Option<i64>,
    pub selftext_chars: usize,
    /// Matched against the post title only. Body text may quote anything.
    pub noise_patterns: Vec<String>,
}

impl Default for RedditSettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.reddit.com".to_string(),
            sort: "hot".to_string(),
            page_size: 25,
            max_pages: 1,
            min_score: Some(5),
            selftext_chars: 500,
            noise_patterns: DEFAULT_NOISE_PATTERNS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Child {
    data: Post,
}

#[derive(Debug, Deserialize)]
struct Post {
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: Option<String>,
    #[serde(default)]
    score: Option<i64>,
    #[serde(default)]
    created_utc: Value,
    #[serde(default)]
    subreddit: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    permalink: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

pub struct RedditCollector {
    fetcher: Arc<RateLimitedFetcher>,
    settings: RedditSettings,
}

impl RedditCollector {
    pub fn new(fetcher: Arc<RateLimitedFetcher>, settings: RedditSettings) -> Self {
        Self { fetcher, settings }
    }

    /// Accepts "CryptoCurrency", "r/CryptoCurrency" or "/r/CryptoCurrency/".
    pub fn subreddit_name(unit: &str) -> &str {
        let u = unit.trim().trim_matches('/');
        u.strip_prefix("r/").unwrap_or(u)
    }

    fn to_item(&self, post: Post, unit: &str, opts: &CollectOptions) -> Option<SourceItem> {
        let created_at_ms = timestamp::parse_value(&post.created_utc)?;
        let selftext = clean_text(post.selftext.as_deref().unwrap_or_default(), self.settings.selftext_chars);
        let raw = if selftext.is_empty() {
            post.title
        } else {
            format!("{}. {}", post.title.trim_end_matches('.'), selftext)
        };
        let url = post
            .permalink
            .map(|p| format!("{}{}", self.settings.base_url.trim_end_matches('/'), p))
            .or(post.url);
        Some(SourceItem {
            kind: SourceKind::Reddit,
            origin: post.subreddit.unwrap_or_else(|| unit.to_string()),
            text: clean_text(&raw, opts.max_text_chars),
            created_at_ms,
            popularity: post.score,
            author: post.author,
            url,
        })
    }

    async fn collect_unit(&self, unit: &str, opts: &CollectOptions) -> Result<Vec<SourceItem>, FetchError> {
        let sub = Self::subreddit_name(unit);
        if sub.is_empty() {
            return Err(FetchError::Parse(format!("invalid subreddit unit {unit:?}")));
        }
        let url = format!(
            "{}/r/{}/{}.json",
            self.settings.base_url.trim_end_matches('/'),
            sub,
            self.settings.sort
        );

        let mut raw = Vec::new();
        let mut unresolved = 0usize;
        let mut noisy = 0usize;
        let mut after: Option<String> = None;

        for page in 0..self.settings.max_pages.max(1) {
            let mut req = FetchRequest::get(&url)
                .query("limit", self.settings.page_size)
                .query("raw_json", 1);
            if let Some(a) = &after {
                req = req.query("after", a);
            }

            let body = self.fetcher.fetch(&req).await?;
            let listing: Listing =
                serde_json::from_value(body).map_err(|e| FetchError::Parse(format!("reddit listing: {e}")))?;

            let page_len = listing.data.children.len();
            let mut oldest = i64::MAX;
            for child in listing.data.children {
                if is_noise(&child.data.title, &self.settings.noise_patterns) {
                    noisy += 1;
                    continue;
                }
                match self.to_item(child.data, sub, opts) {
                    Some(item) => {
                        oldest = oldest.min(item.created_at_ms);
                        raw.push(item);
                    }
                    None => unresolved += 1,
                }
            }
            debug!(target: "ingest", subreddit = sub, page, items = page_len, "reddit page");

            after = listing.data.after;
            if after.is_none() || page_len == 0 {
                break;
            }
            // "new" is chronological: once a page reaches past the cutoff, later pages are older still.
            if self.settings.sort == "new" && oldest < opts.cutoff_ms() {
                break;
            }
        }

        counter!("ingest_items_total", "source" => "reddit").increment((raw.len() + unresolved + noisy) as u64);

        let (mut kept, dropped) = filter_recent(raw, opts.cutoff_ms(), &[] as &[&str]);
        let before_score = kept.len();
        if let Some(min) = self.settings.min_score {
            kept.retain(|p| p.popularity.unwrap_or(0) > min);
        }
        let filtered = dropped + unresolved + noisy + (before_score - kept.len());
        counter!("ingest_filtered_total").increment(filtered as u64);

        info!(target: "ingest", subreddit = sub, kept = kept.len(), filtered, "reddit unit collected");
        Ok(kept)
    }
}

#[async_trait]
impl SourceCollector for RedditCollector {
    fn kind(&self) -> SourceKind {
        SourceKind::Reddit
    }

    async fn collect(&self, unit: &str, options: &CollectOptions) -> CollectionResult {
        self.collect_unit(unit, options).await.into()
    }
}
