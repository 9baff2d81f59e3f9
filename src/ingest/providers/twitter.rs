// src/ingest/providers/twitter.rs
//! X/Twitter timeline collector (RapidAPI "twitter241"-style proxy).
//!
//! Units are numeric user ids. Timelines come back as a deeply nested
//! instruction list; we walk it with JSON pointers and only deserialize the
//! `legacy` tweet object into a typed struct.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::FetchError;
use crate::ingest::fetcher::{FetchRequest, RateLimitedFetcher};
use crate::ingest::types::{CollectOptions, CollectionResult, SourceCollector, SourceItem, SourceKind};
use crate::ingest::{clean_text, filter_recent, timestamp};

const INSTRUCTION_PATHS: &[&str] = &[
    "/result/timeline/instructions",
    "/data/user/result/timeline_v2/timeline/instructions",
    "/data/user/result/timeline/timeline/instructions",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitterSettings {
    pub base_url: String,
    pub rapidapi_host: String,
    /// Resolved from `api_key_env` at config load when not set explicitly.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub count_per_page: u32,
    pub max_pages: u32,
    pub noise_patterns: Vec<String>,
}

impl Default for TwitterSettings {
    fn default() -> Self {
        Self {
            base_url: "https://twitter241.p.rapidapi.com".to_string(),
            rapidapi_host: "twitter241.p.rapidapi.com".to_string(),
            api_key: None,
            api_key_env: "RAPIDAPI_KEY".to_string(),
            count_per_page: 20,
            max_pages: 1,
            noise_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Legacy {
    #[serde(default)]
    full_text: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    created_at: Value,
    #[serde(default)]
    favorite_count: Option<i64>,
    #[serde(default)]
    retweet_count: Option<i64>,
    #[serde(default)]
    id_str: Option<String>,
}

/// One page of a parsed timeline.
#[derive(Debug, Default)]
struct TimelinePage {
    tweets: Vec<(Legacy, Option<String>)>,
    bottom_cursor: Option<String>,
}

fn parse_timeline(body: &Value) -> Result<TimelinePage, FetchError> {
    let instructions = INSTRUCTION_PATHS
        .iter()
        .find_map(|p| body.pointer(p))
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Parse("timeline instructions missing".to_string()))?;

    let mut page = TimelinePage::default();
    for instr in instructions {
        if instr.get("type").and_then(Value::as_str) != Some("TimelineAddEntries") {
            continue;
        }
        let Some(entries) = instr.get("entries").and_then(Value::as_array) else {
            continue;
        };
        for entry in entries {
            let Some(content) = entry.get("content") else {
                continue;
            };
            if content.get("cursorType").and_then(Value::as_str) == Some("Bottom") {
                page.bottom_cursor = content.get("value").and_then(Value::as_str).map(str::to_string);
                continue;
            }
            let Some(mut result) = content.pointer("/itemContent/tweet_results/result") else {
                continue;
            };
            // Visibility-limited tweets wrap the real payload one level deeper.
            if result.get("__typename").and_then(Value::as_str) == Some("TweetWithVisibilityResults") {
                if let Some(inner) = result.get("tweet") {
                    result = inner;
                }
            }
            let Some(legacy) = result.get("legacy") else {
                continue;
            };
            let legacy: Legacy = serde_json::from_value(legacy.clone())
                .map_err(|e| FetchError::Parse(format!("tweet legacy: {e}")))?;
            let screen_name = result
                .pointer("/core/user_results/result/legacy/screen_name")
                .and_then(Value::as_str)
                .map(str::to_string);
            page.tweets.push((legacy, screen_name));
        }
    }
    Ok(page)
}

pub struct TwitterCollector {
    fetcher: Arc<RateLimitedFetcher>,
    settings: TwitterSettings,
}

impl TwitterCollector {
    pub fn new(fetcher: Arc<RateLimitedFetcher>, settings: TwitterSettings) -> Self {
        Self { fetcher, settings }
    }

    fn request(&self, user_id: &str, cursor: Option<&str>) -> FetchRequest {
        let mut req = FetchRequest::get(format!(
            "{}/user-tweets",
            self.settings.base_url.trim_end_matches('/')
        ))
        .query("user", user_id)
        .query("count", self.settings.count_per_page)
        .header("X-RapidAPI-Host", self.settings.rapidapi_host.clone());
        if let Some(key) = &self.settings.api_key {
            req = req.header("X-RapidAPI-Key", key.clone());
        }
        if let Some(c) = cursor {
            req = req.query("cursor", c);
        }
        req
    }

    fn to_item(legacy: Legacy, screen_name: Option<String>, user_id: &str, opts: &CollectOptions) -> Option<SourceItem> {
        let created_at_ms = timestamp::parse_value(&legacy.created_at)?;
        let text = legacy.full_text.or(legacy.text).unwrap_or_default();
        let origin = screen_name.clone().unwrap_or_else(|| user_id.to_string());
        let url = match (&screen_name, &legacy.id_str) {
            (Some(user), Some(id)) => Some(format!("https://x.com/{user}/status/{id}")),
            _ => None,
        };
        Some(SourceItem {
            kind: SourceKind::Twitter,
            origin,
            text: clean_text(&text, opts.max_text_chars),
            created_at_ms,
            popularity: legacy.favorite_count.map(|likes| likes + legacy.retweet_count.unwrap_or(0)),
            author: screen_name,
            url,
        })
    }

    async fn collect_unit(&self, user_id: &str, opts: &CollectOptions) -> Result<Vec<SourceItem>, FetchError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(FetchError::Parse("empty twitter user id".to_string()));
        }

        let mut raw = Vec::new();
        let mut unresolved = 0usize;
        let mut cursor: Option<String> = None;

        for _ in 0..self.settings.max_pages.max(1) {
            let body = self.fetcher.fetch(&self.request(user_id, cursor.as_deref())).await?;
            let page = parse_timeline(&body)?;
            let page_len = page.tweets.len();
            let mut oldest = i64::MAX;
            for (legacy, screen_name) in page.tweets {
                match Self::to_item(legacy, screen_name, user_id, opts) {
                    Some(item) => {
                        oldest = oldest.min(item.created_at_ms);
                        raw.push(item);
                    }
                    None => unresolved += 1,
                }
            }
            cursor = page.bottom_cursor;
            if cursor.is_none() || page_len == 0 || oldest < opts.cutoff_ms() {
                break;
            }
        }

        counter!("ingest_items_total", "source" => "twitter").increment((raw.len() + unresolved) as u64);
        let (kept, dropped) = filter_recent(raw, opts.cutoff_ms(), &self.settings.noise_patterns);
        counter!("ingest_filtered_total").increment((dropped + unresolved) as u64);

        info!(target: "ingest", user_id, kept = kept.len(), "twitter unit collected");
        Ok(kept)
    }
}

#[async_trait]
impl SourceCollector for TwitterCollector {
    fn kind(&self) -> SourceKind {
        SourceKind::Twitter
    }

    async fn collect(&self, unit: &str, options: &CollectOptions) -> CollectionResult {
        self.collect_unit(unit, options).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(text: &str, created_at: &str, likes: i64) -> Value {
        json!({
            "content": {
                "itemContent": {
                    "tweet_results": {
                        "result": {
                            "legacy": {
                                "full_text": text,
                                "created_at": created_at,
                                "favorite_count": likes,
                                "retweet_count": 1,
                                "id_str": "42"
                            },
                            "core": { "user_results": { "result": { "legacy": { "screen_name": "whale_alert" } } } }
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn parses_entries_and_bottom_cursor() {
        let body = json!({
            "result": { "timeline": { "instructions": [
                { "type": "TimelineClearCache" },
                { "type": "TimelineAddEntries", "entries": [
                    entry("$SOL breaking out", "Wed Oct 10 20:19:24 +0000 2018", 10),
                    { "content": { "cursorType": "Top", "value": "top-c" } },
                    { "content": { "cursorType": "Bottom", "value": "bottom-c" } }
                ]}
            ]}}
        });
        let page = parse_timeline(&body).unwrap();
        assert_eq!(page.tweets.len(), 1);
        assert_eq!(page.bottom_cursor.as_deref(), Some("bottom-c"));
        assert_eq!(page.tweets[0].1.as_deref(), Some("whale_alert"));
    }

    #[test]
    fn visibility_wrapper_is_unwrapped() {
        let body = json!({
            "data": { "user": { "result": { "timeline_v2": { "timeline": { "instructions": [
                { "type": "TimelineAddEntries", "entries": [
                    { "content": { "itemContent": { "tweet_results": { "result": {
                        "__typename": "TweetWithVisibilityResults",
                        "tweet": { "legacy": { "full_text": "hidden gem", "created_at": "Wed Oct 10 20:19:24 +0000 2018" } }
                    }}}}}
                ]}
            ]}}}}}
        });
        let page = parse_timeline(&body).unwrap();
        assert_eq!(page.tweets.len(), 1);
        assert_eq!(page.tweets[0].0.full_text.as_deref(), Some("hidden gem"));
    }

    #[test]
    fn missing_instructions_is_parse_error() {
        let err = parse_timeline(&json!({"errors": []})).unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }
}
