// src/ingest/providers/telegram.rs
//! Telegram collector, reading chat history through an HTTP bridge
//! (`GET {base}/api/telegram/messages?chat=&limit=&offset=`).
//!
//! The bridge owns the MTProto session; we only see JSON pages of messages.
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::FetchError;
use crate::ingest::fetcher::{FetchRequest, RateLimitedFetcher};
use crate::ingest::types::{CollectOptions, CollectionResult, SourceCollector, SourceItem, SourceKind};
use crate::ingest::{clean_text, filter_recent, timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub base_url: String,
    pub page_size: u32,
    pub max_pages: u32,
    /// Shorter messages ("gm", stickers, "+1") are dropped.
    pub min_message_chars: usize,
    pub noise_patterns: Vec<String>,
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3001".to_string(),
            page_size: 100,
            max_pages: 5,
            min_message_chars: 10,
            noise_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    chat: Option<String>,
    #[serde(default)]
    chat_title: Option<String>,
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    date: Value,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    sender_name: Option<String>,
    #[serde(default)]
    sender_username: Option<String>,
    #[serde(default)]
    views: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Messages {
    messages: Vec<Message>,
}

/// Bridges differ in how much envelope they put around the list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessagesPage {
    Plain(Messages),
    Wrapped {
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        data: Option<Messages>,
    },
    Bare(Vec<Message>),
}

impl MessagesPage {
    fn into_messages(self) -> Result<Vec<Message>, FetchError> {
        match self {
            MessagesPage::Wrapped {
                success: Some(false),
                error,
                ..
            } => Err(FetchError::Parse(
                error.unwrap_or_else(|| "bridge reported failure".to_string()),
            )),
            MessagesPage::Wrapped { data: None, .. } => {
                Err(FetchError::Parse("no messages in bridge response".to_string()))
            }
            MessagesPage::Wrapped { data: Some(data), .. } | MessagesPage::Plain(data) => Ok(data.messages),
            MessagesPage::Bare(v) => Ok(v),
        }
    }
}

pub struct TelegramCollector {
    fetcher: Arc<RateLimitedFetcher>,
    settings: TelegramSettings,
}

impl TelegramCollector {
    pub fn new(fetcher: Arc<RateLimitedFetcher>, settings: TelegramSettings) -> Self {
        Self { fetcher, settings }
    }

    /// "@whale_chat", "t.me/whale_chat" and "https://t.me/whale_chat" all name the same chat.
    pub fn chat_handle(unit: &str) -> &str {
        let u = unit.trim().trim_end_matches('/');
        let u = u
            .strip_prefix("https://")
            .or_else(|| u.strip_prefix("http://"))
            .unwrap_or(u);
        let u = u.strip_prefix("t.me/").unwrap_or(u);
        u.trim_start_matches('@')
    }

    fn to_item(&self, msg: Message, chat: &str, opts: &CollectOptions) -> Option<SourceItem> {
        let created_at_ms = timestamp::parse_value(&msg.date)?;
        let text = clean_text(msg.text.as_deref().unwrap_or_default(), opts.max_text_chars);
        if text.chars().count() < self.settings.min_message_chars {
            return None;
        }
        let origin = msg
            .chat_title
            .or(msg.chat)
            .unwrap_or_else(|| chat.to_string());
        let url = msg.message_id.map(|id| format!("https://t.me/{chat}/{id}"));
        Some(SourceItem {
            kind: SourceKind::Telegram,
            origin,
            text,
            created_at_ms,
            popularity: msg.views,
            author: msg.sender_username.or(msg.sender_name),
            url,
        })
    }

    async fn collect_unit(&self, unit: &str, opts: &CollectOptions) -> Result<Vec<SourceItem>, FetchError> {
        let chat = Self::chat_handle(unit);
        if chat.is_empty() {
            return Err(FetchError::Parse(format!("invalid telegram chat unit {unit:?}")));
        }
        let url = format!("{}/api/telegram/messages", self.settings.base_url.trim_end_matches('/'));
        let cutoff = opts.cutoff_ms();

        let mut raw = Vec::new();
        let mut seen = 0usize;
        let mut offset = 0u32;

        for page in 0..self.settings.max_pages.max(1) {
            let req = FetchRequest::get(&url)
                .query("chat", chat)
                .query("limit", self.settings.page_size)
                .query("offset", offset);
            let body = self.fetcher.fetch(&req).await?;
            let messages = serde_json::from_value::<MessagesPage>(body)
                .map_err(|e| FetchError::Parse(format!("telegram page: {e}")))?
                .into_messages()?;

            let page_len = messages.len();
            seen += page_len;
            let mut reached_cutoff = false;
            for msg in messages {
                if timestamp::parse_value(&msg.date).is_some_and(|ts| ts < cutoff) {
                    reached_cutoff = true;
                }
                if let Some(item) = self.to_item(msg, chat, opts) {
                    raw.push(item);
                }
            }
            debug!(target: "ingest", chat, page, messages = page_len, "telegram page");

            if reached_cutoff || page_len < self.settings.page_size as usize {
                break;
            }
            offset += self.settings.page_size;
        }

        counter!("ingest_items_total", "source" => "telegram").increment(seen as u64);
        let resolved = raw.len();
        let (kept, dropped) = filter_recent(raw, cutoff, &self.settings.noise_patterns);
        counter!("ingest_filtered_total").increment((seen - resolved + dropped) as u64);

        info!(target: "ingest", chat, kept = kept.len(), "telegram unit collected");
        Ok(kept)
    }
}

#[async_trait]
impl SourceCollector for TelegramCollector {
    fn kind(&self) -> SourceKind {
        SourceKind::Telegram
    }

    async fn collect(&self, unit: &str, options: &CollectOptions) -> CollectionResult {
        self.collect_unit(unit, options).await.into()
    }
}
