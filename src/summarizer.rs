//! Digest summarizer: provider abstraction + file cache + daily limit.
//!
//! Used by the reduction stage to squeeze a large multi-source payload into a
//! short factual digest. Providers only do the remote call; the caching wrapper
//! owns the cache directory and the per-day call budget.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::ai::AiConfig;

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Condense `payload` into at most roughly `max_words` words.
    async fn summarize(&self, payload: &str, max_words: usize) -> anyhow::Result<String>;
    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;
}

pub type DynSummarizer = Arc<dyn Summarizer>;

/// Instructions shared by the remote providers.
pub fn system_prompt(max_words: usize) -> String {
    format!(
        "You compress crypto social chatter into a dense digest for a downstream analyst. \
         Keep only factual sentiment and concrete catalysts per coin symbol (listings, unlocks, \
         hacks, partnerships, whale flows, ETF news). Drop jokes, greetings, shilling and \
         duplicates. Group by symbol, keep source and time-window labels when given. \
         Plain text, no preamble, at most {max_words} words."
    )
}

/// Factory: build a summarizer according to config and environment variables.
///
/// * If `AI_TEST_MODE=mock`, returns a deterministic mock wrapped with caching.
/// * Else if `config.enabled == false`, returns a disabled summarizer.
/// * Else builds the real provider wrapped with caching + daily limit.
pub fn build_summarizer(config: &AiConfig) -> anyhow::Result<DynSummarizer> {
    let cache_dir = PathBuf::from(&config.cache_dir);
    if std::env::var("AI_TEST_MODE").map(|v| v == "mock").unwrap_or(false) {
        return Ok(Arc::new(CachingSummarizer::new(
            MockSummarizer::default(),
            cache_dir,
            config.daily_limit,
        )));
    }
    if !config.enabled {
        return Ok(Arc::new(DisabledSummarizer));
    }

    let timeout = Duration::from_millis(config.timeout_ms);
    let model = (!config.model.trim().is_empty()).then(|| config.model.trim());
    let out: DynSummarizer = match config.provider.as_str() {
        "openai" => Arc::new(CachingSummarizer::new(
            OpenAiSummarizer::new(&config.api_key, model, config.base_url.as_deref(), timeout)?,
            cache_dir,
            config.daily_limit,
        )),
        "anthropic" => Arc::new(CachingSummarizer::new(
            AnthropicSummarizer::new(&config.api_key, model, config.base_url.as_deref(), timeout)?,
            cache_dir,
            config.daily_limit,
        )),
        "mock" => Arc::new(CachingSummarizer::new(
            MockSummarizer::default(),
            cache_dir,
            config.daily_limit,
        )),
        other => bail!("unsupported summarizer provider {other:?}"),
    };
    info!(provider = out.name(), daily_limit = config.daily_limit, "summarizer ready");
    Ok(out)
}

fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("crypto-pulse/0.1 (digest summarizer)")
        .connect_timeout(Duration::from_secs(4))
        .timeout(timeout)
        .build()
        .context("building summarizer http client")
}

/// Output budget for a word ceiling; generous because tokens < words is rare.
fn max_tokens_for(max_words: usize) -> u32 {
    (max_words.saturating_mul(2)).clamp(64, 8_192) as u32
}

// ------------------------------------------------------------
// OpenAI (Chat Completions)
// ------------------------------------------------------------

pub struct OpenAiSummarizer {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiSummarizer {
    /// Defaults to gpt-4o-mini against api.openai.com.
    pub fn new(
        api_key: &str,
        model: Option<&str>,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            api_key: api_key.to_string(),
            model: model.unwrap_or("gpt-4o-mini").to_string(),
            base_url: base_url.unwrap_or("https://api.openai.com").trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, payload: &str, max_words: usize) -> anyhow::Result<String> {
        if self.api_key.is_empty() {
            bail!("OpenAI API key missing");
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            #[serde(default)]
            content: Option<String>,
        }

        let sys = system_prompt(max_words);
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &sys,
                },
                Msg {
                    role: "user",
                    content: payload,
                },
            ],
            temperature: 0.2,
            max_tokens: max_tokens_for(max_words),
        };

        let resp = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("openai request")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("openai returned status {}", status.as_u16());
        }
        let body: Resp = resp.json().await.context("openai response body")?;
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        non_empty(text)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// ------------------------------------------------------------
// Anthropic (Messages API)
// ------------------------------------------------------------

pub struct AnthropicSummarizer {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicSummarizer {
    pub fn new(
        api_key: &str,
        model: Option<&str>,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            api_key: api_key.to_string(),
            model: model.unwrap_or("claude-3-5-haiku-latest").to_string(),
            base_url: base_url
                .unwrap_or("https://api.anthropic.com")
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

#[async_trait]
impl Summarizer for AnthropicSummarizer {
    async fn summarize(&self, payload: &str, max_words: usize) -> anyhow::Result<String> {
        if self.api_key.is_empty() {
            bail!("Anthropic API key missing");
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            max_tokens: u32,
            system: &'a str,
            messages: Vec<Msg<'a>>,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            content: Vec<Block>,
        }
        #[derive(Deserialize)]
        struct Block {
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            text: Option<String>,
        }

        let sys = system_prompt(max_words);
        let req = Req {
            model: &self.model,
            max_tokens: max_tokens_for(max_words),
            system: &sys,
            messages: vec![Msg {
                role: "user",
                content: payload,
            }],
        };

        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&req)
            .send()
            .await
            .context("anthropic request")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("anthropic returned status {}", status.as_u16());
        }
        let body: Resp = resp.json().await.context("anthropic response body")?;
        let text = body
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n");
        non_empty(text)
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

fn non_empty(text: String) -> anyhow::Result<String> {
    let t = text.trim();
    if t.is_empty() {
        Err(anyhow!("provider returned an empty digest"))
    } else {
        Ok(t.to_string())
    }
}

// ------------------------------------------------------------
// Disabled + mock
// ------------------------------------------------------------

/// Always fails; the reduction stage then falls back to plain truncation.
pub struct DisabledSummarizer;

#[async_trait]
impl Summarizer for DisabledSummarizer {
    async fn summarize(&self, _payload: &str, _max_words: usize) -> anyhow::Result<String> {
        Err(anyhow!("summarizer disabled"))
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Deterministic stand-in for tests and local runs.
///
/// Returns `fixed` when set, otherwise the first `max_words` words of the payload.
#[derive(Default)]
pub struct MockSummarizer {
    pub fixed: Option<String>,
    calls: AtomicUsize,
}

impl MockSummarizer {
    pub fn with_fixed(text: &str) -> Self {
        Self {
            fixed: Some(text.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, payload: &str, max_words: usize) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(match &self.fixed {
            Some(f) => f.clone(),
            None => payload.split_whitespace().take(max_words).collect::<Vec<_>>().join(" "),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// ------------------------------------------------------------
// Caching wrapper (file cache + daily limit)
// ------------------------------------------------------------

pub struct CachingSummarizer<S: Summarizer> {
    inner: S,
    cache_dir: PathBuf,
    daily_limit_max: u32,
    counter: Mutex<DailyCounter>,
}

impl<S: Summarizer> CachingSummarizer<S> {
    pub fn new(inner: S, cache_dir: PathBuf, daily_limit_max: u32) -> Self {
        if let Err(e) = fs::create_dir_all(&cache_dir) {
            warn!(dir = %cache_dir.display(), error = %e, "summary cache dir unavailable");
        }
        let counter = Mutex::new(load_daily_counter(&cache_dir).unwrap_or_default());
        Self {
            inner,
            cache_dir,
            daily_limit_max,
            counter,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn lock_counter(&self) -> std::sync::MutexGuard<'_, DailyCounter> {
        self.counter.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl<S: Summarizer> Summarizer for CachingSummarizer<S> {
    async fn summarize(&self, payload: &str, max_words: usize) -> anyhow::Result<String> {
        let key = cache_key(self.inner.name(), max_words, payload);
        // Cache hits are free and do not count against the daily budget.
        if let Some(hit) = read_cache_file(&self.cache_dir, &key) {
            debug!(provider = self.inner.name(), "summary cache hit");
            return Ok(hit.digest);
        }

        {
            let mut g = self.lock_counter();
            if g.is_expired() {
                g.reset_to_today();
                let _ = save_daily_counter(&self.cache_dir, &g);
            }
            if g.count >= self.daily_limit_max {
                bail!("daily summarizer limit reached ({})", self.daily_limit_max);
            }
        }

        let digest = self.inner.summarize(payload, max_words).await?;
        if let Err(e) = write_cache_file(&self.cache_dir, &key, &CachedDigest { digest: digest.clone() }) {
            warn!(error = %e, "failed to write summary cache entry");
        }
        let mut g = self.lock_counter();
        g.count = g.count.saturating_add(1);
        let _ = save_daily_counter(&self.cache_dir, &g);
        Ok(digest)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedDigest {
    digest: String,
}

fn cache_key(provider: &str, max_words: usize, payload: &str) -> String {
    let mut h = Sha256::new();
    h.update(provider.as_bytes());
    h.update(max_words.to_le_bytes());
    h.update(payload.as_bytes());
    format!("{:x}", h.finalize())
}

fn cache_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

fn read_cache_file(dir: &Path, key: &str) -> Option<CachedDigest> {
    let s = fs::read_to_string(cache_path(dir, key)).ok()?;
    serde_json::from_str(&s).ok()
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(&tmp, json)?;
    fs::rename(tmp, path)
}

fn write_cache_file(dir: &Path, key: &str, value: &CachedDigest) -> io::Result<()> {
    write_json_atomic(&cache_path(dir, key), value)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DailyCounter {
    date: String,
    count: u32,
}

impl Default for DailyCounter {
    fn default() -> Self {
        Self {
            date: today(),
            count: 0,
        }
    }
}

impl DailyCounter {
    fn is_expired(&self) -> bool {
        self.date != today()
    }
    fn reset_to_today(&mut self) {
        self.date = today();
        self.count = 0;
    }
}

fn today() -> String {
    chrono::Utc::now().date_naive().to_string()
}

fn counter_path(dir: &Path) -> PathBuf {
    dir.join("daily_count.json")
}

fn load_daily_counter(dir: &Path) -> io::Result<DailyCounter> {
    let s = fs::read_to_string(counter_path(dir))?;
    serde_json::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn save_daily_counter(dir: &Path, dc: &DailyCounter) -> io::Result<()> {
    write_json_atomic(&counter_path(dir), dc)
}
