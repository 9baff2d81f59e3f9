// src/config/pipeline.rs
//! Pipeline configuration (`config/pipeline.toml` or `.json`).
//!
//! Files only need to name what they change: the file is merged key by key
//! over the serialized defaults before deserializing, so a `[rate_limits.twitter]`
//! table that sets one field keeps the RapidAPI header names.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::ingest::fetcher::RateLimitPolicy;
use crate::ingest::market::MarketSettings;
use crate::ingest::providers::{RedditSettings, TelegramSettings, TwitterSettings};
use crate::orchestrator::OrchestratorConfig;
use crate::pipeline::ModesConfig;
use crate::reduce::ReductionConfig;
use crate::windows::{default_windows, TimeWindow, WindowSet};

const ENV_PATH: &str = "PULSE_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub reddit: RateLimitPolicy,
    pub twitter: RateLimitPolicy,
    pub telegram: RateLimitPolicy,
    pub market: RateLimitPolicy,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            reddit: RateLimitPolicy::named("reddit"),
            twitter: RateLimitPolicy::rapidapi("twitter"),
            // The bridge publishes no quota headers; pace one chat every 1.5s.
            telegram: RateLimitPolicy {
                fast_delay_ms: 1_500,
                slow_delay_ms: 1_500,
                ..RateLimitPolicy::named("telegram")
            },
            market: RateLimitPolicy {
                fast_delay_ms: 0,
                request_timeout_ms: 30_000,
                ..RateLimitPolicy::named("market")
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Mode label as accepted by `AnalysisMode::parse`.
    pub mode: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 900,
            mode: "simple".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub reddit: RedditSettings,
    pub twitter: TwitterSettings,
    pub telegram: TelegramSettings,
    pub market: MarketSettings,
    pub rate_limits: RateLimits,
    /// Ascending, non-overlapping age windows for velocity modes.
    pub windows: Vec<TimeWindow>,
    pub reduction: ReductionConfig,
    pub orchestrator: OrchestratorConfig,
    pub modes: ModesConfig,
    pub scheduler: SchedulerConfig,
    pub server: ServerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reddit: RedditSettings::default(),
            twitter: TwitterSettings::default(),
            telegram: TelegramSettings::default(),
            market: MarketSettings::default(),
            rate_limits: RateLimits::default(),
            windows: default_windows(),
            reduction: ReductionConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            modes: ModesConfig::default(),
            scheduler: SchedulerConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from an explicit path (TOML or JSON by extension) and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("reading pipeline config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let overlay: Value = if ext == "json" {
            serde_json::from_str(&content).context("parsing pipeline config JSON")?
        } else {
            let t: toml::Value = toml::from_str(&content).context("parsing pipeline config TOML")?;
            serde_json::to_value(t)?
        };
        Self::from_overlay(overlay)
    }

    /// Load using env var + fallbacks:
    /// 1) $PULSE_CONFIG_PATH
    /// 2) config/pipeline.toml
    /// 3) config/pipeline.json
    /// 4) defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
        for candidate in ["config/pipeline.toml", "config/pipeline.json"] {
            let pb = PathBuf::from(candidate);
            if pb.exists() {
                return Self::load_from(&pb);
            }
        }
        let mut cfg = Self::default();
        cfg.resolve_secrets();
        cfg.window_set()?;
        Ok(cfg)
    }

    fn from_overlay(overlay: Value) -> Result<Self> {
        let mut base = serde_json::to_value(Self::default())?;
        merge_json(&mut base, overlay);
        let mut cfg: Self = serde_json::from_value(base).context("pipeline config shape")?;
        cfg.resolve_secrets();
        cfg.window_set()?;
        Ok(cfg)
    }

    /// Fill API keys from the environment where the file did not set them.
    pub fn resolve_secrets(&mut self) {
        if self.twitter.api_key.is_none() {
            self.twitter.api_key = std::env::var(&self.twitter.api_key_env).ok().filter(|k| !k.is_empty());
        }
        if self.market.api_key.is_none() {
            self.market.api_key = std::env::var(&self.market.api_key_env).ok().filter(|k| !k.is_empty());
        }
    }

    /// Validated windows. Misordered or overlapping windows fail here, at load.
    pub fn window_set(&self) -> Result<WindowSet, PipelineError> {
        WindowSet::new(self.windows.clone())
    }
}

/// Objects merge recursively; anything else in `overlay` replaces `base`.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            for (k, v) in o {
                match b.get_mut(&k) {
                    Some(slot) => merge_json(slot, v),
                    None => {
                        b.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}
