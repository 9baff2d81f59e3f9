// src/pipeline.rs
//! One collection run end to end:
//! fan-out (with the market snapshot fetched alongside) → dedup → mode filters →
//! window partition + velocity (velocity modes) → reduction → market merge.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineWarning};
use crate::ingest::dedup_items;
use crate::ingest::fetcher::{system_clock, Clock, RateLimitPolicy, RateLimitedFetcher};
use crate::ingest::market::{MarketDataClient, MarketSnapshot, UNAVAILABLE_SUMMARY};
use crate::ingest::providers::{RedditCollector, TelegramCollector, TwitterCollector};
use crate::ingest::types::{CollectOptions, ProgressFn, SourceItem, SourceKind, SourceUnits};
use crate::merge::{merge, AnalysisRecord};
use crate::orchestrator::{AbortFlag, FanOutOrchestrator};
use crate::reduce::{ContextReducer, ReducedContext};
use crate::summarizer::DynSummarizer;
use crate::windows::{cashtags, mentions, mentions_symbol, rank_by_velocity, WindowSet};

/// What the downstream synthesis step is asked to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// 24h outlook for the focus coins.
    Simple,
    /// Hour-by-hour outlook for the next 24h.
    Hourly,
    /// Outlook for the next 20:00 Moscow time (17:00 UTC).
    #[serde(rename = "today_20msk")]
    Today20Msk,
    /// Small caps discovered from cashtags, majors and stables excluded.
    Altcoins,
    /// Everything about one ticker.
    SingleCoin(String),
    /// Recency-weighted mention velocity; the only mode that partitions and compresses.
    SmartMoney,
}

impl AnalysisMode {
    /// `symbol` is required for, and only used by, `single_coin`.
    pub fn parse(label: &str, symbol: Option<&str>) -> Result<Self, PipelineError> {
        let mode = match label.trim().to_ascii_lowercase().as_str() {
            "" | "simple" => AnalysisMode::Simple,
            "hourly" => AnalysisMode::Hourly,
            "today_20msk" => AnalysisMode::Today20Msk,
            "altcoins" => AnalysisMode::Altcoins,
            "smart_money" => AnalysisMode::SmartMoney,
            "single_coin" => {
                let sym = symbol
                    .map(|s| s.trim().trim_start_matches('$').to_uppercase())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| PipelineError::Config("single_coin mode needs a symbol".into()))?;
                AnalysisMode::SingleCoin(sym)
            }
            other => return Err(PipelineError::Config(format!("unknown analysis mode {other:?}"))),
        };
        Ok(mode)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Simple => "simple",
            AnalysisMode::Hourly => "hourly",
            AnalysisMode::Today20Msk => "today_20msk",
            AnalysisMode::Altcoins => "altcoins",
            AnalysisMode::SingleCoin(_) => "single_coin",
            AnalysisMode::SmartMoney => "smart_money",
        }
    }

    pub fn profile(&self, cfg: &ModesConfig, windows: &WindowSet, now_ms: i64) -> ModeProfile {
        let hours = |h: u32| ChronoDuration::hours(h as i64);
        let mut max_age = BTreeMap::from([
            (SourceKind::Reddit, hours(cfg.reddit_max_age_hours)),
            (SourceKind::Twitter, hours(cfg.twitter_max_age_hours)),
            (SourceKind::Telegram, hours(cfg.telegram_max_age_hours)),
        ]);
        let mut profile = ModeProfile {
            max_age: BTreeMap::new(),
            use_windows: false,
            compress: false,
            focus: cfg.focus_symbols.clone(),
            exclude: Vec::new(),
            forecast_target_ms: Some(now_ms + ChronoDuration::hours(24).num_milliseconds()),
        };
        match self {
            AnalysisMode::Simple | AnalysisMode::Hourly => {}
            AnalysisMode::Today20Msk => profile.forecast_target_ms = Some(next_20msk_target(now_ms)),
            AnalysisMode::Altcoins => {
                profile.focus = Vec::new();
                profile.exclude = cfg.altcoin_excluded.clone();
                profile.forecast_target_ms = Some(now_ms + ChronoDuration::days(7).num_milliseconds());
            }
            AnalysisMode::SingleCoin(sym) => profile.focus = vec![sym.clone()],
            AnalysisMode::SmartMoney => {
                let bound = ChronoDuration::milliseconds((windows.max_age_hours() * 3_600_000.0) as i64);
                for v in max_age.values_mut() {
                    *v = bound;
                }
                profile.use_windows = true;
                profile.compress = true;
                profile.focus = Vec::new();
                profile.exclude = cfg.altcoin_excluded.iter().filter(|s| is_stable(s)).cloned().collect();
            }
        }
        profile.max_age = max_age;
        profile
    }
}

fn is_stable(sym: &str) -> bool {
    matches!(sym, "USDT" | "USDC" | "DAI" | "FDUSD" | "TUSD")
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisMode::SingleCoin(s) => write!(f, "single_coin({s})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Next 20:00 MSK (17:00 UTC) strictly after `now_ms`.
pub fn next_20msk_target(now_ms: i64) -> i64 {
    let now = Utc.timestamp_millis_opt(now_ms).single().unwrap_or_else(Utc::now);
    let today = now.date_naive().and_hms_opt(17, 0, 0).map(|t| Utc.from_utc_datetime(&t));
    match today {
        Some(t) if t > now => t.timestamp_millis(),
        Some(t) => (t + ChronoDuration::days(1)).timestamp_millis(),
        None => now_ms,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModesConfig {
    pub reddit_max_age_hours: u32,
    pub twitter_max_age_hours: u32,
    pub telegram_max_age_hours: u32,
    /// Per-item cap while collecting, before stage-1 truncation.
    pub collect_text_chars: usize,
    pub focus_symbols: Vec<String>,
    pub altcoin_excluded: Vec<String>,
    /// How many discovered symbols become records in discovery modes.
    pub discovered_symbols: usize,
    pub single_coin_min_mentions: usize,
}

impl Default for ModesConfig {
    fn default() -> Self {
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        Self {
            reddit_max_age_hours: 72,
            twitter_max_age_hours: 48,
            telegram_max_age_hours: 48,
            collect_text_chars: 500,
            focus_symbols: s(&["BTC", "ETH", "XRP", "SOL"]),
            altcoin_excluded: s(&["BTC", "ETH", "USDT", "USDC"]),
            discovered_symbols: 10,
            single_coin_min_mentions: 3,
        }
    }
}

/// Resolved per-run behavior of a mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeProfile {
    pub max_age: BTreeMap<SourceKind, ChronoDuration>,
    pub use_windows: bool,
    pub compress: bool,
    /// Fixed record symbols; empty means discover from cashtags.
    pub focus: Vec<String>,
    pub exclude: Vec<String>,
    pub forecast_target_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectRequest {
    pub mode: AnalysisMode,
    pub units: SourceUnits,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub collected: usize,
    pub kept: usize,
    pub deduplicated: usize,
    /// Items past the last window bound (velocity modes only).
    pub outside_windows: usize,
    pub per_source: BTreeMap<SourceKind, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SingleCoinFocus {
    pub symbol: String,
    pub mention_count: usize,
    pub has_enough_data: bool,
}

/// Bounded hand-off to the synthesis step.
#[derive(Debug, Serialize)]
pub struct SynthesisPayload {
    pub mode: AnalysisMode,
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast_target: Option<DateTime<Utc>>,
    pub market_context: String,
    pub context: ReducedContext,
    pub records: Vec<AnalysisRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<SingleCoinFocus>,
    pub warnings: Vec<PipelineWarning>,
    pub stats: RunStats,
    pub cancelled: bool,
}

pub struct Pipeline {
    orchestrator: FanOutOrchestrator,
    market: Option<MarketDataClient>,
    reducer: ContextReducer,
    windows: WindowSet,
    modes: ModesConfig,
    clock: Clock,
}

impl Pipeline {
    pub fn new(orchestrator: FanOutOrchestrator, reducer: ContextReducer, windows: WindowSet, modes: ModesConfig) -> Self {
        Self {
            orchestrator,
            market: None,
            reducer,
            windows,
            modes,
            clock: system_clock(),
        }
    }

    pub fn with_market(mut self, market: MarketDataClient) -> Self {
        self.market = Some(market);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Wire one fetcher per provider, the collectors and the market client.
    pub fn from_config(
        cfg: &PipelineConfig,
        summarizer: DynSummarizer,
        progress: Option<ProgressFn>,
    ) -> Result<Self, PipelineError> {
        let windows = cfg.window_set()?;
        let fetcher = |p: &RateLimitPolicy| {
            RateLimitedFetcher::new(p.clone())
                .map(Arc::new)
                .map_err(|e| PipelineError::Config(format!("{} fetcher: {e}", p.provider)))
        };

        let mut orchestrator = FanOutOrchestrator::new(cfg.orchestrator.clone())
            .with_collector(Arc::new(RedditCollector::new(
                fetcher(&cfg.rate_limits.reddit)?,
                cfg.reddit.clone(),
            )))
            .with_collector(Arc::new(TwitterCollector::new(
                fetcher(&cfg.rate_limits.twitter)?,
                cfg.twitter.clone(),
            )))
            .with_collector(Arc::new(TelegramCollector::new(
                fetcher(&cfg.rate_limits.telegram)?,
                cfg.telegram.clone(),
            )));
        if let Some(p) = progress {
            orchestrator = orchestrator.with_progress(p);
        }

        let mut pipeline = Self::new(
            orchestrator,
            ContextReducer::new(cfg.reduction.clone(), summarizer),
            windows,
            cfg.modes.clone(),
        );
        if cfg.market.enabled {
            pipeline = pipeline.with_market(MarketDataClient::new(
                fetcher(&cfg.rate_limits.market)?,
                cfg.market.clone(),
            ));
        }
        Ok(pipeline)
    }

    pub fn windows(&self) -> &WindowSet {
        &self.windows
    }

    pub async fn run(&self, request: &CollectRequest, abort: &AbortFlag) -> Result<SynthesisPayload, PipelineError> {
        let now_ms = (self.clock)();
        let profile = request.mode.profile(&self.modes, &self.windows, now_ms);
        let options: BTreeMap<SourceKind, CollectOptions> = profile
            .max_age
            .iter()
            .map(|(k, age)| {
                (
                    *k,
                    CollectOptions::new(now_ms, *age).with_max_text_chars(self.modes.collect_text_chars),
                )
            })
            .collect();
        info!(target: "pipeline", mode = %request.mode, sources = request.units.len(), "collection run started");

        let market_fut = async {
            match &self.market {
                Some(m) => m.snapshot_or_empty().await,
                None => (MarketSnapshot::new(), None),
            }
        };
        let (fan, (snapshot, market_warning)) =
            tokio::join!(self.orchestrator.run(&request.units, &options, abort), market_fut);

        let cancelled = fan.is_cancelled();
        let mut warnings = fan.warnings();
        warnings.extend(market_warning);
        let mut stats = RunStats {
            collected: fan.item_count(),
            per_source: fan.items_by_source(),
            ..RunStats::default()
        };

        let (items, deduplicated) = dedup_items(fan.into_items()?);
        stats.deduplicated = deduplicated;
        counter!("ingest_dedup_total").increment(deduplicated as u64);

        let (items, focus) = match &request.mode {
            AnalysisMode::SingleCoin(sym) => {
                let hits: Vec<SourceItem> = items.into_iter().filter(|it| mentions_symbol(&it.text, sym)).collect();
                let f = SingleCoinFocus {
                    symbol: sym.clone(),
                    mention_count: hits.len(),
                    has_enough_data: hits.len() >= self.modes.single_coin_min_mentions,
                };
                if !f.has_enough_data {
                    warn!(target: "pipeline", symbol = %sym, mentions = hits.len(), "thin coverage for single coin");
                }
                (hits, Some(f))
            }
            _ => (items, None),
        };

        let (items, records) = if profile.use_windows {
            let partition = self.windows.partition(items, now_ms);
            stats.outside_windows = partition.dropped;
            let records: Vec<AnalysisRecord> = rank_by_velocity(&partition, None)
                .into_iter()
                .filter(|s| !profile.exclude.contains(&s.symbol))
                .take(self.modes.discovered_symbols)
                .map(|s| {
                    AnalysisRecord::new(&s.symbol)
                        .with_field("mentions", s.mentions.iter().sum::<usize>())
                        .with_field("window_mentions", s.mentions.clone())
                        .with_field("velocity", s.velocity)
                })
                .collect();
            (partition.into_items(), records)
        } else {
            let records = self.focus_records(&items, &profile);
            (items, records)
        };
        stats.kept = items.len();
        counter!("ingest_kept_total").increment(items.len() as u64);

        let windows = profile.use_windows.then_some((&self.windows, now_ms));
        let context = self.reducer.reduce(items, windows, profile.compress).await;
        let records = merge(records, &snapshot);

        gauge!("pipeline_last_run_ts").set(now_ms as f64 / 1_000.0);
        info!(
            target: "pipeline",
            mode = %request.mode,
            collected = stats.collected,
            kept = stats.kept,
            records = records.len(),
            warnings = warnings.len(),
            cancelled,
            "collection run finished"
        );

        Ok(SynthesisPayload {
            mode: request.mode.clone(),
            generated_at: Utc.timestamp_millis_opt(now_ms).single().unwrap_or_else(Utc::now),
            forecast_target: profile
                .forecast_target_ms
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            market_context: if snapshot.is_empty() {
                UNAVAILABLE_SUMMARY.to_string()
            } else {
                snapshot.summary()
            },
            context,
            records,
            focus,
            warnings,
            stats,
            cancelled,
        })
    }

    /// Fixed focus symbols, or the most mentioned cashtags when the mode discovers them.
    fn focus_records(&self, items: &[SourceItem], profile: &ModeProfile) -> Vec<AnalysisRecord> {
        let symbols: Vec<String> = if profile.focus.is_empty() {
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for it in items {
                let mut tags = cashtags(&it.text);
                tags.dedup();
                for t in tags {
                    *counts.entry(t).or_default() += 1;
                }
            }
            let mut ranked: Vec<(String, usize)> =
                counts.into_iter().filter(|(s, _)| !profile.exclude.contains(s)).collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            ranked.into_iter().take(self.modes.discovered_symbols).map(|(s, _)| s).collect()
        } else {
            profile.focus.clone()
        };
        symbols
            .into_iter()
            .map(|s| {
                let n = mentions(items, &s);
                AnalysisRecord::new(&s).with_field("mentions", n)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::windows::default_windows;

    #[test]
    fn parse_modes() {
        assert_eq!(AnalysisMode::parse("Hourly", None).unwrap(), AnalysisMode::Hourly);
        assert_eq!(
            AnalysisMode::parse("single_coin", Some("$sol")).unwrap(),
            AnalysisMode::SingleCoin("SOL".into())
        );
        assert!(AnalysisMode::parse("single_coin", None).is_err());
        assert!(AnalysisMode::parse("yolo", None).is_err());
        assert_eq!(serde_json::to_value(AnalysisMode::Today20Msk).unwrap(), "today_20msk");
    }

    #[test]
    fn smart_money_uses_window_bound_and_compression() {
        let set = WindowSet::new(default_windows()).unwrap();
        let p = AnalysisMode::SmartMoney.profile(&ModesConfig::default(), &set, 0);
        assert!(p.use_windows && p.compress);
        assert_eq!(p.max_age[&SourceKind::Reddit], ChronoDuration::hours(18));

        let simple = AnalysisMode::Simple.profile(&ModesConfig::default(), &set, 0);
        assert!(!simple.use_windows && !simple.compress);
        assert_eq!(simple.max_age[&SourceKind::Reddit], ChronoDuration::hours(72));
        assert_eq!(simple.max_age[&SourceKind::Twitter], ChronoDuration::hours(48));
        assert_eq!(simple.focus, vec!["BTC", "ETH", "XRP", "SOL"]);
    }

    #[test]
    fn msk_target_rolls_over_at_17_utc() {
        let morning = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap().timestamp_millis();
        let evening = Utc.with_ymd_and_hms(2024, 3, 1, 18, 30, 0).unwrap().timestamp_millis();
        assert_eq!(
            next_20msk_target(morning),
            Utc.with_ymd_and_hms(2024, 3, 1, 17, 0, 0).unwrap().timestamp_millis()
        );
        assert_eq!(
            next_20msk_target(evening),
            Utc.with_ymd_and_hms(2024, 3, 2, 17, 0, 0).unwrap().timestamp_millis()
        );
    }
}
