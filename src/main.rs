//! crypto-pulse binary entrypoint.
//! Loads config, wires the collection pipeline and serves the HTTP surface.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crypto_pulse::api::{self, AppState};
use crypto_pulse::config::{AiConfig, PipelineConfig};
use crypto_pulse::ingest::config::load_units_default;
use crypto_pulse::ingest::scheduler::{spawn_collection_scheduler, CollectStatus, CollectionSchedulerCfg};
use crypto_pulse::metrics::Metrics;
use crypto_pulse::pipeline::{AnalysisMode, CollectRequest, Pipeline};
use crypto_pulse::summarizer::build_summarizer;

const DEFAULT_FILTER: &str = "crypto_pulse=info,ingest=info,pipeline=info,reduce=info,warn";

/// Compact logs by default, JSON lines with PULSE_LOG_JSON=1.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var("PULSE_LOG_JSON").ok().is_some_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = PipelineConfig::load_default().context("loading pipeline config")?;
    let ai = AiConfig::load_default().context("loading config/ai.json")?;
    let units = load_units_default().context("loading default units")?;
    // Safe diagnostics only: never log keys.
    info!(
        windows = cfg.windows.len(),
        summarizer = %ai.provider,
        summarizer_enabled = ai.enabled,
        twitter_key = cfg.twitter.api_key.is_some(),
        market_key = cfg.market.api_key.is_some(),
        units = units.values().map(Vec::len).sum::<usize>(),
        "config loaded"
    );

    let metrics = Metrics::init()?;
    let summarizer = build_summarizer(&ai)?;
    let status = CollectStatus::new();
    let pipeline = Arc::new(Pipeline::from_config(&cfg, summarizer, Some(status.progress_fn()))?);
    let state = AppState::new(pipeline.clone(), units.clone()).with_status(status);

    if cfg.scheduler.enabled {
        match AnalysisMode::parse(&cfg.scheduler.mode, None) {
            Ok(mode) => {
                spawn_collection_scheduler(
                    CollectionSchedulerCfg {
                        interval_secs: cfg.scheduler.interval_secs,
                    },
                    pipeline,
                    CollectRequest { mode, units },
                    state.slot.clone(),
                    state.latest.clone(),
                    state.status.clone(),
                );
                info!(interval_secs = cfg.scheduler.interval_secs, "collection scheduler started");
            }
            Err(e) => warn!(error = %e, "scheduler disabled: invalid mode"),
        }
    }

    let app = api::router(state).merge(metrics.router());
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind))?;
    info!(bind = %cfg.server.bind, "listening");
    axum::serve(listener, app).await.context("http server")?;
    Ok(())
}
