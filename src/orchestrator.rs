// src/orchestrator.rs
//! Fan-out collection: one sequential unit loop per source, all sources
//! driven concurrently on the calling task, joined all-settled.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FetchError, PipelineError, PipelineWarning};
use crate::ingest::types::{
    CollectOptions, CollectionResult, Progress, ProgressFn, SourceCollector, SourceItem, SourceKind, SourceUnits,
};

/// Shared cooperative stop signal, checked between units.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound for one unit, pagination and quota waits included.
    pub unit_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            unit_timeout_ms: 180_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub unit: String,
    pub result: CollectionResult,
}

/// Everything one source produced, in caller unit order.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceReport {
    pub source: SourceKind,
    pub outcomes: Vec<UnitOutcome>,
    /// Units never started because the run was cancelled.
    pub skipped: Vec<String>,
}

impl SourceReport {
    pub fn item_count(&self) -> usize {
        self.outcomes.iter().map(|o| o.result.items().len()).sum()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_success()).count()
    }

    pub fn failed_units(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| !o.result.is_success())
            .map(|o| o.unit.clone())
            .collect()
    }

    /// Degradation notes for this source, if any.
    pub fn warnings(&self) -> Vec<PipelineWarning> {
        let mut out = Vec::new();
        if self.outcomes.is_empty() {
            return out;
        }
        let failed = self.failed_units();
        let succeeded = self.succeeded();
        if succeeded == 0 {
            out.push(PipelineWarning::SourceFailed {
                source: self.source,
                failed_units: failed,
            });
            return out;
        }
        if !failed.is_empty() {
            out.push(PipelineWarning::SourcePartialFailure {
                source: self.source,
                failed_units: failed,
                succeeded,
            });
        }
        if self.item_count() == 0 {
            out.push(PipelineWarning::SourceExhausted { source: self.source });
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FanOutResult {
    pub status: RunStatus,
    pub reports: BTreeMap<SourceKind, SourceReport>,
}

impl FanOutResult {
    pub fn is_cancelled(&self) -> bool {
        self.status == RunStatus::Cancelled
    }

    /// Per-source unit results, provenance kept.
    pub fn results(&self) -> BTreeMap<SourceKind, Vec<CollectionResult>> {
        self.reports
            .iter()
            .map(|(k, r)| (*k, r.outcomes.iter().map(|o| o.result.clone()).collect()))
            .collect()
    }

    pub fn warnings(&self) -> Vec<PipelineWarning> {
        self.reports.values().flat_map(SourceReport::warnings).collect()
    }

    pub fn item_count(&self) -> usize {
        self.reports.values().map(SourceReport::item_count).sum()
    }

    pub fn items_by_source(&self) -> BTreeMap<SourceKind, usize> {
        self.reports.iter().map(|(k, r)| (*k, r.item_count())).collect()
    }

    /// Flatten to items, grouped by source. Nothing at all is fatal.
    pub fn into_items(self) -> Result<Vec<SourceItem>, PipelineError> {
        let items: Vec<SourceItem> = self
            .reports
            .into_values()
            .flat_map(|r| r.outcomes.into_iter().flat_map(|o| o.result.into_items()))
            .collect();
        if items.is_empty() {
            return Err(PipelineError::AllSourcesEmpty);
        }
        Ok(items)
    }
}

pub struct FanOutOrchestrator {
    collectors: BTreeMap<SourceKind, Arc<dyn SourceCollector>>,
    config: OrchestratorConfig,
    progress: Option<ProgressFn>,
}

impl FanOutOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            collectors: BTreeMap::new(),
            config,
            progress: None,
        }
    }

    /// Registers (or replaces) the collector for its source kind.
    pub fn with_collector(mut self, collector: Arc<dyn SourceCollector>) -> Self {
        self.collectors.insert(collector.kind(), collector);
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn has_collector(&self, kind: SourceKind) -> bool {
        self.collectors.contains_key(&kind)
    }

    /// Collect every unit of every source. Sources without units or without a
    /// registered collector are left out of the result.
    pub async fn run(
        &self,
        units: &SourceUnits,
        options: &BTreeMap<SourceKind, CollectOptions>,
        abort: &AbortFlag,
    ) -> FanOutResult {
        let tasks = units.iter().filter(|(_, list)| !list.is_empty()).filter_map(|(kind, list)| {
            let Some(collector) = self.collectors.get(kind) else {
                warn!(source = %kind, units = list.len(), "no collector registered, skipping source");
                return None;
            };
            let opts = options
                .get(kind)
                .cloned()
                .unwrap_or_else(|| CollectOptions::new(chrono::Utc::now().timestamp_millis(), chrono::Duration::hours(48)));
            Some(self.run_source(collector.clone(), list.clone(), opts, abort.clone()))
        });

        let reports: BTreeMap<SourceKind, SourceReport> =
            join_all(tasks).await.into_iter().map(|r| (r.source, r)).collect();

        let cancelled = abort.is_cancelled() || reports.values().any(|r| !r.skipped.is_empty());
        let result = FanOutResult {
            status: if cancelled {
                RunStatus::Cancelled
            } else {
                RunStatus::Completed
            },
            reports,
        };
        log_degradation(&result);
        result
    }

    async fn run_source(
        &self,
        collector: Arc<dyn SourceCollector>,
        units: Vec<String>,
        options: CollectOptions,
        abort: AbortFlag,
    ) -> SourceReport {
        let source = collector.kind();
        let total = units.len();
        let timeout = Duration::from_millis(self.config.unit_timeout_ms);
        let mut report = SourceReport {
            source,
            outcomes: Vec::with_capacity(total),
            skipped: Vec::new(),
        };

        for (idx, unit) in units.into_iter().enumerate() {
            if abort.is_cancelled() {
                report.skipped.push(unit);
                continue;
            }
            let result = match tokio::time::timeout(timeout, collector.collect(&unit, &options)).await {
                Ok(r) => r,
                Err(_) => CollectionResult::Failure(FetchError::NetworkTimeout(self.config.unit_timeout_ms)),
            };
            match &result {
                CollectionResult::Success(items) => {
                    debug!(source = %source, unit = %unit, items = items.len(), "unit collected");
                }
                CollectionResult::Failure(e) => {
                    counter!("ingest_unit_failures_total", "source" => source.as_str()).increment(1);
                    warn!(source = %source, unit = %unit, error = %e, kind = e.kind(), "unit failed");
                }
            }
            report.outcomes.push(UnitOutcome { unit, result });
            if let Some(cb) = &self.progress {
                cb(Progress {
                    source,
                    current: idx + 1,
                    total,
                });
            }
        }
        if !report.skipped.is_empty() {
            info!(source = %source, skipped = report.skipped.len(), "collection cancelled");
        }
        report
    }
}

fn log_degradation(result: &FanOutResult) {
    let healthy: Vec<&str> = result
        .reports
        .values()
        .filter(|r| r.item_count() > 0)
        .map(|r| r.source.as_str())
        .collect();
    for report in result.reports.values() {
        if !report.outcomes.is_empty() && report.succeeded() == 0 {
            if healthy.is_empty() {
                warn!(source = %report.source, "{} unavailable", report.source);
            } else {
                warn!(
                    source = %report.source,
                    "{} unavailable, continuing with {}",
                    report.source,
                    healthy.join(" + ")
                );
            }
        }
    }
    info!(
        status = ?result.status,
        items = result.item_count(),
        sources = result.reports.len(),
        "fan-out finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Scripted {
        kind: SourceKind,
        script: HashMap<String, CollectionResult>,
        delay: Duration,
        cancel_after_first: Option<AbortFlag>,
        seen: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(kind: SourceKind, script: Vec<(&str, CollectionResult)>) -> Self {
            Self {
                kind,
                script: script.into_iter().map(|(u, r)| (u.to_string(), r)).collect(),
                delay: Duration::ZERO,
                cancel_after_first: None,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SourceCollector for Scripted {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn collect(&self, unit: &str, _options: &CollectOptions) -> CollectionResult {
            self.seen.lock().unwrap().push(unit.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(flag) = &self.cancel_after_first {
                flag.cancel();
            }
            self.script
                .get(unit)
                .cloned()
                .unwrap_or(CollectionResult::Success(Vec::new()))
        }
    }

    fn item(kind: SourceKind, origin: &str) -> SourceItem {
        SourceItem {
            kind,
            origin: origin.into(),
            text: format!("post from {origin}"),
            created_at_ms: 1,
            popularity: Some(10),
            author: None,
            url: None,
        }
    }

    fn units(pairs: &[(SourceKind, &[&str])]) -> SourceUnits {
        pairs
            .iter()
            .map(|(k, v)| (*k, v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[tokio::test]
    async fn failed_source_does_not_abort_siblings() {
        let twitter = Scripted::new(
            SourceKind::Twitter,
            vec![
                ("1", CollectionResult::Failure(FetchError::Status(503))),
                ("2", CollectionResult::Failure(FetchError::NetworkTimeout(10))),
            ],
        );
        let reddit = Scripted::new(
            SourceKind::Reddit,
            vec![("solana", CollectionResult::Success(vec![item(SourceKind::Reddit, "solana")]))],
        );
        let orch = FanOutOrchestrator::new(OrchestratorConfig::default())
            .with_collector(Arc::new(twitter))
            .with_collector(Arc::new(reddit));

        let res = orch
            .run(
                &units(&[(SourceKind::Twitter, &["1", "2"]), (SourceKind::Reddit, &["solana"])]),
                &BTreeMap::new(),
                &AbortFlag::new(),
            )
            .await;

        assert_eq!(res.status, RunStatus::Completed);
        assert_eq!(res.reports[&SourceKind::Twitter].item_count(), 0);
        assert_eq!(res.reports[&SourceKind::Reddit].item_count(), 1);
        assert_eq!(
            res.warnings(),
            vec![PipelineWarning::SourceFailed {
                source: SourceKind::Twitter,
                failed_units: vec!["1".into(), "2".into()],
            }]
        );
        assert_eq!(res.into_items().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partial_failure_and_exhaustion_are_reported() {
        let reddit = Scripted::new(
            SourceKind::Reddit,
            vec![("bad", CollectionResult::Failure(FetchError::Status(404)))],
        );
        let orch = FanOutOrchestrator::new(OrchestratorConfig::default()).with_collector(Arc::new(reddit));
        let res = orch
            .run(&units(&[(SourceKind::Reddit, &["empty", "bad"])]), &BTreeMap::new(), &AbortFlag::new())
            .await;
        let w = res.warnings();
        assert!(w.contains(&PipelineWarning::SourcePartialFailure {
            source: SourceKind::Reddit,
            failed_units: vec!["bad".into()],
            succeeded: 1,
        }));
        assert!(w.contains(&PipelineWarning::SourceExhausted { source: SourceKind::Reddit }));
        assert!(matches!(res.into_items(), Err(PipelineError::AllSourcesEmpty)));
    }

    #[tokio::test]
    async fn units_run_in_caller_order_with_progress() {
        let reddit = Arc::new(Scripted::new(SourceKind::Reddit, vec![]));
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = ticks.clone();
        let orch = FanOutOrchestrator::new(OrchestratorConfig::default())
            .with_collector(reddit.clone())
            .with_progress(Arc::new(move |p| sink.lock().unwrap().push((p.current, p.total))));

        orch.run(&units(&[(SourceKind::Reddit, &["c", "a", "b"])]), &BTreeMap::new(), &AbortFlag::new())
            .await;

        assert_eq!(*reddit.seen.lock().unwrap(), vec!["c", "a", "b"]);
        assert_eq!(*ticks.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn cancellation_stops_new_units() {
        let abort = AbortFlag::new();
        let mut reddit = Scripted::new(
            SourceKind::Reddit,
            vec![("first", CollectionResult::Success(vec![item(SourceKind::Reddit, "first")]))],
        );
        reddit.cancel_after_first = Some(abort.clone());
        let reddit = Arc::new(reddit);
        let orch = FanOutOrchestrator::new(OrchestratorConfig::default()).with_collector(reddit.clone());

        let res = orch
            .run(&units(&[(SourceKind::Reddit, &["first", "second", "third"])]), &BTreeMap::new(), &abort)
            .await;

        assert!(res.is_cancelled());
        assert_eq!(reddit.seen.lock().unwrap().len(), 1);
        assert_eq!(res.reports[&SourceKind::Reddit].skipped, vec!["second", "third"]);
        assert_eq!(res.into_items().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_unit_times_out_as_failure() {
        let mut slow = Scripted::new(SourceKind::Telegram, vec![]);
        slow.delay = Duration::from_secs(3_600);
        let orch = FanOutOrchestrator::new(OrchestratorConfig { unit_timeout_ms: 5_000 }).with_collector(Arc::new(slow));

        let res = orch
            .run(&units(&[(SourceKind::Telegram, &["@stuck"])]), &BTreeMap::new(), &AbortFlag::new())
            .await;
        let outcome = &res.reports[&SourceKind::Telegram].outcomes[0];
        assert_eq!(outcome.result, CollectionResult::Failure(FetchError::NetworkTimeout(5_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn sources_progress_concurrently() {
        let mut a = Scripted::new(SourceKind::Reddit, vec![]);
        a.delay = Duration::from_secs(10);
        let mut b = Scripted::new(SourceKind::Twitter, vec![]);
        b.delay = Duration::from_secs(10);
        let orch = FanOutOrchestrator::new(OrchestratorConfig::default())
            .with_collector(Arc::new(a))
            .with_collector(Arc::new(b));

        let t0 = tokio::time::Instant::now();
        orch.run(
            &units(&[(SourceKind::Reddit, &["r"]), (SourceKind::Twitter, &["t"])]),
            &BTreeMap::new(),
            &AbortFlag::new(),
        )
        .await;
        assert!(t0.elapsed() < Duration::from_secs(20));
    }
}
