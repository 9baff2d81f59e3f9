// src/ingest/scheduler.rs
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::{PipelineError, PipelineWarning};
use crate::ingest::types::{Progress, ProgressFn, SourceKind};
use crate::orchestrator::AbortFlag;
use crate::pipeline::{CollectRequest, Pipeline, SynthesisPayload};

/// Most recent payload, as served by `GET /latest`.
pub type LatestPayload = Arc<RwLock<Option<Value>>>;

/// At most one run at a time. Holds the abort flag of the run in flight.
#[derive(Debug, Clone, Default)]
pub struct RunSlot(Arc<Mutex<Option<AbortFlag>>>);

impl RunSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot, or `None` when a run is already in flight.
    pub fn try_begin(&self) -> Option<RunTicket> {
        let mut g = self.0.lock().unwrap_or_else(|p| p.into_inner());
        if g.is_some() {
            return None;
        }
        let abort = AbortFlag::new();
        *g = Some(abort.clone());
        Some(RunTicket {
            slot: self.clone(),
            abort,
        })
    }

    /// Flags the run in flight for cancellation. False when idle.
    pub fn cancel(&self) -> bool {
        match self.0.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }
}

/// Releases the slot on drop.
pub struct RunTicket {
    slot: RunSlot,
    abort: AbortFlag,
}

impl RunTicket {
    pub fn abort(&self) -> &AbortFlag {
        &self.abort
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        *self.slot.0.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

/// Outcome of the last finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastRun {
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub warnings: Vec<PipelineWarning>,
    pub kept: usize,
    /// Set when the run produced no payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct StatusInner {
    progress: BTreeMap<SourceKind, Progress>,
    last_run: Option<LastRun>,
}

/// Live progress of the run in flight plus the last finished run.
/// Shared by the HTTP handlers, the scheduler and the orchestrator's progress callback.
#[derive(Debug, Clone, Default)]
pub struct CollectStatus(Arc<Mutex<StatusInner>>);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub busy: bool,
    pub progress: BTreeMap<SourceKind, Progress>,
    pub last_run: Option<LastRun>,
}

impl CollectStatus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Callback for `FanOutOrchestrator::with_progress`: keeps the latest tick per source.
    pub fn progress_fn(&self) -> ProgressFn {
        let status = self.clone();
        Arc::new(move |p: Progress| {
            status.lock().progress.insert(p.source, p);
        })
    }

    /// Clears the previous run's progress.
    pub fn begin(&self) {
        self.lock().progress.clear();
    }

    pub fn finish(&self, outcome: &Result<SynthesisPayload, PipelineError>) {
        let last = match outcome {
            Ok(payload) => LastRun {
                finished_at: Utc::now(),
                cancelled: payload.cancelled,
                warnings: payload.warnings.clone(),
                kept: payload.stats.kept,
                error: None,
            },
            Err(e) => LastRun {
                finished_at: Utc::now(),
                cancelled: false,
                warnings: Vec::new(),
                kept: 0,
                error: Some(e.to_string()),
            },
        };
        self.lock().last_run = Some(last);
    }

    pub fn snapshot(&self, busy: bool) -> StatusSnapshot {
        let g = self.lock();
        StatusSnapshot {
            busy,
            progress: g.progress.clone(),
            last_run: g.last_run.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CollectionSchedulerCfg {
    pub interval_secs: u64,
}

/// Run `request` on a fixed interval, storing each payload in `latest`.
/// Ticks that find a run in flight are skipped; failed ticks are logged only.
pub fn spawn_collection_scheduler(
    cfg: CollectionSchedulerCfg,
    pipeline: Arc<Pipeline>,
    request: CollectRequest,
    slot: RunSlot,
    latest: LatestPayload,
    status: CollectStatus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(cfg.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(ticket) = slot.try_begin() else {
                tracing::info!(target: "ingest", "scheduled run skipped, another run in flight");
                continue;
            };

            counter!("ingest_runs_total").increment(1);
            status.begin();
            let outcome = pipeline.run(&request, ticket.abort()).await;
            status.finish(&outcome);
            match outcome {
                Ok(payload) => match serde_json::to_value(&payload) {
                    Ok(v) => {
                        *latest.write().await = Some(v);
                        tracing::info!(
                            target: "ingest",
                            mode = %request.mode,
                            kept = payload.stats.kept,
                            warnings = payload.warnings.len(),
                            "scheduled run stored"
                        );
                    }
                    Err(e) => tracing::warn!(target: "ingest", error = %e, "payload serialization failed"),
                },
                Err(e) => tracing::warn!(target: "ingest", error = %e, "scheduled run failed"),
            }
            drop(ticket);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_admits_one_run_and_frees_on_drop() {
        let slot = RunSlot::new();
        assert!(!slot.cancel());

        let ticket = slot.try_begin().unwrap();
        assert!(slot.try_begin().is_none());
        assert!(slot.cancel());
        assert!(ticket.abort().is_cancelled());

        drop(ticket);
        assert!(!slot.is_busy());
        assert!(!slot.try_begin().unwrap().abort().is_cancelled());
    }

    #[test]
    fn status_keeps_latest_tick_per_source_until_next_run() {
        let status = CollectStatus::new();
        let tick = status.progress_fn();
        tick(Progress { source: SourceKind::Reddit, current: 1, total: 2 });
        tick(Progress { source: SourceKind::Reddit, current: 2, total: 2 });
        tick(Progress { source: SourceKind::Telegram, current: 1, total: 1 });
        status.finish(&Err(PipelineError::AllSourcesEmpty));

        let snap = status.snapshot(false);
        assert_eq!(snap.progress[&SourceKind::Reddit].current, 2);
        assert_eq!(snap.progress.len(), 2);
        let last = snap.last_run.unwrap();
        assert_eq!(last.kept, 0);
        assert!(last.error.unwrap().contains("no usable data"));

        status.begin();
        let snap = status.snapshot(true);
        assert!(snap.progress.is_empty());
        assert!(snap.last_run.is_some());
    }
}
