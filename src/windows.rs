// src/windows.rs
//! Age buckets and the mention-velocity signal built on them.
//!
//! Windows are ordered by ascending upper bound and validated once, when the
//! `WindowSet` is built. Partitioning is then a pure function of the items and
//! a reference "now".

use std::collections::BTreeSet;

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::ingest::types::SourceItem;

const HOUR_MS: f64 = 3_600_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub label: String,
    /// Inclusive upper bound of item age for this window.
    pub max_age_hours: f64,
    pub weight: f64,
}

impl TimeWindow {
    pub fn new(label: &str, max_age_hours: f64, weight: f64) -> Self {
        Self {
            label: label.to_string(),
            max_age_hours,
            weight,
        }
    }
}

/// 0-4h / 4-12h / 12-18h, weighted 0.5 / 0.3 / 0.2.
pub fn default_windows() -> Vec<TimeWindow> {
    vec![
        TimeWindow::new("0-4h", 4.0, 0.5),
        TimeWindow::new("4-12h", 12.0, 0.3),
        TimeWindow::new("12-18h", 18.0, 0.2),
    ]
}

/// A validated, ascending, non-overlapping list of windows.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSet {
    windows: Vec<TimeWindow>,
}

impl WindowSet {
    pub fn new(windows: Vec<TimeWindow>) -> Result<Self, PipelineError> {
        if windows.is_empty() {
            return Err(PipelineError::PartitionConfig("no windows configured".into()));
        }
        let mut labels = BTreeSet::new();
        let mut prev = 0.0f64;
        for (i, w) in windows.iter().enumerate() {
            if w.label.trim().is_empty() {
                return Err(PipelineError::PartitionConfig(format!("window #{i} has an empty label")));
            }
            if !labels.insert(w.label.as_str()) {
                return Err(PipelineError::PartitionConfig(format!("duplicate window label {:?}", w.label)));
            }
            if !w.max_age_hours.is_finite() || w.max_age_hours <= prev {
                return Err(PipelineError::PartitionConfig(format!(
                    "window {:?} bound {}h must be greater than the previous bound {}h",
                    w.label, w.max_age_hours, prev
                )));
            }
            if !w.weight.is_finite() || w.weight < 0.0 {
                return Err(PipelineError::PartitionConfig(format!(
                    "window {:?} has invalid weight {}",
                    w.label, w.weight
                )));
            }
            prev = w.max_age_hours;
        }
        Ok(Self { windows })
    }

    pub fn windows(&self) -> &[TimeWindow] {
        &self.windows
    }

    /// Upper bound of the last window; anything older is dropped.
    pub fn max_age_hours(&self) -> f64 {
        self.windows.last().map(|w| w.max_age_hours).unwrap_or(0.0)
    }

    /// Index of the first window whose bound covers `age_ms`, if any.
    pub fn window_for_age(&self, age_ms: i64) -> Option<usize> {
        if age_ms < 0 {
            return None;
        }
        let age_h = age_ms as f64 / HOUR_MS;
        self.windows.iter().position(|w| age_h <= w.max_age_hours)
    }

    /// Bucket items by age. Future-dated items and items older than every
    /// bound are counted in `dropped`.
    pub fn partition(&self, items: Vec<SourceItem>, now_ms: i64) -> Partition {
        let mut buckets: Vec<WindowBucket> = self
            .windows
            .iter()
            .map(|w| WindowBucket {
                window: w.clone(),
                items: Vec::new(),
            })
            .collect();
        let mut dropped = 0usize;
        for it in items {
            match self.window_for_age(now_ms - it.created_at_ms) {
                Some(idx) => buckets[idx].items.push(it),
                None => dropped += 1,
            }
        }
        Partition { buckets, dropped }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowBucket {
    #[serde(flatten)]
    pub window: TimeWindow,
    pub items: Vec<SourceItem>,
}

/// Output of `WindowSet::partition`, in window order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Partition {
    pub buckets: Vec<WindowBucket>,
    pub dropped: usize,
}

impl Partition {
    pub fn get(&self, label: &str) -> Option<&[SourceItem]> {
        self.buckets
            .iter()
            .find(|b| b.window.label == label)
            .map(|b| b.items.as_slice())
    }

    pub fn total(&self) -> usize {
        self.buckets.iter().map(|b| b.items.len()).sum()
    }

    pub fn items(&self) -> impl Iterator<Item = &SourceItem> {
        self.buckets.iter().flat_map(|b| b.items.iter())
    }

    /// Mentions of `symbol` per window.
    pub fn mention_counts(&self, symbol: &str) -> Vec<usize> {
        self.buckets.iter().map(|b| mentions(&b.items, symbol)).collect()
    }

    pub fn into_items(self) -> Vec<SourceItem> {
        self.buckets.into_iter().flat_map(|b| b.items).collect()
    }
}

/// `$sol` / `$SOL` always count; a bare word counts only when it is written
/// in upper case, so "sol" in Spanish chatter does not.
pub fn mentions_symbol(text: &str, symbol: &str) -> bool {
    let sym = symbol.trim().trim_start_matches('$').to_uppercase();
    if sym.is_empty() {
        return false;
    }
    text.split(|c: char| !(c.is_alphanumeric() || c == '$'))
        .any(|tok| match tok.strip_prefix('$') {
            Some(tag) => tag.eq_ignore_ascii_case(&sym),
            None => tok == sym,
        })
}

/// Number of items mentioning `symbol` at least once.
pub fn mentions(items: &[SourceItem], symbol: &str) -> usize {
    items.iter().filter(|it| mentions_symbol(&it.text, symbol)).count()
}

/// `counts[0] * w0 / max(1, sum(counts[i] * wi for i > 0))`.
pub fn velocity(counts: &[usize], windows: &[TimeWindow]) -> f64 {
    let mut pairs = counts.iter().zip(windows.iter());
    let Some((c0, w0)) = pairs.next() else {
        return 0.0;
    };
    let baseline: f64 = pairs.map(|(c, w)| *c as f64 * w.weight).sum();
    *c0 as f64 * w0.weight / baseline.max(1.0)
}

/// Uppercased cashtags (`$ABC`, 2 to 10 chars) found in `text`.
pub fn cashtags(text: &str) -> Vec<String> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"\$([A-Za-z][A-Za-z0-9]{1,9})\b").unwrap());
    re.captures_iter(text)
        .map(|c| c[1].to_uppercase())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VelocityScore {
    pub symbol: String,
    /// Mentions per window, in window order.
    pub mentions: Vec<usize>,
    pub velocity: f64,
}

/// Score each symbol (or every cashtag seen, when `symbols` is `None`) and
/// sort by velocity descending, ties by symbol.
pub fn rank_by_velocity(partition: &Partition, symbols: Option<&[String]>) -> Vec<VelocityScore> {
    let candidates: BTreeSet<String> = match symbols {
        Some(list) => list.iter().map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect(),
        None => partition.items().flat_map(|it| cashtags(&it.text)).collect(),
    };
    let windows: Vec<TimeWindow> = partition.buckets.iter().map(|b| b.window.clone()).collect();

    let mut scores: Vec<VelocityScore> = candidates
        .into_iter()
        .map(|symbol| {
            let counts = partition.mention_counts(&symbol);
            let v = velocity(&counts, &windows);
            VelocityScore {
                symbol,
                mentions: counts,
                velocity: v,
            }
        })
        .collect();
    scores.sort_by(|a, b| b.velocity.total_cmp(&a.velocity).then_with(|| a.symbol.cmp(&b.symbol)));
    scores
}
