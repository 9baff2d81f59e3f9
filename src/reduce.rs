// src/reduce.rs
//! Context reduction: stage 1 truncates per source, stage 2 (optional per mode)
//! compresses everything into one digest under a word ceiling.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ingest::truncate_chars;
use crate::ingest::types::{SourceItem, SourceKind};
use crate::summarizer::DynSummarizer;
use crate::windows::{Partition, WindowSet};

/// Stage-1 limits for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCap {
    pub max_items: usize,
    pub max_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    pub reddit: SourceCap,
    pub twitter: SourceCap,
    pub telegram: SourceCap,
    /// Hard ceiling for the stage-2 digest.
    pub digest_word_ceiling: usize,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            reddit: SourceCap {
                max_items: 300,
                max_chars: 200,
            },
            twitter: SourceCap {
                max_items: 50,
                max_chars: 150,
            },
            telegram: SourceCap {
                max_items: 200,
                max_chars: 150,
            },
            digest_word_ceiling: 1_500,
        }
    }
}

impl ReductionConfig {
    pub fn cap_for(&self, kind: SourceKind) -> SourceCap {
        match kind {
            SourceKind::Reddit => self.reddit,
            SourceKind::Twitter => self.twitter,
            SourceKind::Telegram => self.telegram,
        }
    }
}

/// Terminal artifact of the reduction stage. Produced once, handed on by value.
#[derive(Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReducedContext {
    /// Stage 1 only.
    Items { items: Vec<SourceItem> },
    /// Stage 2 digest, within `word_ceiling` words.
    Digest { text: String, word_ceiling: usize },
}

impl ReducedContext {
    pub fn len(&self) -> usize {
        match self {
            ReducedContext::Items { items } => items.len(),
            ReducedContext::Digest { text, .. } => text.split_whitespace().count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Popularity descending (unknown last), keep `per_source_cap`, cut texts to
/// `per_item_char_cap` chars. The sort is stable, so the result is idempotent.
pub fn truncate(mut items: Vec<SourceItem>, per_source_cap: usize, per_item_char_cap: usize) -> Vec<SourceItem> {
    items.sort_by(|a, b| match (a.popularity, b.popularity) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    items.truncate(per_source_cap);
    for it in &mut items {
        if it.text.chars().count() > per_item_char_cap {
            it.text = truncate_chars(&it.text, per_item_char_cap);
        }
    }
    items
}

/// Stage 1 across sources, each with its own cap. Output is grouped by source.
pub fn truncate_by_source(items: Vec<SourceItem>, config: &ReductionConfig) -> Vec<SourceItem> {
    let mut by_source: BTreeMap<SourceKind, Vec<SourceItem>> = BTreeMap::new();
    for it in items {
        by_source.entry(it.kind).or_default().push(it);
    }
    by_source
        .into_iter()
        .flat_map(|(kind, list)| {
            let cap = config.cap_for(kind);
            truncate(list, cap.max_items, cap.max_chars)
        })
        .collect()
}

fn push_item_line(out: &mut String, it: &SourceItem) {
    let _ = match it.popularity {
        Some(p) => writeln!(out, "- [{}] ({p}) {}", it.origin, it.text),
        None => writeln!(out, "- [{}] {}", it.origin, it.text),
    };
}

fn push_by_source<'a>(out: &mut String, items: impl Iterator<Item = &'a SourceItem>) {
    let mut grouped: BTreeMap<SourceKind, Vec<&SourceItem>> = BTreeMap::new();
    for it in items {
        grouped.entry(it.kind).or_default().push(it);
    }
    for (kind, list) in grouped {
        let _ = writeln!(out, "### {} ({} items)", kind.as_str().to_uppercase(), list.len());
        for it in list {
            push_item_line(out, it);
        }
    }
}

/// Dense compression input: by window (when partitioned), then by source.
pub fn assemble_payload(items: &[SourceItem], partition: Option<&Partition>) -> String {
    let mut out = String::new();
    match partition {
        Some(p) => {
            for bucket in &p.buckets {
                let _ = writeln!(
                    out,
                    "## WINDOW {} (<= {}h, weight {})",
                    bucket.window.label, bucket.window.max_age_hours, bucket.window.weight
                );
                push_by_source(&mut out, bucket.items.iter());
            }
        }
        None => push_by_source(&mut out, items.iter()),
    }
    out
}

fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

/// Cut `text` to at most `ceiling` words, preferring the last sentence end
/// inside the allowed prefix when it keeps at least half of it. Line breaks
/// inside the kept part survive. Returns the text and whether anything was cut.
pub fn enforce_word_ceiling(text: &str, ceiling: usize) -> (String, bool) {
    let spans = word_spans(text);
    if spans.len() <= ceiling {
        return (text.trim().to_string(), false);
    }
    if ceiling == 0 {
        return (String::new(), true);
    }
    let prefix = &spans[..ceiling];
    let last = prefix
        .iter()
        .rposition(|&(s, e)| text[s..e].ends_with(['.', '!', '?']))
        .filter(|&i| i + 1 >= ceiling.div_ceil(2))
        .unwrap_or(ceiling - 1);
    (text[prefix[0].0..prefix[last].1].to_string(), true)
}

/// Stage 2: summarize the assembled payload and hold the result to the ceiling.
/// If the summarizer is unavailable the payload itself is cut to the ceiling.
pub async fn compress(
    items: &[SourceItem],
    partition: Option<&Partition>,
    word_ceiling: usize,
    summarizer: &DynSummarizer,
) -> String {
    let payload = assemble_payload(items, partition);
    let digest = match summarizer.summarize(&payload, word_ceiling).await {
        Ok(d) => d,
        Err(e) => {
            warn!(
                target: "reduce",
                provider = summarizer.name(),
                error = %e,
                "summarizer unavailable, truncating raw payload instead"
            );
            payload
        }
    };
    let (text, cut) = enforce_word_ceiling(&digest, word_ceiling);
    if cut {
        counter!("reduce_compression_truncated_total").increment(1);
        info!(target: "reduce", word_ceiling, "digest cut back to word ceiling");
    }
    text
}

/// Runs stage 1 and, when asked, stage 2.
pub struct ContextReducer {
    config: ReductionConfig,
    summarizer: DynSummarizer,
}

impl ContextReducer {
    pub fn new(config: ReductionConfig, summarizer: DynSummarizer) -> Self {
        Self { config, summarizer }
    }

    pub fn config(&self) -> &ReductionConfig {
        &self.config
    }

    /// `windows` (with the reference "now") groups the compression input by age.
    pub async fn reduce(
        &self,
        items: Vec<SourceItem>,
        windows: Option<(&WindowSet, i64)>,
        compress_stage: bool,
    ) -> ReducedContext {
        let truncated = truncate_by_source(items, &self.config);
        if !compress_stage {
            return ReducedContext::Items { items: truncated };
        }
        let partition = windows.map(|(set, now_ms)| set.partition(truncated.clone(), now_ms));
        let text = compress(
            &truncated,
            partition.as_ref(),
            self.config.digest_word_ceiling,
            &self.summarizer,
        )
        .await;
        ReducedContext::Digest {
            text,
            word_ceiling: self.config.digest_word_ceiling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::{DisabledSummarizer, MockSummarizer};
    use std::sync::Arc;

    fn item(kind: SourceKind, text: &str, pop: Option<i64>) -> SourceItem {
        SourceItem {
            kind,
            origin: "o".into(),
            text: text.into(),
            created_at_ms: 0,
            popularity: pop,
            author: None,
            url: None,
        }
    }

    #[test]
    fn popularity_desc_unknown_last() {
        let out = truncate(
            vec![
                item(SourceKind::Reddit, "none", None),
                item(SourceKind::Reddit, "low", Some(1)),
                item(SourceKind::Reddit, "high", Some(9)),
            ],
            10,
            100,
        );
        let texts: Vec<_> = out.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(texts, vec!["high", "low", "none"]);
    }

    #[test]
    fn truncate_is_idempotent() {
        let items: Vec<_> = (0..30)
            .map(|i| item(SourceKind::Twitter, &"x".repeat(i * 10), if i % 3 == 0 { None } else { Some((i % 7) as i64) }))
            .collect();
        let once = truncate(items, 12, 55);
        let twice = truncate(once.clone(), 12, 55);
        assert_eq!(once, twice);
    }

    #[test]
    fn per_source_caps_apply() {
        let cfg = ReductionConfig {
            twitter: SourceCap {
                max_items: 1,
                max_chars: 3,
            },
            ..ReductionConfig::default()
        };
        let out = truncate_by_source(
            vec![
                item(SourceKind::Twitter, "tweet one", Some(1)),
                item(SourceKind::Reddit, "post", Some(1)),
                item(SourceKind::Twitter, "tweet two", Some(2)),
            ],
            &cfg,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, SourceKind::Reddit);
        assert_eq!(out[1].text, "twe");
    }

    #[test]
    fn ceiling_prefers_sentence_boundary() {
        let text = "BTC up on ETF flows. SOL unlock next week could weigh on price today";
        let (cut, was_cut) = enforce_word_ceiling(text, 8);
        assert!(was_cut);
        assert_eq!(cut, "BTC up on ETF flows.");

        // No usable sentence end: plain word boundary.
        let (cut, _) = enforce_word_ceiling("one two three four five", 3);
        assert_eq!(cut, "one two three");

        let (same, was_cut) = enforce_word_ceiling("short digest", 10);
        assert!(!was_cut);
        assert_eq!(same, "short digest");
    }

    #[tokio::test]
    async fn compress_enforces_ceiling_on_provider_output() {
        let s: DynSummarizer = Arc::new(MockSummarizer::with_fixed(&"word ".repeat(50)));
        let out = compress(&[item(SourceKind::Reddit, "x", None)], None, 10, &s).await;
        assert_eq!(out.split_whitespace().count(), 10);
    }

    #[tokio::test]
    async fn compress_falls_back_when_disabled() {
        let s: DynSummarizer = Arc::new(DisabledSummarizer);
        let items = vec![item(SourceKind::Telegram, "ETH gas spiking again today", Some(3))];
        let out = compress(&items, None, 6, &s).await;
        assert!(out.starts_with("### TELEGRAM"));
        assert!(out.split_whitespace().count() <= 6);
    }

    #[tokio::test]
    async fn reducer_skips_stage_two_when_not_asked() {
        let r = ContextReducer::new(ReductionConfig::default(), Arc::new(DisabledSummarizer));
        let ctx = r.reduce(vec![item(SourceKind::Reddit, "a", Some(1))], None, false).await;
        assert!(matches!(ctx, ReducedContext::Items { ref items } if items.len() == 1));
    }
}
