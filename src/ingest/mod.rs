// src/ingest/mod.rs
pub mod config;
pub mod fetcher;
pub mod market;
pub mod providers;
pub mod scheduler;
pub mod timestamp;
pub mod types;

use crate::ingest::types::SourceItem;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;
use std::collections::HashSet;

/// Recurring threads that carry no signal of their own.
pub const DEFAULT_NOISE_PATTERNS: &[&str] = &["Daily Discussion"];

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_items_total",
            "Items parsed from upstream responses, per source."
        );
        describe_counter!(
            "ingest_kept_total",
            "Items kept after recency/noise filtering and dedup."
        );
        describe_counter!(
            "ingest_filtered_total",
            "Items dropped as stale, noisy, empty or with an unresolvable timestamp."
        );
        describe_counter!("ingest_dedup_total", "Items removed as duplicates.");
        describe_counter!(
            "ingest_unit_failures_total",
            "Collection units that ended in a Failure outcome."
        );
        describe_counter!(
            "fetch_rate_limited_total",
            "Throttle responses (429) observed per provider."
        );
        describe_histogram!(
            "fetch_wait_ms",
            "Time spent waiting before issuing an upstream request."
        );
        describe_counter!(
            "reduce_compression_truncated_total",
            "Digests cut back to the word ceiling after compression."
        );
        describe_counter!("ingest_runs_total", "Scheduled collection runs started.");
        describe_gauge!(
            "pipeline_last_run_ts",
            "Unix ts when the collection pipeline last finished."
        );
    });
}

/// Normalize text: decode entities, strip tags, ASCII quotes, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[a-z][^>]*>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut `s` to at most `max_chars` characters (char-boundary safe).
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Normalize then cap. Used by every collector on every item.
pub fn clean_text(s: &str, max_chars: usize) -> String {
    truncate_chars(&normalize_text(s), max_chars)
}

pub fn is_noise<S: AsRef<str>>(text: &str, patterns: &[S]) -> bool {
    let lower = text.to_lowercase();
    patterns
        .iter()
        .any(|p| !p.as_ref().is_empty() && lower.contains(&p.as_ref().to_lowercase()))
}

/// Uniform post-fetch filter: drop empty, stale and noisy items.
/// Returns (kept, dropped_count).
pub fn filter_recent<S: AsRef<str>>(
    items: Vec<SourceItem>,
    cutoff_ms: i64,
    noise_patterns: &[S],
) -> (Vec<SourceItem>, usize) {
    let mut dropped = 0usize;
    let mut kept = Vec::with_capacity(items.len());
    for it in items {
        let keep = !it.text.is_empty()
            && it.created_at_ms >= cutoff_ms
            && !is_noise(&it.text, noise_patterns);
        if keep {
            kept.push(it);
        } else {
            dropped += 1;
        }
    }
    (kept, dropped)
}

/// Deduplicate by (source kind, case-folded text), keeping the first occurrence.
/// Cross-posts and copy-pasted shill messages collapse to one item.
pub fn dedup_items(items: Vec<SourceItem>) -> (Vec<SourceItem>, usize) {
    let mut seen: HashSet<(crate::ingest::types::SourceKind, String)> = HashSet::new();
    let mut keep = Vec::with_capacity(items.len());
    let mut dedup_out = 0usize;

    for it in items {
        if !seen.insert((it.kind, it.text.to_lowercase())) {
            dedup_out += 1;
            continue;
        }
        keep.push(it);
    }

    (keep, dedup_out)
}
