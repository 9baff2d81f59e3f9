// tests/reduce_windows.rs
//
// Property-style checks over seeded random inputs: stage-1 truncation and
// window partitioning.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crypto_pulse::ingest::types::{SourceItem, SourceKind};
use crypto_pulse::reduce::{truncate, truncate_by_source, ReductionConfig};
use crypto_pulse::windows::{default_windows, WindowSet};

const NOW_MS: i64 = 1_709_294_400_000;
const HOUR_MS: i64 = 3_600_000;

fn item(kind: SourceKind, text: String, popularity: Option<i64>, created_at_ms: i64) -> SourceItem {
    SourceItem {
        kind,
        origin: "fixture".into(),
        text,
        created_at_ms,
        popularity,
        author: None,
        url: None,
    }
}

#[test]
fn five_hundred_posts_cut_to_top_hundred() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut items: Vec<SourceItem> = (0..500)
        .map(|i| item(SourceKind::Reddit, format!("post {i} {}", "x".repeat(300)), Some(i), NOW_MS))
        .collect();
    items.shuffle(&mut rng);

    let out = truncate(items, 100, 200);
    assert_eq!(out.len(), 100);
    let pops: Vec<i64> = out.iter().filter_map(|i| i.popularity).collect();
    assert_eq!(pops, (400..500).rev().collect::<Vec<_>>());
    assert!(out.iter().all(|i| i.text.chars().count() <= 200));

    // already truncated input comes back unchanged
    assert_eq!(truncate(out.clone(), 100, 200), out);
}

#[test]
fn caps_apply_per_source() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut items = Vec::new();
    for kind in [SourceKind::Reddit, SourceKind::Twitter, SourceKind::Telegram] {
        for i in 0..400 {
            let pop = if rng.random_bool(0.1) { None } else { Some(rng.random_range(0..10_000)) };
            items.push(item(kind, format!("{kind} {i}"), pop, NOW_MS));
        }
    }
    items.shuffle(&mut rng);

    let cfg = ReductionConfig::default();
    let out = truncate_by_source(items, &cfg);
    let count = |k: SourceKind| out.iter().filter(|i| i.kind == k).count();
    assert_eq!(count(SourceKind::Reddit), cfg.reddit.max_items);
    assert_eq!(count(SourceKind::Twitter), cfg.twitter.max_items);
    assert_eq!(count(SourceKind::Telegram), cfg.telegram.max_items);

    // unknown popularity never outranks a known one within a source
    for kind in [SourceKind::Reddit, SourceKind::Twitter, SourceKind::Telegram] {
        let pops: Vec<Option<i64>> = out.iter().filter(|i| i.kind == kind).map(|i| i.popularity).collect();
        if let Some(first_none) = pops.iter().position(Option::is_none) {
            assert!(pops[first_none..].iter().all(Option::is_none));
        }
    }
}

#[test]
fn partition_is_exclusive_and_bounded() {
    let set = WindowSet::new(default_windows()).unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let items: Vec<SourceItem> = (0..1_000)
        .map(|i| {
            // some future-dated, some past the last bound
            let age = rng.random_range(-2 * HOUR_MS..24 * HOUR_MS);
            item(SourceKind::Telegram, format!("msg {i}"), None, NOW_MS - age)
        })
        .collect();
    let expected_dropped = items
        .iter()
        .filter(|i| {
            let age = NOW_MS - i.created_at_ms;
            age < 0 || age > 18 * HOUR_MS
        })
        .count();

    let partition = set.partition(items, NOW_MS);
    assert_eq!(partition.total() + partition.dropped, 1_000);
    assert_eq!(partition.dropped, expected_dropped);

    let mut lower = 0i64;
    for bucket in &partition.buckets {
        let upper = (bucket.window.max_age_hours * HOUR_MS as f64) as i64;
        for it in &bucket.items {
            let age = NOW_MS - it.created_at_ms;
            assert!(age <= upper, "{} older than {}", it.text, bucket.window.label);
            assert!(age >= lower, "{} younger than {}", it.text, bucket.window.label);
        }
        lower = upper + 1;
    }
}
