// tests/config_load.rs
//
// Config files layered over defaults, env-var path overrides and secret
// resolution. Env-touching tests are serialized.

use std::fs;
use std::io::Write;

use serial_test::serial;
use tempfile::{tempdir, NamedTempFile};

use crypto_pulse::config::PipelineConfig;
use crypto_pulse::ingest::config::{load_units_default, load_units_from};
use crypto_pulse::ingest::types::SourceKind;

fn toml_file(content: &str) -> NamedTempFile {
    let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    f.write_all(content.as_bytes()).unwrap();
    f
}

#[test]
fn partial_toml_keeps_untouched_defaults() {
    let f = toml_file(
        r#"
[reddit]
sort = "new"
min_score = 20

[rate_limits.twitter]
fast_delay_ms = 100

[reduction.twitter]
max_items = 10
max_chars = 120
"#,
    );
    let cfg = PipelineConfig::load_from(f.path()).unwrap();

    assert_eq!(cfg.reddit.sort, "new");
    assert_eq!(cfg.reddit.min_score, Some(20));
    assert_eq!(cfg.reddit.page_size, 25);
    assert_eq!(cfg.rate_limits.twitter.fast_delay_ms, 100);
    assert_eq!(cfg.rate_limits.twitter.remaining_header, "x-ratelimit-requests-remaining");
    assert_eq!(cfg.reduction.twitter.max_items, 10);
    assert_eq!(cfg.reduction.reddit.max_items, 300);
    assert_eq!(cfg.windows.len(), 3);
}

#[test]
fn overlapping_windows_fail_at_load() {
    let f = toml_file(
        r#"
[[windows]]
label = "fresh"
max_age_hours = 6.0
weight = 0.6

[[windows]]
label = "stale"
max_age_hours = 4.0
weight = 0.4
"#,
    );
    let err = PipelineConfig::load_from(f.path()).unwrap_err();
    assert!(
        format!("{err:#}").contains("invalid time window configuration"),
        "got {err:#}"
    );
}

#[test]
fn custom_windows_replace_defaults() {
    let f = toml_file(
        r#"
[[windows]]
label = "1h"
max_age_hours = 1.0
weight = 1.0

[[windows]]
label = "24h"
max_age_hours = 24.0
weight = 0.25
"#,
    );
    let cfg = PipelineConfig::load_from(f.path()).unwrap();
    let set = cfg.window_set().unwrap();
    assert_eq!(set.windows().len(), 2);
    assert_eq!(set.max_age_hours(), 24.0);
}

#[test]
#[serial]
fn env_path_and_secrets() {
    let dir = tempdir().unwrap();
    let p = dir.path().join("pipeline.json");
    fs::write(&p, r#"{ "scheduler": { "enabled": true, "mode": "smart_money" } }"#).unwrap();

    std::env::set_var("PULSE_CONFIG_PATH", &p);
    std::env::set_var("RAPIDAPI_KEY", "rapid-test-key");
    std::env::remove_var("CMC_API_KEY");
    let cfg = PipelineConfig::load_default().unwrap();
    std::env::remove_var("PULSE_CONFIG_PATH");
    std::env::remove_var("RAPIDAPI_KEY");

    assert!(cfg.scheduler.enabled);
    assert_eq!(cfg.scheduler.mode, "smart_money");
    assert_eq!(cfg.scheduler.interval_secs, 900);
    assert_eq!(cfg.twitter.api_key.as_deref(), Some("rapid-test-key"));
    assert_eq!(cfg.market.api_key, None);
}

#[test]
#[serial]
fn env_path_to_missing_file_is_error() {
    std::env::set_var("PULSE_CONFIG_PATH", "/definitely/not/here.toml");
    let res = PipelineConfig::load_default();
    std::env::remove_var("PULSE_CONFIG_PATH");
    assert!(res.is_err());
}

#[test]
#[serial]
fn units_from_env_path() {
    let dir = tempdir().unwrap();
    let p = dir.path().join("units.toml");
    fs::write(
        &p,
        r#"
reddit = ["CryptoCurrency", " solana ", "CryptoCurrency", ""]
telegram = ["@whale_chat"]
twitter = []
"#,
    )
    .unwrap();

    std::env::set_var("PULSE_UNITS_PATH", &p);
    let units = load_units_default().unwrap();
    std::env::remove_var("PULSE_UNITS_PATH");

    assert_eq!(units[&SourceKind::Reddit], vec!["CryptoCurrency", "solana"]);
    assert_eq!(units[&SourceKind::Telegram], vec!["@whale_chat"]);
    assert!(!units.contains_key(&SourceKind::Twitter));
    assert_eq!(load_units_from(&p).unwrap(), units);
}
