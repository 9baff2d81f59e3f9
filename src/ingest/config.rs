// src/ingest/config.rs
//! Default collection units (subreddits, account ids, chat handles).
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ingest::types::{SourceKind, SourceUnits};

const ENV_PATH: &str = "PULSE_UNITS_PATH";

#[derive(Debug, Default, Deserialize)]
struct UnitsFile {
    #[serde(default)]
    reddit: Vec<String>,
    #[serde(default)]
    twitter: Vec<String>,
    #[serde(default)]
    telegram: Vec<String>,
}

impl UnitsFile {
    fn into_units(self) -> SourceUnits {
        let mut out = SourceUnits::new();
        for (kind, list) in [
            (SourceKind::Reddit, self.reddit),
            (SourceKind::Twitter, self.twitter),
            (SourceKind::Telegram, self.telegram),
        ] {
            let list = clean_list(list);
            if !list.is_empty() {
                out.insert(kind, list);
            }
        }
        out
    }
}

/// Load units from an explicit path. Supports TOML or JSON formats.
pub fn load_units_from(path: &Path) -> Result<SourceUnits> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading units from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_units(&content, ext.as_str())
}

/// Load units using env var + fallbacks:
/// 1) $PULSE_UNITS_PATH
/// 2) config/units.toml
/// 3) config/units.json
pub fn load_units_default() -> Result<SourceUnits> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_units_from(&pb);
        }
        return Err(anyhow!("{ENV_PATH} points to non-existent path"));
    }
    let toml_p = PathBuf::from("config/units.toml");
    if toml_p.exists() {
        return load_units_from(&toml_p);
    }
    let json_p = PathBuf::from("config/units.json");
    if json_p.exists() {
        return load_units_from(&json_p);
    }
    Ok(SourceUnits::new())
}

fn parse_units(s: &str, hint_ext: &str) -> Result<SourceUnits> {
    let parsed: UnitsFile = if hint_ext == "json" {
        serde_json::from_str(s).context("parsing units JSON")?
    } else if hint_ext == "toml" {
        toml::from_str(s).context("parsing units TOML")?
    } else {
        match serde_json::from_str(s) {
            Ok(v) => v,
            Err(_) => toml::from_str(s).map_err(|_| anyhow!("unsupported units format"))?,
        }
    };
    Ok(parsed.into_units())
}

/// Trim, drop blanks, drop repeats. Caller order is kept: units are collected in it.
pub fn clean_list(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for it in items {
        let t = it.trim();
        if !t.is_empty() && !out.iter().any(|o| o == t) {
            out.push(t.to_string());
        }
    }
    out
}
