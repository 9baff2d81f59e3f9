// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path};

fn default_daily_limit() -> u32 {
    20
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_cache_dir() -> String {
    "cache/summaries".to_string()
}

/// Settings for the digest summarizer (`config/ai.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiConfig {
    pub enabled: bool,
    /// "openai" | "anthropic" | "mock" (case-insensitive; "claude" is accepted as "anthropic")
    pub provider: String,
    /// Empty means the provider default.
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// "ENV" means: read from OPENAI_API_KEY / ANTHROPIC_API_KEY (by provider)
    #[serde(default, skip_serializing)]
    pub api_key: String,
    /// Override for the provider endpoint (proxies, local fixtures).
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "openai".to_string(),
            model: String::new(),
            daily_limit: default_daily_limit(),
            api_key: String::new(),
            base_url: None,
            timeout_ms: default_timeout_ms(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl AiConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let cfg: AiConfig = serde_json::from_str(&data)?;
        cfg.normalized()
    }

    /// `config/ai.json` when present, otherwise a disabled config.
    pub fn load_default() -> anyhow::Result<Self> {
        let p = Path::new("config/ai.json");
        if p.exists() {
            Self::load_from_file(p)
        } else {
            Ok(Self::default())
        }
    }

    fn normalized(mut self) -> anyhow::Result<Self> {
        self.provider = match self.provider.trim().to_lowercase().as_str() {
            "claude" => "anthropic".to_string(),
            other => other.to_string(),
        };

        // A disabled summarizer never needs a key.
        if self.enabled && self.api_key.trim().eq_ignore_ascii_case("env") {
            self.api_key = match self.provider.as_str() {
                "openai" => env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow::anyhow!("Missing OPENAI_API_KEY env var"))?,
                "anthropic" => env::var("ANTHROPIC_API_KEY")
                    .map_err(|_| anyhow::anyhow!("Missing ANTHROPIC_API_KEY env var"))?,
                "mock" => String::new(),
                other => anyhow::bail!("Unsupported provider in config: {other}"),
            };
        }

        if self.timeout_ms == 0 {
            self.timeout_ms = default_timeout_ms();
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[serial_test::serial]
    #[test]
    fn env_key_is_resolved_by_provider() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"enabled": true, "provider": "Claude", "api_key": "ENV"}}"#).unwrap();

        env::set_var("ANTHROPIC_API_KEY", "sk-ant-test");
        let cfg = AiConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.provider, "anthropic");
        assert_eq!(cfg.api_key, "sk-ant-test");
        assert_eq!(cfg.daily_limit, 20);

        env::remove_var("ANTHROPIC_API_KEY");
        assert!(AiConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn disabled_config_skips_key_lookup() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"enabled": false, "provider": "openai", "api_key": "ENV", "timeout_ms": 0}}"#).unwrap();
        let cfg = AiConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.api_key, "ENV");
        assert_eq!(cfg.timeout_ms, 30_000);
    }
}
