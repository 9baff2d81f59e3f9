//! Error taxonomy for the collection pipeline.
//!
//! Unit-level failures (`FetchError`) never leave a collector; they are folded
//! into `CollectionResult::Failure`. Source-level problems surface as
//! `PipelineWarning`s. Only `PipelineError` values are fatal to a run.

use serde::Serialize;
use thiserror::Error;

use crate::ingest::types::SourceKind;

/// Failure of a single upstream call (or of one collection unit).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// Provider kept throttling after the one allowed wait cycle.
    #[error("rate limited by {provider} (retry after {retry_after_ms}ms)")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    /// Body was not JSON (typically an HTML error page behind a proxy).
    #[error("invalid response format: {0}")]
    InvalidResponseFormat(String),

    #[error("network timeout after {0}ms")]
    NetworkTimeout(u64),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("http error: {0}")]
    Http(String),

    /// JSON was well-formed but did not have the expected shape.
    #[error("parse error: {0}")]
    Parse(String),
}

impl FetchError {
    /// Short machine-friendly tag used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::InvalidResponseFormat(_) => "invalid_response_format",
            FetchError::NetworkTimeout(_) => "network_timeout",
            FetchError::Status(_) => "status",
            FetchError::Http(_) => "http",
            FetchError::Parse(_) => "parse",
        }
    }
}

/// Timeouts map to `Http`. Callers that own a timeout budget check
/// `is_timeout()` first and report `NetworkTimeout` with that budget.
impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Http(e.to_string())
        }
    }
}

/// Fatal pipeline errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Nothing usable from any source: there is nothing to reduce or synthesize.
    #[error("no usable data from any source (reddit, twitter, telegram all empty)")]
    AllSourcesEmpty,

    /// Time windows are overlapping, unordered or empty. Detected at load time.
    #[error("invalid time window configuration: {0}")]
    PartitionConfig(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Non-fatal, user-visible degradation notes attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineWarning {
    /// Source answered but nothing survived filtering.
    SourceExhausted { source: SourceKind },
    /// Some units failed, some succeeded.
    SourcePartialFailure {
        source: SourceKind,
        failed_units: Vec<String>,
        succeeded: usize,
    },
    /// Every unit of the source failed.
    SourceFailed {
        source: SourceKind,
        failed_units: Vec<String>,
    },
    MarketDataUnavailable { reason: String },
}

impl std::fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineWarning::SourceExhausted { source } => {
                write!(f, "{source}: no usable items after filtering")
            }
            PipelineWarning::SourcePartialFailure {
                source,
                failed_units,
                succeeded,
            } => write!(
                f,
                "{source}: {} unit(s) failed ({}), {succeeded} succeeded",
                failed_units.len(),
                failed_units.join(", ")
            ),
            PipelineWarning::SourceFailed {
                source,
                failed_units,
            } => write!(
                f,
                "{source} unavailable ({} unit(s) failed), continuing without it",
                failed_units.len()
            ),
            PipelineWarning::MarketDataUnavailable { reason } => {
                write!(f, "market data unavailable: {reason}")
            }
        }
    }
}
