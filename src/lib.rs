// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod merge;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod reduce;
pub mod summarizer;
pub mod windows;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::error::{FetchError, PipelineError, PipelineWarning};
pub use crate::ingest::types::{CollectionResult, SourceCollector, SourceItem, SourceKind};
pub use crate::orchestrator::{AbortFlag, FanOutOrchestrator};
pub use crate::pipeline::{AnalysisMode, CollectRequest, Pipeline, SynthesisPayload};
