// src/api.rs
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::error::PipelineError;
use crate::ingest::config::clean_list;
use crate::ingest::scheduler::{CollectStatus, LatestPayload, RunSlot, StatusSnapshot};
use crate::ingest::types::{SourceKind, SourceUnits};
use crate::pipeline::{AnalysisMode, CollectRequest, Pipeline};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub slot: RunSlot,
    pub latest: LatestPayload,
    pub status: CollectStatus,
    /// Units used for a source the request does not mention.
    pub default_units: Arc<SourceUnits>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, default_units: SourceUnits) -> Self {
        Self {
            pipeline,
            slot: RunSlot::new(),
            latest: LatestPayload::default(),
            status: CollectStatus::new(),
            default_units: Arc::new(default_units),
        }
    }

    /// Share a status cell whose `progress_fn` already feeds the pipeline.
    pub fn with_status(mut self, status: CollectStatus) -> Self {
        self.status = status;
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/collect", post(collect))
        .route("/collect/cancel", post(cancel))
        .route("/collect/status", get(collect_status))
        .route("/latest", get(latest))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct CollectBody {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub symbol: Option<String>,
    /// `None` falls back to the configured units; `[]` skips the source.
    #[serde(default)]
    pub subreddits: Option<Vec<String>>,
    #[serde(default)]
    pub accounts: Option<Vec<String>>,
    #[serde(default)]
    pub chats: Option<Vec<String>>,
}

impl CollectBody {
    fn into_request(self, defaults: &SourceUnits) -> Result<CollectRequest, PipelineError> {
        let mode = AnalysisMode::parse(&self.mode, self.symbol.as_deref())?;
        let mut units = SourceUnits::new();
        for (kind, requested) in [
            (SourceKind::Reddit, self.subreddits),
            (SourceKind::Twitter, self.accounts),
            (SourceKind::Telegram, self.chats),
        ] {
            let list = match requested {
                Some(v) => clean_list(v),
                None => defaults.get(&kind).cloned().unwrap_or_default(),
            };
            if !list.is_empty() {
                units.insert(kind, list);
            }
        }
        Ok(CollectRequest { mode, units })
    }
}

fn error_body(status: StatusCode, msg: impl ToString) -> Response {
    (status, Json(json!({ "error": msg.to_string() }))).into_response()
}

async fn collect(State(state): State<AppState>, Json(body): Json<CollectBody>) -> Response {
    let request = match body.into_request(&state.default_units) {
        Ok(r) => r,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e),
    };
    let Some(ticket) = state.slot.try_begin() else {
        return error_body(StatusCode::CONFLICT, "a collection run is already in flight");
    };

    state.status.begin();
    let outcome = state.pipeline.run(&request, ticket.abort()).await;
    state.status.finish(&outcome);
    drop(ticket);

    match outcome {
        Ok(payload) => match serde_json::to_value(&payload) {
            Ok(v) => {
                *state.latest.write().await = Some(v.clone());
                (StatusCode::OK, Json(v)).into_response()
            }
            Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e),
        },
        Err(e @ PipelineError::AllSourcesEmpty) => error_body(StatusCode::UNPROCESSABLE_ENTITY, e),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn cancel(State(state): State<AppState>) -> Response {
    if state.slot.cancel() {
        (StatusCode::ACCEPTED, Json(json!({ "cancelled": true }))).into_response()
    } else {
        error_body(StatusCode::NOT_FOUND, "no collection run in flight")
    }
}

async fn collect_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.status.snapshot(state.slot.is_busy()))
}

async fn latest(State(state): State<AppState>) -> Response {
    match state.latest.read().await.as_ref() {
        Some(v) => (StatusCode::OK, Json(v.clone())).into_response(),
        None => error_body(StatusCode::NOT_FOUND, "no payload collected yet"),
    }
}
