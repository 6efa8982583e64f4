//! JSON endpoints over the moderation pipeline.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{Error, JobError, LearningError, RefineError, WorkflowError};
use crate::item::{Actor, ItemId};
use crate::jobs::{AdminReset, BatchRunner, JobKind};
use crate::learning::{LearningEngine, PatternKind};
use crate::pipeline::ModerationPipeline;
use crate::store::Database;
use crate::workflow::WorkflowStage;

/// Shared state for API routes.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<dyn Database>,
    pub pipeline: Arc<ModerationPipeline>,
    pub learning: Arc<LearningEngine>,
    pub runner: Arc<BatchRunner>,
    pub reset: Arc<AdminReset>,
}

/// Error body `{"error": "..."}` with a status derived from the error kind.
pub struct ApiError(StatusCode, String);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        let e = e.into();
        let status = match &e {
            Error::Workflow(WorkflowError::InvalidItem { .. }) => StatusCode::NOT_FOUND,
            Error::Workflow(WorkflowError::Locked { .. }) => StatusCode::CONFLICT,
            Error::Refine(RefineError::NotFound(_)) => StatusCode::NOT_FOUND,
            Error::Learning(LearningError::UnknownPatternType(_)) => StatusCode::BAD_REQUEST,
            Error::Job(JobError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            Error::Job(JobError::ResetRefused(_)) => StatusCode::FORBIDDEN,
            Error::Scheduler(_) | Error::Job(JobError::Scheduler(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("API request failed: {e}");
        }
        Self(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn admin(name: Option<String>) -> Actor {
    Actor::admin(name.unwrap_or_else(|| "admin".to_string()))
}

async fn require_item(state: &ApiState, id: ItemId) -> Result<crate::item::Item, ApiError> {
    state.db.get_item(id).await?.ok_or_else(|| {
        ApiError::from(WorkflowError::InvalidItem {
            id,
            reason: "no such item".into(),
        })
    })
}

#[derive(Deserialize)]
struct ScanRequest {
    text: String,
}

/// POST /api/scan
async fn scan(State(state): State<ApiState>, Json(req): Json<ScanRequest>) -> ApiResult {
    Ok(Json(state.pipeline.scanner().scan(&req.text)).into_response())
}

#[derive(Deserialize)]
struct EvaluateRequest {
    /// Text to judge; the stored body when absent.
    #[serde(default)]
    text: Option<String>,
}

/// POST /api/items/{id}/evaluate
async fn evaluate(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<EvaluateRequest>,
) -> ApiResult {
    let id = ItemId(id);
    let text = match req.text {
        Some(text) => text,
        None => require_item(&state, id).await?.body,
    };
    let decision = state.pipeline.gate().evaluate(id, &text).await?;
    Ok(Json(decision).into_response())
}

#[derive(Deserialize)]
struct RefineRequest {
    #[serde(default)]
    force: bool,
}

/// POST /api/items/{id}/refine
async fn refine(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<RefineRequest>,
) -> ApiResult {
    let outcome = state.pipeline.refiner().refine(ItemId(id), req.force).await?;
    Ok(Json(outcome).into_response())
}

/// POST /api/items/{id}/revert
async fn revert(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult {
    let reverted = state.pipeline.refiner().revert(ItemId(id)).await?;
    Ok(Json(json!({ "reverted": reverted })).into_response())
}

/// POST /api/items/{id}/process
async fn process(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult {
    let outcome = state.pipeline.process_item(ItemId(id)).await?;
    Ok(Json(outcome).into_response())
}

/// GET /api/items/{id}/stage
async fn get_stage(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult {
    let id = ItemId(id);
    require_item(&state, id).await?;
    let workflow = state.pipeline.workflow();
    let stage = workflow.get_stage(id).await?;
    let audit = workflow.audit_log(id).await?;
    Ok(Json(json!({ "item_id": id, "stage": stage, "audit": audit })).into_response())
}

#[derive(Deserialize)]
struct SetStageRequest {
    stage: WorkflowStage,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    actor: Option<String>,
}

/// PUT /api/items/{id}/stage
///
/// Administrative override: any stage may be forced to any other.
async fn set_stage(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<SetStageRequest>,
) -> ApiResult {
    let id = ItemId(id);
    let actor = admin(req.actor);
    let changed = state
        .pipeline
        .workflow()
        .set_stage(id, req.stage, &actor, req.note.as_deref())
        .await?;
    info!(item_id = %id, stage = %req.stage, actor = %actor, changed, "Stage set via API");
    Ok(Json(json!({ "item_id": id, "stage": req.stage, "changed": changed })).into_response())
}

#[derive(Deserialize)]
struct LearnRequest {
    before: String,
    after: String,
}

/// POST /api/items/{id}/learn
async fn learn(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<LearnRequest>,
) -> ApiResult {
    let id = ItemId(id);
    require_item(&state, id).await?;
    let observations = state
        .learning
        .learn_from_comparison(id, &req.before, &req.after)
        .await?;
    Ok(Json(json!({ "observations": observations })).into_response())
}

/// GET /api/patterns
async fn pattern_stats(State(state): State<ApiState>) -> ApiResult {
    Ok(Json(state.learning.pattern_stats().await?).into_response())
}

/// GET /api/patterns/{type}
async fn patterns_of_type(State(state): State<ApiState>, Path(kind): Path<String>) -> ApiResult {
    let kind: PatternKind = kind.parse()?;
    Ok(Json(state.learning.get_patterns(kind).await?).into_response())
}

#[derive(Deserialize)]
struct BulkRequest {
    #[serde(flatten)]
    kind: JobKind,
    item_ids: Vec<ItemId>,
    #[serde(default)]
    actor: Option<String>,
}

/// POST /api/bulk
async fn bulk(State(state): State<ApiState>, Json(req): Json<BulkRequest>) -> ApiResult {
    let token = state
        .runner
        .create_job(req.kind, req.item_ids, admin(req.actor))
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "token": token.id, "items": token.item_ids.len() })),
    )
        .into_response())
}

/// POST /api/bulk/backlog
async fn backlog(State(state): State<ApiState>) -> ApiResult {
    let tokens = state.runner.enqueue_backlog().await?;
    let ids: Vec<&str> = tokens.iter().map(|t| t.id.as_str()).collect();
    Ok((StatusCode::ACCEPTED, Json(json!({ "tokens": ids }))).into_response())
}

#[derive(Deserialize)]
struct ResetRequest {
    actor: String,
    confirmation: String,
}

/// POST /api/admin/reset
async fn nuclear_reset(State(state): State<ApiState>, Json(req): Json<ResetRequest>) -> ApiResult {
    let report = state
        .reset
        .nuclear_reset(&Actor::admin(req.actor), &req.confirmation)
        .await?;
    Ok(Json(report).into_response())
}

/// GET /api/admin/reset
async fn reset_log(State(state): State<ApiState>) -> ApiResult {
    Ok(Json(state.reset.reset_log().await?).into_response())
}

/// Build the moderation API routes.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/api/scan", post(scan))
        .route("/api/items/{id}/evaluate", post(evaluate))
        .route("/api/items/{id}/refine", post(refine))
        .route("/api/items/{id}/revert", post(revert))
        .route("/api/items/{id}/process", post(process))
        .route("/api/items/{id}/stage", get(get_stage).put(set_stage))
        .route("/api/items/{id}/learn", post(learn))
        .route("/api/patterns", get(pattern_stats))
        .route("/api/patterns/{kind}", get(patterns_of_type))
        .route("/api/bulk", post(bulk))
        .route("/api/bulk/backlog", post(backlog))
        .route("/api/admin/reset", post(nuclear_reset).get(reset_log))
        .with_state(state)
}
