// Step sequencer endpoints

use super::{ApiError, AppState, Session};
use crate::setup::{SetupCompleted, SetupStatus, StepId, StepSaved};
use crate::system_check::SystemCheckReport;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

fn parse_step(raw: &str) -> Result<StepId, ApiError> {
    raw.parse::<StepId>().map_err(|e| ApiError::BadRequest(e.to_string()))
}

pub async fn status(State(state): State<AppState>, Session(id): Session) -> Result<Json<SetupStatus>, ApiError> {
    Ok(Json(state.sequencer.get_status(&id).await?))
}

/// Runs the checks and caches the report for system-check validation.
pub async fn system_check(State(state): State<AppState>) -> Json<SystemCheckReport> {
    let report = state.checker.run().await;
    *state.last_check.write().await = Some(report.clone());
    Json(report)
}

pub async fn save_step(
    State(state): State<AppState>,
    Session(id): Session,
    Path(step): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<StepSaved>, ApiError> {
    let step = parse_step(&step)?;
    tracing::info!("Saving step {} for session {}", step, id);
    let facts = state.runtime_facts().await;
    Ok(Json(state.sequencer.save_step(&id, step, body, &facts).await?))
}

pub async fn get_step(
    State(state): State<AppState>,
    Session(id): Session,
    Path(step): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let step = parse_step(&step)?;
    let payload = state.sequencer.payload(&id, step).await?;
    Ok(Json(json!({ "stepId": step, "payload": payload })))
}

pub async fn skip_step(
    State(state): State<AppState>,
    Session(id): Session,
    Path(step): Path<String>,
) -> Result<Json<StepSaved>, ApiError> {
    let step = parse_step(&step)?;
    Ok(Json(state.sequencer.skip_step(&id, step).await?))
}

pub async fn go_back(
    State(state): State<AppState>,
    Session(id): Session,
    Path(step): Path<String>,
) -> Result<Json<SetupStatus>, ApiError> {
    let step = parse_step(&step)?;
    Ok(Json(state.sequencer.go_back(&id, step).await?))
}

pub async fn complete(State(state): State<AppState>, Session(id): Session) -> Result<Json<SetupCompleted>, ApiError> {
    Ok(Json(
        state
            .sequencer
            .complete_setup(&id, state.finalizer.as_ref())
            .await?,
    ))
}

pub async fn force_complete(
    State(state): State<AppState>,
    Session(id): Session,
) -> Result<Json<SetupCompleted>, ApiError> {
    Ok(Json(state.sequencer.force_complete(&id).await?))
}

pub async fn reset(State(state): State<AppState>, Session(id): Session) -> Result<Json<SetupStatus>, ApiError> {
    Ok(Json(state.sequencer.reset(&id).await?))
}
