// First server start, live console and stateless log tail

use super::{ApiError, AppState};
use crate::console::classify::{derive_flags, strip_ansi};
use crate::console::{ConsoleEvent, DockerLogSource, EventKind, LogSource};
use crate::docker::DockerManager;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;

const DEFAULT_LOG_LINES: usize = 200;
const MAX_LOG_LINES: usize = 2000;

pub async fn start_first(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let container = state.config.container_name.clone();
    let docker = DockerManager::new().await?;
    docker.start_container(&container).await?;
    let container_state = docker.container_state(&container).await?;

    state
        .console
        .attach(Arc::new(DockerLogSource::new(container.clone())))
        .await;
    tracing::info!("First start of {} requested, console attached", container);

    Ok(Json(json!({
        "success": true,
        "container": container,
        "state": container_state,
        "connection": state.console.state(),
    })))
}

fn console_event(event: &ConsoleEvent) -> Result<Event, axum::Error> {
    let name = match event.kind {
        EventKind::Log => "log",
        EventKind::AuthRequired => "auth_required",
        EventKind::Started => "started",
        EventKind::Error => "error",
    };
    Event::default().event(name).json_data(event)
}

pub async fn console_events(
    State(state): State<AppState>,
) -> Sse<BoxStream<'static, Result<Event, axum::Error>>> {
    let rx = state.console.subscribe();
    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((console_event(&event), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Console subscriber skipped {} lines", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events.boxed()).keep_alive(KeepAlive::default())
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

fn requested_lines(lines: Option<usize>) -> usize {
    lines.unwrap_or(DEFAULT_LOG_LINES).clamp(1, MAX_LOG_LINES)
}

/// Tail of the container log with boot flags derived from it. Works
/// whether or not the console bridge is attached.
pub async fn logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Result<Json<Value>, ApiError> {
    let lines = requested_lines(query.lines);
    let source = DockerLogSource::new(state.config.container_name.clone());
    let raw = source.tail(lines).await?;
    let flags = derive_flags(state.console.classifier().as_ref(), &raw);
    let lines: Vec<String> = raw.iter().map(|line| strip_ansi(line)).collect();

    Ok(Json(json!({
        "lines": lines,
        "booted": flags.booted,
        "authRequired": flags.auth_required,
        "lastError": flags.last_error,
        "connection": state.console.state(),
    })))
}
