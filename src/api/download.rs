// Download and extraction endpoints with SSE progress

use super::{ApiError, AppState};
use crate::auth::{AuthDomain, AuthPhase};
use crate::progress::{extract_archive, is_extracted, ProgressError, ProgressEvent, ProgressRelay, VerifyReport};
use crate::setup::payload::Patchline;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

type EventStream = BoxStream<'static, Result<Event, axum::Error>>;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PatchlineRequest {
    pub patchline: Option<Patchline>,
}

async fn downloader_token(state: &AppState) -> Result<Option<String>, ApiError> {
    let token = state
        .credentials
        .load(AuthDomain::Downloader)
        .await
        .and_then(|c| c.access_token);
    match token {
        Some(token) => Ok(Some(token)),
        None if state.config.downloader_oauth.is_some() => {
            Err(ApiError::Conflict("downloader is not authenticated".to_string()))
        }
        // No identity provider configured: the download URL is expected to be open.
        None => Ok(None),
    }
}

fn launch_download(state: &AppState, patchline: Patchline, token: Option<String>) -> Result<(), ProgressError> {
    let reporter = state.download_relay.begin()?;
    let downloader = state.downloader.clone();
    tokio::spawn(async move {
        match downloader.download(patchline, token, reporter).await {
            Ok(manifest) => tracing::info!(
                "Downloaded {} ({} bytes)",
                manifest.file_name,
                manifest.size_bytes
            ),
            Err(e) => tracing::error!("Download of {} failed: {}", patchline.as_str(), e),
        }
    });
    Ok(())
}

pub async fn start_download(
    State(state): State<AppState>,
    body: Option<Json<PatchlineRequest>>,
) -> Result<Json<Value>, ApiError> {
    let patchline = body.and_then(|Json(b)| b.patchline).unwrap_or_default();
    let token = downloader_token(&state).await?;
    launch_download(&state, patchline, token)?;
    Ok(Json(json!({ "success": true, "status": state.download_relay.status() })))
}

/// Wait for the downloader bridge to authenticate, then download. At most
/// one waiter runs at a time.
pub fn spawn_deferred_download(state: AppState, patchline: Patchline) {
    if state.deferred_download.swap(true, Ordering::SeqCst) {
        tracing::debug!("Deferred download already waiting for authorization");
        return;
    }
    tokio::spawn(async move {
        run_deferred_download(&state, patchline).await;
        state.deferred_download.store(false, Ordering::SeqCst);
    });
}

async fn run_deferred_download(state: &AppState, patchline: Patchline) {
    loop {
        let status = state.downloader_auth.poll().await;
        match status.phase {
            AuthPhase::Authenticated => break,
            AuthPhase::Pending | AuthPhase::Requesting => {
                let wait = status.poll_interval_seconds.unwrap_or(5).max(1);
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }
            phase => {
                tracing::warn!("Deferred download abandoned, downloader auth is {:?}", phase);
                return;
            }
        }
    }

    let started = match downloader_token(state).await {
        Ok(token) => launch_download(state, patchline, token).map_err(ApiError::from),
        Err(e) => Err(e),
    };
    match started {
        Ok(()) => tracing::info!("Deferred download started for {}", patchline.as_str()),
        Err(e) => tracing::warn!("Deferred download could not start: {}", e),
    }
}

pub async fn verify_download(
    State(state): State<AppState>,
    Query(query): Query<PatchlineRequest>,
) -> Result<Json<VerifyReport>, ApiError> {
    let patchline = match query.patchline {
        Some(p) => p,
        None => state
            .downloader
            .read_manifest()
            .await
            .map(|m| m.patchline)
            .unwrap_or_default(),
    };
    Ok(Json(state.downloader.verify(patchline).await?))
}

pub async fn download_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": state.download_relay.status(),
        "manifest": state.downloader.read_manifest().await,
    }))
}

pub async fn download_progress(State(state): State<AppState>) -> Sse<EventStream> {
    progress_sse(state.download_relay.clone())
}

pub async fn start_extraction(
    State(state): State<AppState>,
    body: Option<Json<PatchlineRequest>>,
) -> Result<Json<Value>, ApiError> {
    let requested = body.and_then(|Json(b)| b.patchline);
    let patchline = match requested {
        Some(p) => p,
        None => state
            .downloader
            .read_manifest()
            .await
            .map(|m| m.patchline)
            .unwrap_or_default(),
    };
    let archive = state.downloader.archive_path(patchline);
    if !tokio::fs::try_exists(&archive).await.unwrap_or(false) {
        return Err(ProgressError::NotDownloaded.into());
    }

    let reporter = state.extract_relay.begin().map_err(ProgressError::from)?;
    let dest = state.config.assets_dir();
    tokio::spawn(async move {
        match extract_archive(archive, dest, reporter).await {
            Ok(summary) => tracing::info!(
                "Extracted {} files into {}",
                summary.files_extracted,
                summary.destination.display()
            ),
            Err(e) => tracing::error!("Extraction failed: {}", e),
        }
    });
    Ok(Json(json!({ "success": true, "status": state.extract_relay.status() })))
}

pub async fn extraction_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": state.extract_relay.status(),
        "extracted": is_extracted(&state.config.assets_dir()).await,
    }))
}

pub async fn extraction_progress(State(state): State<AppState>) -> Sse<EventStream> {
    progress_sse(state.extract_relay.clone())
}

fn to_sse_event(event: &ProgressEvent) -> Result<Event, axum::Error> {
    let name = match event {
        ProgressEvent::Progress(_) => "progress",
        ProgressEvent::Complete(_) => "complete",
        ProgressEvent::Error { .. } => "error",
    };
    Event::default().event(name).json_data(event)
}

/// Live events of the current operation, ending after its terminal event.
/// A client arriving after the end gets that terminal event once.
fn progress_sse(relay: Arc<ProgressRelay>) -> Sse<EventStream> {
    Sse::new(progress_events(relay)).keep_alive(KeepAlive::default())
}

fn progress_events(relay: Arc<ProgressRelay>) -> EventStream {
    // Subscribe before checking so a terminal event cannot slip between.
    // The status turns terminal before the slot is released, so it is
    // authoritative whether or not the slot still looks busy.
    let rx = relay.subscribe();
    if let Some(terminal) = relay.terminal_event() {
        return stream::once(async move { to_sse_event(&terminal) }).boxed();
    }

    stream::unfold(Some(rx), |rx| async move {
        let mut rx = rx?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let next = if event.is_terminal() { None } else { Some(rx) };
                    return Some((to_sse_event(&event), next));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Progress subscriber skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscribers_get_only_the_terminal_event() {
        let relay = ProgressRelay::new("download");
        let mut reporter = relay.begin().unwrap();
        reporter.set_totals(None, Some(100));
        reporter.set_bytes(100);
        reporter.complete();

        let events: Vec<_> = progress_events(relay).collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_ok());
    }

    #[tokio::test]
    async fn finished_operation_is_reported_even_while_its_slot_is_held() {
        let relay = ProgressRelay::new("download");
        let reporter = relay.begin().unwrap();
        // Terminal status published, slot not yet released.
        relay.emit_for_test(ProgressEvent::Error {
            message: "connection reset".into(),
        });
        assert!(relay.is_running());

        let events: Vec<_> = progress_events(relay.clone()).collect().await;
        assert_eq!(events.len(), 1);
        drop(reporter);
    }

    #[tokio::test]
    async fn live_stream_ends_after_the_terminal_event() {
        let relay = ProgressRelay::new("extraction");
        let mut reporter = relay.begin().unwrap();
        let stream = progress_events(relay.clone());

        reporter.set_totals(Some(2), None);
        reporter.set_files(1, Some("a.txt".into()));
        reporter.fail("disk full");

        let events: Vec<_> = stream.collect().await;
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.is_ok()));
    }
}
