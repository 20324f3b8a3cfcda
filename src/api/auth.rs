// Device-code auth endpoints for the downloader and the game server

use super::{download, ApiError, AppState};
use crate::auth::{AuthDomain, AuthErrorKind, AuthPhase, AuthStatus};
use crate::console::ConnectionState;
use crate::setup::payload::{DownloadMethod, Patchline};
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthStartRequest {
    pub retry: bool,
    /// Start the download server-side as soon as authorization lands.
    pub deferred: bool,
    pub method: Option<DownloadMethod>,
    pub patchline: Option<Patchline>,
}

fn require_configuration(status: &AuthStatus) -> Result<(), ApiError> {
    match &status.error {
        Some(error) if error.kind == AuthErrorKind::ConfigurationRequired => Err(ApiError::ConfigurationRequired {
            message: error.message.clone(),
            remediation: error.remediation.clone(),
        }),
        _ => Ok(()),
    }
}

pub async fn start_downloader_auth(
    State(state): State<AppState>,
    body: Option<Json<AuthStartRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    if request.method == Some(DownloadMethod::Manual) {
        return Err(ApiError::BadRequest(
            "manual downloads do not need authentication".to_string(),
        ));
    }

    let status = if request.retry {
        state.downloader_auth.retry().await
    } else {
        state.downloader_auth.start().await
    };
    require_configuration(&status)?;

    let deferred = request.deferred && matches!(status.phase, AuthPhase::Pending | AuthPhase::Authenticated);
    if deferred {
        download::spawn_deferred_download(state.clone(), request.patchline.unwrap_or_default());
    }
    Ok(Json(json!({ "success": true, "deferred": deferred, "auth": status })))
}

pub async fn downloader_auth_status(State(state): State<AppState>) -> Json<AuthStatus> {
    Json(state.downloader_auth.poll().await)
}

pub async fn start_server_auth(
    State(state): State<AppState>,
    body: Option<Json<AuthStartRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    if state.console.state() == ConnectionState::Detached {
        return Err(ApiError::Conflict(
            "server console is not attached; start the server first".to_string(),
        ));
    }

    let status = if request.retry {
        state.server_auth.retry().await
    } else {
        state.server_auth.start().await
    };
    require_configuration(&status)?;
    Ok(Json(json!({ "success": true, "auth": status })))
}

pub async fn server_auth_status(State(state): State<AppState>) -> Json<AuthStatus> {
    Json(state.server_auth.poll().await)
}

pub async fn enable_persistence(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if !state.server_auth.is_authenticated().await && !state.credentials.exists(AuthDomain::Server).await {
        return Err(ApiError::Conflict("game server is not authenticated".to_string()));
    }
    let enabled = state.persistence.enable().await?;
    Ok(Json(json!({ "success": enabled, "enabled": enabled })))
}

pub async fn auth_overview(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "downloader": state.downloader_auth.status().await,
        "server": state.server_auth.status().await,
        "persistenceEnabled": state.persistence.is_enabled().await,
        "downloaderCredentialsStored": state.credentials.exists(AuthDomain::Downloader).await,
        "serverCredentialsStored": state.credentials.exists(AuthDomain::Server).await,
    }))
}
