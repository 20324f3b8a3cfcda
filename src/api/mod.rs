// HTTP surface - axum router, shared state and error mapping

pub mod auth;
pub mod download;
pub mod server;
pub mod setup;

use crate::auth::{
    AuthBridge, AuthDomain, ConsoleDeviceCodeProvider, CredentialPersistence, CredentialStore,
    HttpDeviceCodeProvider,
};
use crate::config::PanelConfig;
use crate::console::{ConsoleBridge, ConsoleError, DockerConsole, LayeredClassifier};
use crate::docker::DockerError;
use crate::finalize::ConfigFinalizer;
use crate::progress::{is_extracted, AssetDownloader, ProgressError, ProgressRelay};
use crate::setup::{FileSessionStore, RuntimeFacts, SessionId, SetupError, StepSequencer};
use crate::system_check::{SystemCheckReport, SystemChecker};
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use crate::setup::payload::Patchline;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

pub const SESSION_HEADER: &str = "x-setup-session";

/// Everything the handlers share. Cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PanelConfig>,
    pub sequencer: Arc<StepSequencer>,
    pub finalizer: Arc<ConfigFinalizer>,
    pub credentials: Arc<CredentialStore>,
    pub downloader_auth: Arc<AuthBridge>,
    pub server_auth: Arc<AuthBridge>,
    pub persistence: Arc<CredentialPersistence>,
    pub console: Arc<ConsoleBridge>,
    pub downloader: Arc<AssetDownloader>,
    pub download_relay: Arc<ProgressRelay>,
    pub extract_relay: Arc<ProgressRelay>,
    pub checker: Arc<SystemChecker>,
    pub last_check: Arc<RwLock<Option<SystemCheckReport>>>,
    pub deferred_download: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(config: PanelConfig) -> Result<Self, reqwest::Error> {
        let credentials = Arc::new(CredentialStore::new(config.credentials_dir()));
        let console = Arc::new(ConsoleBridge::new(
            Arc::new(LayeredClassifier::default()),
            config.reconnect.clone(),
        ));
        let server_console = Arc::new(DockerConsole::new(config.container_name.clone()));

        let downloader_provider = Arc::new(HttpDeviceCodeProvider::new(
            AuthDomain::Downloader,
            config.downloader_oauth.clone(),
            PanelConfig::downloader_remediation(),
        )?);
        let server_provider = Arc::new(ConsoleDeviceCodeProvider::new(
            server_console.clone(),
            console.clone(),
            config.server_login_command.clone(),
            config.server_prompt_timeout,
        ));

        Ok(Self {
            sequencer: Arc::new(StepSequencer::new(
                Arc::new(FileSessionStore::new(config.setup_dir())),
                config.validation.clone(),
                config.redirect_url.clone(),
                config.dev_mode,
            )),
            finalizer: Arc::new(ConfigFinalizer::new(
                config.panel_config_path(),
                config.server_config_path(),
            )),
            downloader_auth: Arc::new(AuthBridge::new(
                AuthDomain::Downloader,
                downloader_provider,
                credentials.clone(),
            )),
            server_auth: Arc::new(AuthBridge::new(
                AuthDomain::Server,
                server_provider,
                credentials.clone(),
            )),
            persistence: Arc::new(CredentialPersistence::new(
                server_console,
                console.clone(),
                config.server_persistence_command.clone(),
                config.persistence_timeout,
                config.persistence_record_path(),
            )),
            downloader: Arc::new(AssetDownloader::new(
                config.download_url_template.clone(),
                config.downloads_dir(),
            )?),
            download_relay: ProgressRelay::new("download"),
            extract_relay: ProgressRelay::new("extraction"),
            checker: Arc::new(SystemChecker::new(
                config.container_name.clone(),
                config.data_dir.clone(),
                config.downloader_oauth.is_some(),
            )),
            last_check: Arc::new(RwLock::new(None)),
            deferred_download: Arc::new(AtomicBool::new(false)),
            credentials,
            console,
            config: Arc::new(config),
        })
    }

    /// Live component state consulted by step validation.
    pub async fn runtime_facts(&self) -> RuntimeFacts {
        let system_checks = self.last_check.read().await.as_ref().map(SystemCheckReport::summary);

        let mut verified_patchlines = BTreeSet::new();
        for patchline in Patchline::ALL {
            match self.downloader.verify(patchline).await {
                Ok(report) if report.verified => {
                    verified_patchlines.insert(patchline);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Could not verify {} archive: {}", patchline.as_str(), e),
            }
        }

        let server_authenticated = self.server_auth.is_authenticated().await
            || self.credentials.exists(AuthDomain::Server).await;

        RuntimeFacts {
            system_checks,
            verified_patchlines,
            extraction_complete: is_extracted(&self.config.assets_dir()).await,
            server_authenticated,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(setup::status))
        .route("/system-check", get(setup::system_check))
        .route("/step/:step_id", get(setup::get_step).post(setup::save_step))
        .route("/step/:step_id/skip", post(setup::skip_step))
        .route("/back/:step_id", post(setup::go_back))
        .route("/complete", post(setup::complete))
        .route("/skip", post(setup::force_complete))
        .route("/reset", post(setup::reset))
        .route("/download/auth/start", post(auth::start_downloader_auth))
        .route("/download/auth/status", get(auth::downloader_auth_status))
        .route("/auth/server/start", post(auth::start_server_auth))
        .route("/auth/server/status", get(auth::server_auth_status))
        .route("/auth/persistence", post(auth::enable_persistence))
        .route("/auth/status", get(auth::auth_overview))
        .route("/download/start", post(download::start_download))
        .route("/download/verify", get(download::verify_download))
        .route("/download/status", get(download::download_status))
        .route("/download/progress", get(download::download_progress))
        .route("/assets/extract", post(download::start_extraction))
        .route("/assets/status", get(download::extraction_status))
        .route("/assets/progress", get(download::extraction_progress))
        .route("/server/start-first", post(server::start_first))
        .route("/server/console", get(server::console_events))
        .route("/server/logs", get(server::logs));

    Router::new().nest("/api/setup", api).with_state(state)
}

/// Session selected by the `X-Setup-Session` header.
pub struct Session(pub SessionId);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Session {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.headers.get(SESSION_HEADER) {
            None => Ok(Session(SessionId::default())),
            Some(value) => {
                let raw = value
                    .to_str()
                    .map_err(|_| ApiError::BadRequest("session header is not valid text".to_string()))?;
                SessionId::parse(raw)
                    .map(Session)
                    .map_err(|e| ApiError::BadRequest(e.to_string()))
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    ConfigurationRequired {
        message: String,
        remediation: Vec<String>,
    },
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::ConfigurationRequired { .. } => (StatusCode::FAILED_DEPENDENCY, "configuration_required"),
            ApiError::Setup(e) => match e {
                SetupError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
                SetupError::AlreadyComplete
                | SetupError::NotSkippable(_)
                | SetupError::AlreadyCompleted(_)
                | SetupError::NotReachable(_)
                | SetupError::MissingRequired(_) => (StatusCode::CONFLICT, "conflict"),
                SetupError::DevOnly => (StatusCode::FORBIDDEN, "dev_only"),
                SetupError::Finalize(_) | SetupError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
            ApiError::Progress(e) => match e {
                ProgressError::AlreadyRunning(_) => (StatusCode::CONFLICT, "already_running"),
                ProgressError::NotDownloaded => (StatusCode::CONFLICT, "conflict"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            },
            ApiError::Docker(DockerError::ContainerNotFound(_)) => (StatusCode::CONFLICT, "container_not_found"),
            ApiError::Console(ConsoleError::Docker(DockerError::ContainerNotFound(_))) => {
                (StatusCode::CONFLICT, "container_not_found")
            }
            ApiError::Console(_) | ApiError::Docker(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self);
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let mut body = json!({ "success": false, "error": message, "code": code });
        if let ApiError::ConfigurationRequired { remediation, .. } = &self {
            body["remediation"] = json!(remediation);
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::payload::ValidationError;
    use crate::setup::StepId;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(dir: &TempDir) -> AppState {
        let data_dir = dir.path().display().to_string();
        let config = PanelConfig::from_lookup(|key| match key {
            "PANEL_DATA_DIR" => Some(data_dir.clone()),
            _ => None,
        })
        .unwrap();
        AppState::new(config).unwrap()
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        session: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(id) = session {
            request = request.header(SESSION_HEADER, id);
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn pass_system_checks(state: &AppState) {
        *state.last_check.write().await = Some(SystemCheckReport::new(Vec::new(), Some(8192)));
    }

    #[test]
    fn errors_map_to_the_status_taxonomy() {
        let cases = [
            (ApiError::Setup(SetupError::Validation(ValidationError::PasswordTooShort { min: 12 })), 400),
            (ApiError::Setup(SetupError::NotSkippable(StepId::Language)), 409),
            (ApiError::Setup(SetupError::MissingRequired(vec![StepId::ServerAuth])), 409),
            (ApiError::Setup(SetupError::DevOnly), 403),
            (
                ApiError::ConfigurationRequired {
                    message: "not configured".into(),
                    remediation: vec![],
                },
                424,
            ),
            (ApiError::Progress(ProgressError::Worker("boom".into())), 500),
        ];
        for (error, expected) in cases {
            assert_eq!(error.status_and_code().0.as_u16(), expected, "{error}");
        }
    }

    #[test]
    fn session_ids_are_validated() {
        assert!(SessionId::parse("../etc").is_err());
        assert_eq!(SessionId::parse("kiosk_1").unwrap().as_str(), "kiosk_1");
    }

    #[tokio::test]
    async fn session_header_selects_an_isolated_session() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        pass_system_checks(&state).await;
        let app = router(state);

        let (status, body) = call(&app, "POST", "/api/setup/step/system-check", Some("kiosk_1"), Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nextStepId"], "language");

        let (_, kiosk) = call(&app, "GET", "/api/setup/status", Some("kiosk_1"), None).await;
        assert_eq!(kiosk["completedSteps"], json!(["system-check"]));
        let (_, default) = call(&app, "GET", "/api/setup/status", None, None).await;
        assert_eq!(default["completedSteps"], json!([]));

        let (status, body) = call(&app, "GET", "/api/setup/status", Some("../etc"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "bad_request");
    }

    #[tokio::test]
    async fn official_download_step_requires_the_chosen_patchline_on_disk() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        pass_system_checks(&state).await;

        let release = state.downloader.archive_path(Patchline::Release);
        tokio::fs::create_dir_all(release.parent().unwrap()).await.unwrap();
        tokio::fs::write(&release, b"PK\x03\x04release").await.unwrap();

        let facts = state.runtime_facts().await;
        assert_eq!(facts.verified_patchlines, BTreeSet::from([Patchline::Release]));

        let app = router(state);
        let steps = [
            ("system-check", json!({})),
            ("language", json!({"language": "en"})),
            (
                "admin-account",
                json!({"username": "admin", "password": "a-long-password", "confirmPassword": "a-long-password"}),
            ),
        ];
        for (step, body) in steps {
            let (status, _) = call(&app, "POST", &format!("/api/setup/step/{step}"), None, Some(body)).await;
            assert_eq!(status, StatusCode::OK, "{step}");
        }

        let (status, body) = call(
            &app,
            "POST",
            "/api/setup/step/download-method",
            None,
            Some(json!({"method": "official", "patchline": "pre-release"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation_error");

        let (status, body) = call(
            &app,
            "POST",
            "/api/setup/step/download-method",
            None,
            Some(json!({"method": "official", "patchline": "release"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nextStepId"], "assets");
    }

    #[tokio::test]
    async fn unconfigured_downloader_auth_answers_with_remediation() {
        let dir = TempDir::new().unwrap();
        let app = router(test_state(&dir));

        let (status, body) = call(&app, "POST", "/api/setup/download/auth/start", None, None).await;
        assert_eq!(status, StatusCode::FAILED_DEPENDENCY);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "configuration_required");
        assert!(!body["remediation"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn guarded_endpoints_refuse_out_of_order_calls() {
        let dir = TempDir::new().unwrap();
        let app = router(test_state(&dir));

        let (status, body) = call(&app, "POST", "/api/setup/skip", None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "dev_only");

        let (status, body) = call(&app, "POST", "/api/setup/auth/persistence", None, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");

        let (status, _) = call(&app, "POST", "/api/setup/assets/extract", None, None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&app, "GET", "/api/setup/auth/status", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["persistenceEnabled"], false);
        assert_eq!(body["downloader"]["phase"], "idle");
    }
}
