// External Auth Bridge - device-code grant lifecycle for one identity domain

use super::credentials::CredentialSink;
use super::{AuthDomain, DeviceCodeProvider, DeviceGrant, PollOutcome, ProviderError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Idle,
    Requesting,
    Pending,
    Authenticated,
    Expired,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    ConfigurationRequired,
    Rejected,
    Denied,
    Transport,
    Persistence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthErrorView {
    pub kind: AuthErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remediation: Vec<String>,
}

impl From<ProviderError> for AuthErrorView {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Transport(message) => AuthErrorView {
                kind: AuthErrorKind::Transport,
                message,
                remediation: Vec::new(),
            },
            ProviderError::Rejected(message) => AuthErrorView {
                kind: AuthErrorKind::Rejected,
                message,
                remediation: Vec::new(),
            },
            ProviderError::ConfigurationRequired { message, remediation } => AuthErrorView {
                kind: AuthErrorKind::ConfigurationRequired,
                message,
                remediation,
            },
        }
    }
}

/// Client view of a bridge. The device code itself never leaves the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub domain: AuthDomain,
    pub phase: AuthPhase,
    pub authenticated: bool,
    pub expired: bool,
    #[serde(skip)]
    pub device_code: Option<String>,
    pub user_code: Option<String>,
    pub verification_url: Option<String>,
    pub verification_url_direct: Option<String>,
    pub expires_in_seconds: Option<u64>,
    pub poll_interval_seconds: Option<u64>,
    pub transient_failures: u32,
    pub last_transient_error: Option<String>,
    pub error: Option<AuthErrorView>,
}

struct ActiveGrant {
    grant: DeviceGrant,
    deadline: Instant,
    interval: Duration,
    next_poll_at: Instant,
}

struct BridgeState {
    phase: AuthPhase,
    grant: Option<ActiveGrant>,
    transient_failures: u32,
    last_transient_error: Option<String>,
    error: Option<AuthErrorView>,
    /// Bumped whenever a grant is requested so late provider replies for a
    /// discarded grant are dropped.
    generation: u64,
}

impl BridgeState {
    fn idle(generation: u64) -> Self {
        Self {
            phase: AuthPhase::Idle,
            grant: None,
            transient_failures: 0,
            last_transient_error: None,
            error: None,
            generation,
        }
    }

    fn fail(&mut self, error: AuthErrorView) {
        self.phase = AuthPhase::Error;
        self.grant = None;
        self.error = Some(error);
    }
}

/// Drives one device-code flow. Polling is caller-driven and never blocks
/// on the human completing authorization. The state lock is never held
/// while the provider is being called.
pub struct AuthBridge {
    domain: AuthDomain,
    provider: Arc<dyn DeviceCodeProvider>,
    sink: Arc<dyn CredentialSink>,
    state: Mutex<BridgeState>,
}

impl AuthBridge {
    pub fn new(domain: AuthDomain, provider: Arc<dyn DeviceCodeProvider>, sink: Arc<dyn CredentialSink>) -> Self {
        Self {
            domain,
            provider,
            sink,
            state: Mutex::new(BridgeState::idle(0)),
        }
    }

    pub fn domain(&self) -> AuthDomain {
        self.domain
    }

    /// Request a grant if none is active. A requesting, pending or
    /// authenticated bridge is returned as is; a terminal one needs
    /// [`AuthBridge::retry`].
    pub async fn start(&self) -> AuthStatus {
        let generation = {
            let mut state = self.state.lock().await;
            if state.phase != AuthPhase::Idle {
                return self.status_of(&state);
            }
            Self::begin_request(&mut state)
        };
        self.request_grant(generation).await
    }

    /// Discard whatever grant or result exists and request a fresh one.
    pub async fn retry(&self) -> AuthStatus {
        let generation = {
            let mut state = self.state.lock().await;
            tracing::info!("Retrying {} authentication from {:?}", self.domain, state.phase);
            *state = BridgeState::idle(state.generation);
            Self::begin_request(&mut state)
        };
        self.request_grant(generation).await
    }

    pub async fn status(&self) -> AuthStatus {
        let state = self.state.lock().await;
        self.status_of(&state)
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.phase == AuthPhase::Authenticated
    }

    /// Poll the provider if the grant's interval has elapsed.
    pub async fn poll(&self) -> AuthStatus {
        let (grant, generation) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.phase != AuthPhase::Pending {
                return self.status_of(state);
            }

            let now = Instant::now();
            let (expired, due) = match state.grant.as_ref() {
                Some(active) => (now >= active.deadline, now >= active.next_poll_at),
                None => {
                    state.phase = AuthPhase::Idle;
                    return self.status_of(state);
                }
            };
            if expired {
                tracing::info!("{} device code expired", self.domain);
                state.phase = AuthPhase::Expired;
                state.grant = None;
                return self.status_of(state);
            }
            match state.grant.as_mut() {
                // Reserve the slot so concurrent callers do not poll too.
                Some(active) if due => {
                    active.next_poll_at = now + active.interval;
                    (active.grant.clone(), state.generation)
                }
                _ => return self.status_of(state),
            }
        };

        let outcome = self.provider.poll(&grant).await;

        let mut state = self.state.lock().await;
        if state.generation != generation || state.phase != AuthPhase::Pending {
            tracing::debug!("Dropping {} poll result for a discarded grant", self.domain);
            return self.status_of(&state);
        }
        let now = Instant::now();
        match outcome {
            Ok(PollOutcome::Pending) => self.schedule_next(&mut state, now, Duration::ZERO),
            Ok(PollOutcome::SlowDown) => self.schedule_next(&mut state, now, SLOW_DOWN_STEP),
            Ok(PollOutcome::Authorized(credentials)) => match self.sink.persist(&credentials).await {
                Ok(()) => {
                    tracing::info!("{} authentication complete", self.domain);
                    state.phase = AuthPhase::Authenticated;
                    state.grant = None;
                    state.error = None;
                }
                Err(e) => {
                    tracing::error!("Failed to store {} credentials: {}", self.domain, e);
                    state.fail(AuthErrorView {
                        kind: AuthErrorKind::Persistence,
                        message: e.to_string(),
                        remediation: Vec::new(),
                    });
                }
            },
            Ok(PollOutcome::Expired) => {
                state.phase = AuthPhase::Expired;
                state.grant = None;
            }
            Ok(PollOutcome::Denied(message)) => {
                tracing::warn!("{} authorization denied: {}", self.domain, message);
                state.fail(AuthErrorView {
                    kind: AuthErrorKind::Denied,
                    message,
                    remediation: Vec::new(),
                });
            }
            Err(ProviderError::Transport(message)) => {
                tracing::warn!("{} poll failed, keeping grant: {}", self.domain, message);
                state.transient_failures += 1;
                state.last_transient_error = Some(message);
                self.schedule_next(&mut state, now, Duration::ZERO);
            }
            Err(e) => {
                tracing::warn!("{} authentication failed: {}", self.domain, e);
                state.fail(e.into());
            }
        }
        self.status_of(&state)
    }

    fn begin_request(state: &mut BridgeState) -> u64 {
        state.generation += 1;
        state.phase = AuthPhase::Requesting;
        state.generation
    }

    async fn request_grant(&self, generation: u64) -> AuthStatus {
        let result = self.provider.request_grant().await;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            tracing::debug!("Dropping superseded {} device code", self.domain);
            return self.status_of(&state);
        }
        match result {
            Ok(grant) => {
                let now = Instant::now();
                let interval = Duration::from_secs(grant.poll_interval_seconds.max(1));
                tracing::info!("{} device code issued", self.domain);
                state.phase = AuthPhase::Pending;
                state.error = None;
                state.grant = Some(ActiveGrant {
                    deadline: now + Duration::from_secs(grant.expires_in),
                    next_poll_at: now + interval,
                    interval,
                    grant,
                });
            }
            Err(e) => {
                tracing::warn!("{} device code request failed: {}", self.domain, e);
                state.fail(e.into());
            }
        }
        self.status_of(&state)
    }

    fn schedule_next(&self, state: &mut BridgeState, now: Instant, extra: Duration) {
        if let Some(active) = state.grant.as_mut() {
            active.interval += extra;
            active.next_poll_at = now + active.interval;
        }
    }

    fn status_of(&self, state: &BridgeState) -> AuthStatus {
        let now = Instant::now();
        let grant = state.grant.as_ref();
        AuthStatus {
            domain: self.domain,
            phase: state.phase,
            authenticated: state.phase == AuthPhase::Authenticated,
            expired: state.phase == AuthPhase::Expired,
            device_code: grant.map(|g| g.grant.device_code.clone()),
            user_code: grant.map(|g| g.grant.user_code.clone()),
            verification_url: grant.map(|g| g.grant.verification_url.clone()),
            verification_url_direct: grant.and_then(|g| g.grant.verification_url_direct.clone()),
            expires_in_seconds: grant.map(|g| g.deadline.saturating_duration_since(now).as_secs()),
            poll_interval_seconds: grant.map(|g| g.interval.as_secs()),
            transient_failures: state.transient_failures,
            last_transient_error: state.last_transient_error.clone(),
            error: state.error.clone(),
        }
    }
}
