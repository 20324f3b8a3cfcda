// Step Sequencer - drives the wizard state machine over a session store

use super::payload::{RuntimeFacts, StepPayload, ValidationError, ValidationRules};
use super::session::{SessionId, SetupSession, SetupStatus};
use super::steps::StepId;
use super::store::{SessionStore, StoreError};
use crate::finalize::{FinalizeError, SetupFinalizer};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("setup is already complete")]
    AlreadyComplete,

    #[error("step {0} cannot be skipped")]
    NotSkippable(StepId),

    #[error("step {0} is already completed")]
    AlreadyCompleted(StepId),

    #[error("step {0} is not reachable yet")]
    NotReachable(StepId),

    #[error("required steps are not completed: {}", .0.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "))]
    MissingRequired(Vec<StepId>),

    #[error("only available in development mode")]
    DevOnly,

    #[error("finalization failed: {0}")]
    Finalize(#[from] FinalizeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSaved {
    pub success: bool,
    pub next_step: usize,
    pub next_step_id: StepId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupCompleted {
    pub success: bool,
    pub redirect_url: String,
}

/// Single writer over the session store. Every mutation is
/// load, check, mutate, commit under one lock.
pub struct StepSequencer {
    store: Arc<dyn SessionStore>,
    rules: ValidationRules,
    redirect_url: String,
    dev_mode: bool,
    write_lock: Mutex<()>,
}

impl StepSequencer {
    pub fn new(
        store: Arc<dyn SessionStore>,
        rules: ValidationRules,
        redirect_url: impl Into<String>,
        dev_mode: bool,
    ) -> Self {
        Self {
            store,
            rules,
            redirect_url: redirect_url.into(),
            dev_mode,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dev_mode(&self) -> bool {
        self.dev_mode
    }

    pub async fn get_status(&self, id: &SessionId) -> Result<SetupStatus, SetupError> {
        Ok(self.store.load(id).await?.status())
    }

    /// Committed payload of a step with secrets removed.
    pub async fn payload(&self, id: &SessionId, step: StepId) -> Result<Option<StepPayload>, SetupError> {
        let session = self.store.load(id).await?;
        Ok(session.payload(step).map(StepPayload::redacted))
    }

    pub async fn save_step(
        &self,
        id: &SessionId,
        step: StepId,
        body: serde_json::Value,
        facts: &RuntimeFacts,
    ) -> Result<StepSaved, SetupError> {
        let _guard = self.write_lock.lock().await;
        let mut session = self.load_mutable(id).await?;
        ensure_reachable(&session, step)?;

        let payload = StepPayload::parse(step, body)?;
        if let Err(e) = payload.validate(&self.rules, facts) {
            tracing::info!("Rejected step {} for session {}: {}", step, id, e);
            return Err(e.into());
        }
        let payload = payload.seal(&session, facts)?;

        session.record_completed(payload);
        self.store.commit(&session).await?;
        tracing::info!(
            "Saved step {} for session {}, now at {}",
            step,
            id,
            session.current_step()
        );

        Ok(StepSaved {
            success: true,
            next_step: session.current_step_index,
            next_step_id: session.current_step(),
        })
    }

    pub async fn skip_step(&self, id: &SessionId, step: StepId) -> Result<StepSaved, SetupError> {
        let _guard = self.write_lock.lock().await;
        let mut session = self.load_mutable(id).await?;

        let definition = step.definition();
        if definition.required || !definition.skippable {
            return Err(SetupError::NotSkippable(step));
        }
        if session.completed_steps.contains(&step) {
            return Err(SetupError::AlreadyCompleted(step));
        }
        ensure_reachable(&session, step)?;

        session.record_skipped(step);
        self.store.commit(&session).await?;
        tracing::info!("Skipped step {} for session {}", step, id);

        Ok(StepSaved {
            success: true,
            next_step: session.current_step_index,
            next_step_id: session.current_step(),
        })
    }

    /// Move the cursor back to an already reachable step. Committed
    /// payloads stay in place.
    pub async fn go_back(&self, id: &SessionId, step: StepId) -> Result<SetupStatus, SetupError> {
        let _guard = self.write_lock.lock().await;
        let mut session = self.load_mutable(id).await?;
        ensure_reachable(&session, step)?;

        session.current_step_index = step.index();
        session.touch();
        self.store.commit(&session).await?;
        tracing::debug!("Session {} moved back to {}", id, step);
        Ok(session.status())
    }

    pub async fn complete_setup(
        &self,
        id: &SessionId,
        finalizer: &dyn SetupFinalizer,
    ) -> Result<SetupCompleted, SetupError> {
        let _guard = self.write_lock.lock().await;
        let mut session = self.store.load(id).await?;
        if session.setup_complete {
            return Ok(self.completed());
        }

        let missing = session.missing_required();
        if !missing.is_empty() {
            return Err(SetupError::MissingRequired(missing));
        }

        finalizer.finalize(&session).await?;

        session.setup_complete = true;
        session.touch();
        self.store.commit(&session).await?;
        tracing::info!("Setup completed for session {}", id);
        Ok(self.completed())
    }

    /// Marks setup complete without running the wizard. Development only.
    pub async fn force_complete(&self, id: &SessionId) -> Result<SetupCompleted, SetupError> {
        if !self.dev_mode {
            return Err(SetupError::DevOnly);
        }
        let _guard = self.write_lock.lock().await;
        let mut session = self.store.load(id).await?;
        session.setup_complete = true;
        session.touch();
        self.store.commit(&session).await?;
        tracing::warn!("Setup bypassed for session {} (development mode)", id);
        Ok(self.completed())
    }

    pub async fn reset(&self, id: &SessionId) -> Result<SetupStatus, SetupError> {
        if !self.dev_mode {
            return Err(SetupError::DevOnly);
        }
        let _guard = self.write_lock.lock().await;
        let session = SetupSession::new(id.clone());
        self.store.commit(&session).await?;
        tracing::warn!("Setup reset for session {} (development mode)", id);
        Ok(session.status())
    }

    async fn load_mutable(&self, id: &SessionId) -> Result<SetupSession, SetupError> {
        let session = self.store.load(id).await?;
        if session.setup_complete {
            return Err(SetupError::AlreadyComplete);
        }
        Ok(session)
    }

    fn completed(&self) -> SetupCompleted {
        SetupCompleted {
            success: true,
            redirect_url: self.redirect_url.clone(),
        }
    }
}

fn ensure_reachable(session: &SetupSession, step: StepId) -> Result<(), SetupError> {
    if step.index() > session.frontier_index() {
        return Err(SetupError::NotReachable(step));
    }
    Ok(())
}
