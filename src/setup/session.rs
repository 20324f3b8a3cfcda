// Setup session record

use super::payload::StepPayload;
use super::steps::{self, StepId, CANONICAL_STEPS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub const DEFAULT_SESSION_ID: &str = "default";

/// Identifier of a setup session. Restricted to a filesystem-safe alphabet
/// because it names the session file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: &str) -> Result<Self, InvalidSessionId> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(InvalidSessionId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self(DEFAULT_SESSION_ID.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = InvalidSessionId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SessionId::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session id: {0:?}")]
pub struct InvalidSessionId(pub String);

/// Durable wizard progress for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupSession {
    pub session_id: SessionId,
    pub current_step_index: usize,
    pub completed_steps: BTreeSet<StepId>,
    pub skipped_steps: BTreeSet<StepId>,
    pub setup_complete: bool,
    #[serde(default)]
    pub payloads: BTreeMap<StepId, StepPayload>,
    pub updated_at: DateTime<Utc>,
}

/// Read-only projection returned by `GET status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupStatus {
    pub setup_complete: bool,
    pub current_step: usize,
    pub current_step_id: StepId,
    pub total_steps: usize,
    pub completed_steps: Vec<StepId>,
    pub skipped_steps: Vec<StepId>,
}

impl SetupSession {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            current_step_index: 0,
            completed_steps: BTreeSet::new(),
            skipped_steps: BTreeSet::new(),
            setup_complete: false,
            payloads: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn current_step(&self) -> StepId {
        StepId::at(self.current_step_index).unwrap_or(CANONICAL_STEPS[0].id)
    }

    pub fn payload(&self, step: StepId) -> Option<&StepPayload> {
        self.payloads.get(&step)
    }

    pub fn is_resolved(&self, step: StepId) -> bool {
        self.completed_steps.contains(&step) || self.skipped_steps.contains(&step)
    }

    /// Furthest index the user may navigate to: the first unresolved step,
    /// or the last step once everything is resolved.
    pub fn frontier_index(&self) -> usize {
        CANONICAL_STEPS
            .iter()
            .position(|def| !self.is_resolved(def.id))
            .unwrap_or(steps::total_steps() - 1)
    }

    pub fn missing_required(&self) -> Vec<StepId> {
        steps::required_steps()
            .filter(|id| !self.completed_steps.contains(id))
            .collect()
    }

    /// Commit a validated payload and move to the next unresolved step.
    pub fn record_completed(&mut self, payload: StepPayload) {
        let step = payload.step_id();
        self.payloads.insert(step, payload);
        self.skipped_steps.remove(&step);
        self.completed_steps.insert(step);
        self.advance_past(step.index());
    }

    pub fn record_skipped(&mut self, step: StepId) {
        self.payloads.remove(&step);
        self.skipped_steps.insert(step);
        self.advance_past(step.index());
    }

    fn advance_past(&mut self, index: usize) {
        let next = CANONICAL_STEPS
            .iter()
            .enumerate()
            .skip(index + 1)
            .find(|(_, def)| !self.is_resolved(def.id))
            .map(|(i, _)| i);
        self.current_step_index = next.unwrap_or(steps::total_steps() - 1);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Repair invariants on a record read from disk: the index must resolve to a
    /// step and a step cannot be both completed and skipped.
    pub fn normalize(&mut self) {
        if self.current_step_index >= steps::total_steps() {
            self.current_step_index = steps::total_steps() - 1;
        }
        let overlap: Vec<StepId> = self
            .completed_steps
            .intersection(&self.skipped_steps)
            .copied()
            .collect();
        for step in overlap {
            self.skipped_steps.remove(&step);
        }
        // A skipped required step is not a legal state.
        self.skipped_steps.retain(|step| !step.is_required());
    }

    pub fn status(&self) -> SetupStatus {
        SetupStatus {
            setup_complete: self.setup_complete,
            current_step: self.current_step_index,
            current_step_id: self.current_step(),
            total_steps: steps::total_steps(),
            completed_steps: self.completed_steps.iter().copied().collect(),
            skipped_steps: self.skipped_steps.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::payload::{LanguagePayload, SecurityPayload};

    fn language() -> StepPayload {
        StepPayload::Language(LanguagePayload {
            language: "en".into(),
        })
    }

    #[test]
    fn session_ids_are_filesystem_safe() {
        assert!(SessionId::parse("install-01_a").is_ok());
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("../etc").is_err());
        assert!(SessionId::parse(&"a".repeat(65)).is_err());
        assert!(serde_json::from_str::<SessionId>("\"../x\"").is_err());
    }

    #[test]
    fn completing_moves_to_next_unresolved_step() {
        let mut session = SetupSession::new(SessionId::default());
        session.completed_steps.insert(StepId::SystemCheck);
        session.completed_steps.insert(StepId::AdminAccount);
        session.current_step_index = StepId::Language.index();

        session.record_completed(language());

        assert_eq!(session.current_step(), StepId::DownloadMethod);
        assert_eq!(session.frontier_index(), StepId::DownloadMethod.index());
    }

    #[test]
    fn completing_a_skipped_step_moves_it_out_of_skipped() {
        let mut session = SetupSession::new(SessionId::default());
        session.record_skipped(StepId::Security);
        assert!(session.skipped_steps.contains(&StepId::Security));

        session.record_completed(StepPayload::Security(SecurityPayload::default()));

        assert!(!session.skipped_steps.contains(&StepId::Security));
        assert!(session.completed_steps.contains(&StepId::Security));
    }

    #[test]
    fn index_stays_on_last_step_when_everything_is_resolved() {
        let mut session = SetupSession::new(SessionId::default());
        for def in CANONICAL_STEPS {
            session.completed_steps.insert(def.id);
        }
        session.completed_steps.remove(&StepId::Language);
        session.current_step_index = StepId::Language.index();

        session.record_completed(language());

        assert_eq!(session.current_step_index, steps::total_steps() - 1);
        assert!(session.missing_required().is_empty());
    }

    #[test]
    fn normalize_repairs_out_of_range_index_and_overlap() {
        let mut session = SetupSession::new(SessionId::default());
        session.current_step_index = 99;
        session.completed_steps.insert(StepId::Network);
        session.skipped_steps.insert(StepId::Network);
        session.skipped_steps.insert(StepId::AdminAccount);

        session.normalize();

        assert_eq!(session.current_step_index, steps::total_steps() - 1);
        assert!(session.skipped_steps.is_empty());
    }
}
