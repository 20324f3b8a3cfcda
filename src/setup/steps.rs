// Canonical wizard step list

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a wizard step. Declaration order is the canonical order,
/// so ordered sets of step ids iterate in wizard order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepId {
    SystemCheck,
    Language,
    AdminAccount,
    DownloadMethod,
    Assets,
    ServerAuth,
    ServerConfig,
    Security,
    Automation,
    Performance,
    Plugin,
    Integrations,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDefinition {
    pub id: StepId,
    pub required: bool,
    pub skippable: bool,
}

const fn required(id: StepId) -> StepDefinition {
    StepDefinition {
        id,
        required: true,
        skippable: false,
    }
}

const fn optional(id: StepId) -> StepDefinition {
    StepDefinition {
        id,
        required: false,
        skippable: true,
    }
}

pub const CANONICAL_STEPS: &[StepDefinition] = &[
    required(StepId::SystemCheck),
    required(StepId::Language),
    required(StepId::AdminAccount),
    required(StepId::DownloadMethod),
    optional(StepId::Assets),
    required(StepId::ServerAuth),
    required(StepId::ServerConfig),
    optional(StepId::Security),
    optional(StepId::Automation),
    optional(StepId::Performance),
    optional(StepId::Plugin),
    optional(StepId::Integrations),
    optional(StepId::Network),
];

impl StepId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::SystemCheck => "system-check",
            StepId::Language => "language",
            StepId::AdminAccount => "admin-account",
            StepId::DownloadMethod => "download-method",
            StepId::Assets => "assets",
            StepId::ServerAuth => "server-auth",
            StepId::ServerConfig => "server-config",
            StepId::Security => "security",
            StepId::Automation => "automation",
            StepId::Performance => "performance",
            StepId::Plugin => "plugin",
            StepId::Integrations => "integrations",
            StepId::Network => "network",
        }
    }

    pub fn definition(&self) -> &'static StepDefinition {
        &CANONICAL_STEPS[self.index()]
    }

    /// Position of this step in [`CANONICAL_STEPS`].
    pub fn index(&self) -> usize {
        // Variants are declared in canonical order.
        *self as usize
    }

    pub fn at(index: usize) -> Option<StepId> {
        CANONICAL_STEPS.get(index).map(|def| def.id)
    }

    pub fn is_required(&self) -> bool {
        self.definition().required
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepId {
    type Err = UnknownStep;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CANONICAL_STEPS
            .iter()
            .map(|def| def.id)
            .find(|id| id.as_str() == s)
            .ok_or_else(|| UnknownStep(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown step: {0}")]
pub struct UnknownStep(pub String);

pub fn total_steps() -> usize {
    CANONICAL_STEPS.len()
}

pub fn required_steps() -> impl Iterator<Item = StepId> {
    CANONICAL_STEPS
        .iter()
        .filter(|def| def.required)
        .map(|def| def.id)
}
