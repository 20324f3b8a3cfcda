// Typed step payloads and their validation rules

use super::session::SetupSession;
use super::steps::StepId;
use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::Argon2;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

lazy_static! {
    static ref USERNAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_]+$").expect("valid username regex");
}

pub const SUPPORTED_LANGUAGES: &[&str] = &["en", "de", "fr", "es", "pt-BR"];

/// RAM kept back for the host when clamping the performance step.
const HOST_RAM_RESERVE_MB: u64 = 512;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("system checks have not been run")]
    SystemChecksNotRun,

    #[error("required system checks failed: {}", .0.join(", "))]
    RequiredChecksFailed(Vec<String>),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("username must be between {min} and {max} characters")]
    UsernameLength { min: usize, max: usize },

    #[error("username may only contain letters, digits and underscores")]
    UsernameCharacters,

    #[error("password too short")]
    PasswordTooShort { min: usize },

    #[error("passwords do not match")]
    PasswordMismatch,

    #[error("{} download has not been verified", .0.as_str())]
    DownloadNotVerified(Patchline),

    #[error("asset extraction has not completed")]
    ExtractionIncomplete,

    #[error("game server is not authenticated")]
    ServerNotAuthenticated,

    #[error("server name must be between {min} and {max} characters")]
    ServerNameLength { min: usize, max: usize },

    #[error("MOTD must be at most {max} characters")]
    MotdTooLong { max: usize },

    #[error("max players must be between 1 and {max}")]
    MaxPlayersOutOfRange { max: u32 },

    #[error("failed to hash password: {0}")]
    HashFailed(String),
}

/// Numeric bounds applied by step validation. Loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRules {
    pub username_min: usize,
    pub username_max: usize,
    pub password_min: usize,
    pub server_name_min: usize,
    pub server_name_max: usize,
    pub motd_max: usize,
    pub max_players_max: u32,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            username_min: 3,
            username_max: 32,
            password_min: 12,
            server_name_min: 3,
            server_name_max: 64,
            motd_max: 256,
            max_players_max: 1000,
        }
    }
}

/// Outcome of the latest server-side system check run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub failed_required: Vec<String>,
    pub detected_ram_mb: Option<u64>,
}

/// Live component state consulted while validating a step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeFacts {
    pub system_checks: Option<CheckSummary>,
    /// Patchlines whose archive is on disk and passes verification.
    pub verified_patchlines: BTreeSet<Patchline>,
    pub extraction_complete: bool,
    pub server_authenticated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMethod {
    Official,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Patchline {
    #[default]
    Release,
    PreRelease,
}

impl Patchline {
    pub const ALL: [Patchline; 2] = [Patchline::Release, Patchline::PreRelease];

    pub fn as_str(&self) -> &'static str {
        match self {
            Patchline::Release => "release",
            Patchline::PreRelease => "pre-release",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Local,
    Lan,
    Public,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCheckPayload {
    #[serde(default)]
    pub acknowledged_warnings: bool,
    /// Filled in from the server-side check report, never from the client.
    #[serde(default)]
    pub detected_ram_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguagePayload {
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminAccountPayload {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, alias = "confirmPassword", skip_serializing_if = "Option::is_none")]
    pub password_confirmation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadMethodPayload {
    pub method: DownloadMethod,
    #[serde(default)]
    pub patchline: Patchline,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetsPayload {
    #[serde(default)]
    pub archive: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAuthPayload {
    #[serde(default)]
    pub persistence_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfigPayload {
    pub server_name: String,
    #[serde(default)]
    pub motd: String,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_max_players() -> u32 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityPayload {
    pub session_timeout_minutes: u32,
    pub login_attempt_limit: u32,
    pub require_two_factor: bool,
}

impl Default for SecurityPayload {
    fn default() -> Self {
        Self {
            session_timeout_minutes: 60,
            login_attempt_limit: 5,
            require_two_factor: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutomationPayload {
    pub backups_enabled: bool,
    pub backup_interval_hours: u32,
    pub backup_retention: u32,
    pub auto_restart: bool,
}

impl Default for AutomationPayload {
    fn default() -> Self {
        Self {
            backups_enabled: true,
            backup_interval_hours: 24,
            backup_retention: 7,
            auto_restart: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PerformancePayload {
    pub min_ram_mb: u64,
    pub max_ram_mb: u64,
    pub view_distance: u32,
}

impl Default for PerformancePayload {
    fn default() -> Self {
        Self {
            min_ram_mb: 1024,
            max_ram_mb: 4096,
            view_distance: 12,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginPayload {
    pub install_telemetry_plugin: bool,
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IntegrationsPayload {
    pub discord_webhook_url: Option<String>,
    pub notify_on_crash: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkPayload {
    pub access_mode: AccessMode,
    pub allowed_origins: Vec<String>,
    pub game_port: u16,
}

impl Default for NetworkPayload {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::Local,
            allowed_origins: Vec::new(),
            game_port: 5520,
        }
    }
}

/// One committed step answer. The variant always matches the step it is stored under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", content = "data", rename_all = "kebab-case")]
pub enum StepPayload {
    SystemCheck(SystemCheckPayload),
    Language(LanguagePayload),
    AdminAccount(AdminAccountPayload),
    DownloadMethod(DownloadMethodPayload),
    Assets(AssetsPayload),
    ServerAuth(ServerAuthPayload),
    ServerConfig(ServerConfigPayload),
    Security(SecurityPayload),
    Automation(AutomationPayload),
    Performance(PerformancePayload),
    Plugin(PluginPayload),
    Integrations(IntegrationsPayload),
    Network(NetworkPayload),
}

fn parse_as<T: serde::de::DeserializeOwned>(body: serde_json::Value) -> Result<T, ValidationError> {
    // Optional steps may be submitted with an empty body.
    let body = if body.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        body
    };
    serde_json::from_value(body).map_err(|e| ValidationError::InvalidPayload(e.to_string()))
}

impl StepPayload {
    /// Parse the free-form request body into the schema registered for `step`.
    pub fn parse(step: StepId, body: serde_json::Value) -> Result<Self, ValidationError> {
        let payload = match step {
            StepId::SystemCheck => {
                let mut p: SystemCheckPayload = parse_as(body)?;
                p.detected_ram_mb = None;
                StepPayload::SystemCheck(p)
            }
            StepId::Language => StepPayload::Language(parse_as(body)?),
            StepId::AdminAccount => {
                let mut p: AdminAccountPayload = parse_as(body)?;
                p.password_hash = None;
                StepPayload::AdminAccount(p)
            }
            StepId::DownloadMethod => StepPayload::DownloadMethod(parse_as(body)?),
            StepId::Assets => StepPayload::Assets(parse_as(body)?),
            StepId::ServerAuth => StepPayload::ServerAuth(parse_as(body)?),
            StepId::ServerConfig => StepPayload::ServerConfig(parse_as(body)?),
            StepId::Security => StepPayload::Security(parse_as(body)?),
            StepId::Automation => StepPayload::Automation(parse_as(body)?),
            StepId::Performance => StepPayload::Performance(parse_as(body)?),
            StepId::Plugin => StepPayload::Plugin(parse_as(body)?),
            StepId::Integrations => StepPayload::Integrations(parse_as(body)?),
            StepId::Network => StepPayload::Network(parse_as(body)?),
        };
        Ok(payload)
    }

    pub fn step_id(&self) -> StepId {
        match self {
            StepPayload::SystemCheck(_) => StepId::SystemCheck,
            StepPayload::Language(_) => StepId::Language,
            StepPayload::AdminAccount(_) => StepId::AdminAccount,
            StepPayload::DownloadMethod(_) => StepId::DownloadMethod,
            StepPayload::Assets(_) => StepId::Assets,
            StepPayload::ServerAuth(_) => StepId::ServerAuth,
            StepPayload::ServerConfig(_) => StepId::ServerConfig,
            StepPayload::Security(_) => StepId::Security,
            StepPayload::Automation(_) => StepId::Automation,
            StepPayload::Performance(_) => StepId::Performance,
            StepPayload::Plugin(_) => StepId::Plugin,
            StepPayload::Integrations(_) => StepId::Integrations,
            StepPayload::Network(_) => StepId::Network,
        }
    }

    pub fn validate(&self, rules: &ValidationRules, facts: &RuntimeFacts) -> Result<(), ValidationError> {
        match self {
            StepPayload::SystemCheck(_) => {
                let summary = facts
                    .system_checks
                    .as_ref()
                    .ok_or(ValidationError::SystemChecksNotRun)?;
                if !summary.failed_required.is_empty() {
                    return Err(ValidationError::RequiredChecksFailed(summary.failed_required.clone()));
                }
                Ok(())
            }
            StepPayload::Language(p) => {
                if SUPPORTED_LANGUAGES.contains(&p.language.as_str()) {
                    Ok(())
                } else {
                    Err(ValidationError::UnsupportedLanguage(p.language.clone()))
                }
            }
            StepPayload::AdminAccount(p) => validate_admin(p, rules),
            StepPayload::DownloadMethod(p) => match p.method {
                DownloadMethod::Manual => Ok(()),
                DownloadMethod::Official if facts.verified_patchlines.contains(&p.patchline) => Ok(()),
                DownloadMethod::Official => Err(ValidationError::DownloadNotVerified(p.patchline)),
            },
            StepPayload::Assets(_) => {
                if facts.extraction_complete {
                    Ok(())
                } else {
                    Err(ValidationError::ExtractionIncomplete)
                }
            }
            StepPayload::ServerAuth(_) => {
                if facts.server_authenticated {
                    Ok(())
                } else {
                    Err(ValidationError::ServerNotAuthenticated)
                }
            }
            StepPayload::ServerConfig(p) => validate_server_config(p, rules),
            StepPayload::Security(_)
            | StepPayload::Automation(_)
            | StepPayload::Performance(_)
            | StepPayload::Plugin(_)
            | StepPayload::Integrations(_)
            | StepPayload::Network(_) => Ok(()),
        }
    }

    /// Prepare a validated payload for storage: secrets are replaced by hashes and
    /// values derived from earlier steps or live facts are filled in.
    pub fn seal(self, session: &SetupSession, facts: &RuntimeFacts) -> Result<Self, ValidationError> {
        let sealed = match self {
            StepPayload::SystemCheck(mut p) => {
                p.detected_ram_mb = facts.system_checks.as_ref().and_then(|s| s.detected_ram_mb);
                StepPayload::SystemCheck(p)
            }
            StepPayload::AdminAccount(p) => {
                let password = p.password.as_deref().unwrap_or_default();
                StepPayload::AdminAccount(AdminAccountPayload {
                    username: p.username,
                    password: None,
                    password_confirmation: None,
                    password_hash: Some(hash_password(password)?),
                })
            }
            StepPayload::Performance(p) => {
                let detected = match session.payload(StepId::SystemCheck) {
                    Some(StepPayload::SystemCheck(check)) => check.detected_ram_mb,
                    _ => None,
                };
                StepPayload::Performance(clamp_performance(p, detected))
            }
            other => other,
        };
        Ok(sealed)
    }

    /// Copy suitable for sending back to the UI.
    pub fn redacted(&self) -> Self {
        match self {
            StepPayload::AdminAccount(p) => StepPayload::AdminAccount(AdminAccountPayload {
                username: p.username.clone(),
                password: None,
                password_confirmation: None,
                password_hash: None,
            }),
            StepPayload::ServerConfig(p) => StepPayload::ServerConfig(ServerConfigPayload {
                password: p.password.as_ref().map(|_| "********".to_string()),
                ..p.clone()
            }),
            other => other.clone(),
        }
    }
}

fn validate_admin(p: &AdminAccountPayload, rules: &ValidationRules) -> Result<(), ValidationError> {
    let len = p.username.chars().count();
    if len < rules.username_min || len > rules.username_max {
        return Err(ValidationError::UsernameLength {
            min: rules.username_min,
            max: rules.username_max,
        });
    }
    if !USERNAME_RE.is_match(&p.username) {
        return Err(ValidationError::UsernameCharacters);
    }

    let password = p.password.as_deref().unwrap_or_default();
    if password.chars().count() < rules.password_min {
        return Err(ValidationError::PasswordTooShort {
            min: rules.password_min,
        });
    }
    if p.password_confirmation.as_deref() != Some(password) {
        return Err(ValidationError::PasswordMismatch);
    }
    Ok(())
}

fn validate_server_config(p: &ServerConfigPayload, rules: &ValidationRules) -> Result<(), ValidationError> {
    let name_len = p.server_name.trim().chars().count();
    if name_len < rules.server_name_min || name_len > rules.server_name_max {
        return Err(ValidationError::ServerNameLength {
            min: rules.server_name_min,
            max: rules.server_name_max,
        });
    }
    if p.motd.chars().count() > rules.motd_max {
        return Err(ValidationError::MotdTooLong { max: rules.motd_max });
    }
    if p.max_players == 0 || p.max_players > rules.max_players_max {
        return Err(ValidationError::MaxPlayersOutOfRange {
            max: rules.max_players_max,
        });
    }
    Ok(())
}

fn clamp_performance(mut p: PerformancePayload, detected_ram_mb: Option<u64>) -> PerformancePayload {
    if p.min_ram_mb > p.max_ram_mb {
        std::mem::swap(&mut p.min_ram_mb, &mut p.max_ram_mb);
    }
    if let Some(total) = detected_ram_mb {
        let ceiling = total.saturating_sub(HOST_RAM_RESERVE_MB).max(512);
        p.max_ram_mb = p.max_ram_mb.min(ceiling);
        p.min_ram_mb = p.min_ram_mb.min(p.max_ram_mb);
    }
    p
}

fn hash_password(password: &str) -> Result<String, ValidationError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ValidationError::HashFailed(e.to_string()))
}
