// Finalization - projects committed step answers into the live configuration files

use crate::fs_util::{write_atomic, write_atomic_private};
use crate::setup::payload::{
    AccessMode, AutomationPayload, IntegrationsPayload, NetworkPayload, PerformancePayload,
    PluginPayload, SecurityPayload, StepPayload,
};
use crate::setup::{SetupSession, StepId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FinalizeError {
    #[error("step {0} has no committed answer")]
    MissingPayload(StepId),

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("existing config {path:?} is not valid JSON: {source}")]
    InvalidConfig {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Applies a finished session to the system outside the wizard.
#[async_trait]
pub trait SetupFinalizer: Send + Sync {
    async fn finalize(&self, session: &SetupSession) -> Result<(), FinalizeError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSettings {
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
}

/// Panel-level settings file (`config/panel.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelSettings {
    pub language: String,
    pub admin: AdminSettings,
    pub security: SecurityPayload,
    pub automation: AutomationPayload,
    pub performance: PerformancePayload,
    pub plugins: PluginPayload,
    pub integrations: IntegrationsPayload,
    pub network: NetworkPayload,
    pub cors: CorsSettings,
    pub setup_completed_at: DateTime<Utc>,
}

/// Writes `panel.json` and merges the server-config answers into the game
/// server's own `config.json`.
pub struct ConfigFinalizer {
    panel_config_path: PathBuf,
    server_config_path: PathBuf,
}

impl ConfigFinalizer {
    pub fn new(panel_config_path: PathBuf, server_config_path: PathBuf) -> Self {
        Self {
            panel_config_path,
            server_config_path,
        }
    }

    pub fn panel_settings(session: &SetupSession) -> Result<PanelSettings, FinalizeError> {
        let language = match session.payload(StepId::Language) {
            Some(StepPayload::Language(p)) => p.language.clone(),
            _ => return Err(FinalizeError::MissingPayload(StepId::Language)),
        };
        let admin = match session.payload(StepId::AdminAccount) {
            Some(StepPayload::AdminAccount(p)) => AdminSettings {
                username: p.username.clone(),
                password_hash: p
                    .password_hash
                    .clone()
                    .ok_or(FinalizeError::MissingPayload(StepId::AdminAccount))?,
            },
            _ => return Err(FinalizeError::MissingPayload(StepId::AdminAccount)),
        };

        // Skipped optional steps fall back to their defaults.
        let security = match session.payload(StepId::Security) {
            Some(StepPayload::Security(p)) => p.clone(),
            _ => SecurityPayload::default(),
        };
        let automation = match session.payload(StepId::Automation) {
            Some(StepPayload::Automation(p)) => p.clone(),
            _ => AutomationPayload::default(),
        };
        let performance = match session.payload(StepId::Performance) {
            Some(StepPayload::Performance(p)) => p.clone(),
            _ => PerformancePayload::default(),
        };
        let plugins = match session.payload(StepId::Plugin) {
            Some(StepPayload::Plugin(p)) => p.clone(),
            _ => PluginPayload::default(),
        };
        let integrations = match session.payload(StepId::Integrations) {
            Some(StepPayload::Integrations(p)) => p.clone(),
            _ => IntegrationsPayload::default(),
        };
        let network = match session.payload(StepId::Network) {
            Some(StepPayload::Network(p)) => p.clone(),
            _ => NetworkPayload::default(),
        };

        let cors = CorsSettings {
            allowed_origins: cors_origins(&network),
        };

        Ok(PanelSettings {
            language,
            admin,
            security,
            automation,
            performance,
            plugins,
            integrations,
            network,
            cors,
            setup_completed_at: Utc::now(),
        })
    }

    /// Patch applied on top of the game server's existing config.
    pub fn server_config_patch(session: &SetupSession) -> Result<Value, FinalizeError> {
        let config = match session.payload(StepId::ServerConfig) {
            Some(StepPayload::ServerConfig(p)) => p,
            _ => return Err(FinalizeError::MissingPayload(StepId::ServerConfig)),
        };

        let mut patch = json!({
            "ServerName": config.server_name.trim(),
            "MOTD": config.motd,
            "MaxPlayers": config.max_players,
        });
        if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
            patch["Password"] = json!(password);
        }
        if let Some(StepPayload::Performance(perf)) = session.payload(StepId::Performance) {
            patch["MaxViewRadius"] = json!(perf.view_distance);
        }
        Ok(patch)
    }

    async fn read_json_or_empty(path: &Path) -> Result<Value, FinalizeError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => Ok(json!({})),
            Ok(content) => serde_json::from_str(&content).map_err(|source| FinalizeError::InvalidConfig {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(json!({})),
            Err(source) => Err(FinalizeError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[async_trait]
impl SetupFinalizer for ConfigFinalizer {
    async fn finalize(&self, session: &SetupSession) -> Result<(), FinalizeError> {
        let settings = Self::panel_settings(session)?;
        let patch = Self::server_config_patch(session)?;

        let mut server_config = Self::read_json_or_empty(&self.server_config_path).await?;
        merge_json(&mut server_config, &patch);
        let server_json = serde_json::to_vec_pretty(&server_config)?;
        write_atomic(&self.server_config_path, &server_json)
            .await
            .map_err(|source| FinalizeError::Write {
                path: self.server_config_path.clone(),
                source,
            })?;
        tracing::info!("Updated server config: {:?}", self.server_config_path);

        let panel_json = serde_json::to_vec_pretty(&settings)?;
        write_atomic_private(&self.panel_config_path, &panel_json)
            .await
            .map_err(|source| FinalizeError::Write {
                path: self.panel_config_path.clone(),
                source,
            })?;
        tracing::info!("Wrote panel settings: {:?}", self.panel_config_path);

        Ok(())
    }
}

/// Recursively merge `patch` into `base`. Objects merge key by key, every
/// other value replaces what was there.
pub fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

fn cors_origins(network: &NetworkPayload) -> Vec<String> {
    match network.access_mode {
        AccessMode::Local => vec!["http://localhost".to_string(), "http://127.0.0.1".to_string()],
        AccessMode::Lan | AccessMode::Public => {
            let mut origins: Vec<String> = network
                .allowed_origins
                .iter()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect();
            origins.sort();
            origins.dedup();
            origins
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::payload::{AdminAccountPayload, LanguagePayload, ServerConfigPayload};
    use crate::setup::SessionId;
    use tempfile::TempDir;

    fn finished_session() -> SetupSession {
        let mut session = SetupSession::new(SessionId::default());
        session.payloads.insert(
            StepId::Language,
            StepPayload::Language(LanguagePayload { language: "de".into() }),
        );
        session.payloads.insert(
            StepId::AdminAccount,
            StepPayload::AdminAccount(AdminAccountPayload {
                username: "admin".into(),
                password: None,
                password_confirmation: None,
                password_hash: Some("$argon2id$v=19$stub".into()),
            }),
        );
        session.payloads.insert(
            StepId::ServerConfig,
            StepPayload::ServerConfig(ServerConfigPayload {
                server_name: "  Friends Realm ".into(),
                motd: "hello".into(),
                max_players: 20,
                password: None,
            }),
        );
        session
    }

    #[test]
    fn merge_json_keeps_unrelated_keys() {
        let mut base = json!({"ServerName": "old", "Nested": {"a": 1, "b": 2}, "Keep": true});
        merge_json(&mut base, &json!({"ServerName": "new", "Nested": {"b": 3}}));
        assert_eq!(base, json!({"ServerName": "new", "Nested": {"a": 1, "b": 3}, "Keep": true}));
    }

    #[test]
    fn skipped_optional_steps_use_defaults() {
        let settings = ConfigFinalizer::panel_settings(&finished_session()).unwrap();
        assert_eq!(settings.language, "de");
        assert_eq!(settings.automation, AutomationPayload::default());
        assert_eq!(settings.network.access_mode, AccessMode::Local);
        assert!(settings.cors.allowed_origins.contains(&"http://localhost".to_string()));
    }

    #[test]
    fn lan_mode_normalizes_allowed_origins() {
        let network = NetworkPayload {
            access_mode: AccessMode::Lan,
            allowed_origins: vec![
                "http://192.168.1.10:8080/".into(),
                " http://192.168.1.10:8080".into(),
                "".into(),
            ],
            game_port: 5520,
        };
        assert_eq!(cors_origins(&network), vec!["http://192.168.1.10:8080".to_string()]);
    }

    #[test]
    fn missing_server_config_is_an_error() {
        let mut session = finished_session();
        session.payloads.remove(&StepId::ServerConfig);
        assert!(matches!(
            ConfigFinalizer::server_config_patch(&session),
            Err(FinalizeError::MissingPayload(StepId::ServerConfig))
        ));
    }

    #[tokio::test]
    async fn finalize_merges_into_existing_server_config() {
        let dir = TempDir::new().unwrap();
        let server_config = dir.path().join("server").join("config.json");
        let panel_config = dir.path().join("config").join("panel.json");
        tokio::fs::create_dir_all(server_config.parent().unwrap()).await.unwrap();
        tokio::fs::write(&server_config, r#"{"ServerName":"Default","Version":3}"#)
            .await
            .unwrap();

        let finalizer = ConfigFinalizer::new(panel_config.clone(), server_config.clone());
        finalizer.finalize(&finished_session()).await.unwrap();

        let written: Value =
            serde_json::from_str(&tokio::fs::read_to_string(&server_config).await.unwrap()).unwrap();
        assert_eq!(written["ServerName"], "Friends Realm");
        assert_eq!(written["MaxPlayers"], 20);
        assert_eq!(written["Version"], 3);
        assert!(written.get("Password").is_none());

        let panel: PanelSettings =
            serde_json::from_str(&tokio::fs::read_to_string(&panel_config).await.unwrap()).unwrap();
        assert_eq!(panel.admin.username, "admin");
    }
}
