// Panel configuration - environment variables with home-directory defaults

use crate::auth::OAuthEndpoints;
use crate::console::ReconnectPolicy;
use crate::setup::ValidationRules;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "PANEL_";
const DEFAULT_DOWNLOAD_URL: &str = "https://downloads.example.com/server/{patchline}/latest.zip";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct PanelConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub container_name: String,
    pub server_data_dir: PathBuf,
    /// `{patchline}` is replaced by `release` or `pre-release`.
    pub download_url_template: String,
    pub downloader_oauth: Option<OAuthEndpoints>,
    pub server_login_command: String,
    pub server_persistence_command: String,
    pub server_prompt_timeout: Duration,
    pub persistence_timeout: Duration,
    pub validation: ValidationRules,
    pub reconnect: ReconnectPolicy,
    pub dev_mode: bool,
    pub redirect_url: String,
}

impl PanelConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. The lookup receives full `PANEL_*` names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let data_dir = get("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let server_data_dir = get("SERVER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("server"));

        let downloader_oauth = match (
            get("DOWNLOADER_DEVICE_URL"),
            get("DOWNLOADER_TOKEN_URL"),
            get("DOWNLOADER_CLIENT_ID"),
        ) {
            (Some(device_authorization_url), Some(token_url), Some(client_id)) => Some(OAuthEndpoints {
                device_authorization_url,
                token_url,
                client_id,
                scope: get("DOWNLOADER_SCOPE"),
            }),
            _ => None,
        };

        let defaults = ValidationRules::default();
        let validation = ValidationRules {
            password_min: parse_or(&get, "PASSWORD_MIN_LENGTH", defaults.password_min)?,
            max_players_max: parse_or(&get, "MAX_PLAYERS_LIMIT", defaults.max_players_max)?,
            ..defaults
        };

        let policy = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            max_attempts: parse_or(&get, "CONSOLE_RECONNECT_ATTEMPTS", policy.max_attempts)?,
            poll_interval: Duration::from_secs(parse_or(
                &get,
                "CONSOLE_POLL_SECONDS",
                policy.poll_interval.as_secs(),
            )?),
            ..policy
        };

        Ok(Self {
            bind_addr: parse_or(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            data_dir,
            container_name: get("CONTAINER_NAME").unwrap_or_else(|| "game-server".to_string()),
            server_data_dir,
            download_url_template: get("DOWNLOAD_URL").unwrap_or_else(|| DEFAULT_DOWNLOAD_URL.to_string()),
            downloader_oauth,
            server_login_command: get("SERVER_LOGIN_COMMAND").unwrap_or_else(|| "/auth login device".to_string()),
            server_persistence_command: get("SERVER_PERSISTENCE_COMMAND")
                .unwrap_or_else(|| "/auth persistence Encrypted".to_string()),
            server_prompt_timeout: Duration::from_secs(parse_or(&get, "SERVER_PROMPT_TIMEOUT", 30)?),
            persistence_timeout: Duration::from_secs(parse_or(&get, "PERSISTENCE_TIMEOUT", 15)?),
            validation,
            reconnect,
            dev_mode: parse_or(&get, "DEV_MODE", false)?,
            redirect_url: get("REDIRECT_URL").unwrap_or_else(|| "/dashboard".to_string()),
        })
    }

    /// Operator steps shown when downloader auth is not configured.
    pub fn downloader_remediation() -> Vec<String> {
        vec![
            format!("Set {}DOWNLOADER_DEVICE_URL to the device authorization endpoint", ENV_PREFIX),
            format!("Set {}DOWNLOADER_TOKEN_URL to the token endpoint", ENV_PREFIX),
            format!("Set {}DOWNLOADER_CLIENT_ID to the registered client id", ENV_PREFIX),
            "Restart the panel, or choose the manual download method".to_string(),
        ]
    }

    pub fn setup_dir(&self) -> PathBuf {
        self.data_dir.join("setup")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir.join("credentials")
    }

    /// Server credential persistence confirmation, kept with the credentials.
    pub fn persistence_record_path(&self) -> PathBuf {
        self.credentials_dir().join("server-persistence.json")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.data_dir.join("assets")
    }

    pub fn panel_config_path(&self) -> PathBuf {
        self.data_dir.join("config").join("panel.json")
    }

    pub fn server_config_path(&self) -> PathBuf {
        self.server_data_dir.join("config.json")
    }
}

fn default_data_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("GamePanel")
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: format!("{}{}", ENV_PREFIX, key),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<PanelConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        PanelConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_are_rooted_in_the_data_dir() {
        let config = config(&[("PANEL_DATA_DIR", "/srv/panel")]).unwrap();

        assert_eq!(config.setup_dir(), PathBuf::from("/srv/panel/setup"));
        assert_eq!(config.panel_config_path(), PathBuf::from("/srv/panel/config/panel.json"));
        assert_eq!(config.server_config_path(), PathBuf::from("/srv/panel/server/config.json"));
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.downloader_oauth.is_none());
        assert!(!config.dev_mode);
        assert_eq!(config.validation.password_min, 12);
    }

    #[test]
    fn downloader_oauth_needs_all_three_values() {
        let partial = config(&[("PANEL_DOWNLOADER_CLIENT_ID", "panel")]).unwrap();
        assert!(partial.downloader_oauth.is_none());

        let full = config(&[
            ("PANEL_DOWNLOADER_DEVICE_URL", "https://auth.example.com/device"),
            ("PANEL_DOWNLOADER_TOKEN_URL", "https://auth.example.com/token"),
            ("PANEL_DOWNLOADER_CLIENT_ID", "panel"),
        ])
        .unwrap();
        assert_eq!(full.downloader_oauth.unwrap().client_id, "panel");
    }

    #[test]
    fn bad_values_are_reported_with_their_key() {
        let err = config(&[("PANEL_DEV_MODE", "maybe")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "PANEL_DEV_MODE".into(),
                value: "maybe".into()
            }
        );
    }

    #[test]
    fn overrides_apply() {
        let config = config(&[
            ("PANEL_DEV_MODE", "true"),
            ("PANEL_PASSWORD_MIN_LENGTH", "16"),
            ("PANEL_BIND_ADDR", "127.0.0.1:9000"),
            ("PANEL_CONSOLE_RECONNECT_ATTEMPTS", "2"),
        ])
        .unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.validation.password_min, 16);
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.reconnect.max_attempts, 2);
    }
}
