// Device-code authentication against external identity flows

pub mod bridge;
pub mod console_provider;
pub mod credentials;
pub mod persistence;
pub mod provider;

pub use bridge::{AuthBridge, AuthErrorKind, AuthErrorView, AuthPhase, AuthStatus};
pub use console_provider::ConsoleDeviceCodeProvider;
pub use credentials::{CredentialError, CredentialSink, CredentialStore};
pub use persistence::CredentialPersistence;
pub use provider::{HttpDeviceCodeProvider, OAuthEndpoints};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthDomain {
    Downloader,
    Server,
}

impl AuthDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthDomain::Downloader => "downloader",
            AuthDomain::Server => "server",
        }
    }
}

impl fmt::Display for AuthDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device authorization issued by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGrant {
    pub device_code: String,
    pub user_code: String,
    pub verification_url: String,
    pub verification_url_direct: Option<String>,
    pub expires_in: u64,
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub domain: AuthDomain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub obtained_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Pending,
    SlowDown,
    Authorized(Credentials),
    Expired,
    Denied(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network trouble; the grant stays usable.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider rejected the request: {0}")]
    Rejected(String),

    #[error("{message}")]
    ConfigurationRequired {
        message: String,
        remediation: Vec<String>,
    },
}

#[async_trait]
pub trait DeviceCodeProvider: Send + Sync {
    async fn request_grant(&self) -> Result<DeviceGrant, ProviderError>;

    async fn poll(&self, grant: &DeviceGrant) -> Result<PollOutcome, ProviderError>;
}
