// Durable credential storage

use super::{AuthDomain, Credentials};
use crate::fs_util::write_atomic_private;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("credential I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Receives credentials once an auth bridge reaches `authenticated`.
#[async_trait]
pub trait CredentialSink: Send + Sync {
    async fn persist(&self, credentials: &Credentials) -> Result<(), CredentialError>;
}

/// `<dir>/<domain>.json`, owner-readable only.
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, domain: AuthDomain) -> PathBuf {
        self.dir.join(format!("{}.json", domain.as_str()))
    }

    pub async fn load(&self, domain: AuthDomain) -> Option<Credentials> {
        let content = tokio::fs::read_to_string(self.path(domain)).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(credentials) => Some(credentials),
            Err(e) => {
                tracing::warn!("Ignoring unreadable {} credentials: {}", domain, e);
                None
            }
        }
    }

    pub async fn exists(&self, domain: AuthDomain) -> bool {
        self.load(domain).await.is_some()
    }
}

#[async_trait]
impl CredentialSink for CredentialStore {
    async fn persist(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        let json = serde_json::to_vec_pretty(credentials)?;
        write_atomic_private(&self.path(credentials.domain), &json).await?;
        tracing::info!("Stored {} credentials", credentials.domain);
        Ok(())
    }
}
