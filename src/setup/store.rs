// Durable setup session storage

use super::session::{SessionId, SetupSession};
use crate::fs_util::write_atomic_private;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("session store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("session {id} is corrupt: {source}")]
    Corrupt {
        id: SessionId,
        source: serde_json::Error,
    },

    #[error("failed to serialize session: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session, returning a fresh one when nothing was stored yet.
    async fn load(&self, id: &SessionId) -> Result<SetupSession, StoreError>;

    /// Durably replace the stored session.
    async fn commit(&self, session: &SetupSession) -> Result<(), StoreError>;
}

/// One JSON file per session under `root`, replaced with write-to-temp-then-rename.
/// Sessions hold the admin password hash and the server join password, so
/// files are owner-only.
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_path(&self, id: &SessionId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, id: &SessionId) -> Result<SetupSession, StoreError> {
        let path = self.session_path(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(SetupSession::new(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(SetupSession::new(id.clone()));
        }

        let mut session: SetupSession =
            serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                id: id.clone(),
                source,
            })?;
        session.normalize();
        Ok(session)
    }

    async fn commit(&self, session: &SetupSession) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(session)?;
        write_atomic_private(&self.session_path(&session.session_id), &json).await?;
        tracing::debug!(
            "Committed setup session {} at step {}",
            session.session_id,
            session.current_step_index
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::payload::{LanguagePayload, StepPayload};
    use crate::setup::steps::StepId;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_returns_fresh_session_when_missing_or_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        let id = SessionId::default();

        let session = store.load(&id).await.unwrap();
        assert_eq!(session.current_step_index, 0);
        assert!(session.completed_steps.is_empty());

        tokio::fs::write(dir.path().join("default.json"), "  ").await.unwrap();
        let session = store.load(&id).await.unwrap();
        assert!(!session.setup_complete);
    }

    #[tokio::test]
    async fn commit_then_load_in_a_new_store() {
        let dir = TempDir::new().unwrap();
        let id = SessionId::parse("install-a").unwrap();

        let mut session = SetupSession::new(id.clone());
        session.completed_steps.insert(StepId::SystemCheck);
        session.record_completed(StepPayload::Language(LanguagePayload {
            language: "fr".into(),
        }));
        FileSessionStore::new(dir.path()).commit(&session).await.unwrap();

        let reopened = FileSessionStore::new(dir.path()).load(&id).await.unwrap();
        assert_eq!(reopened, session);
        assert!(!dir.path().join("install-a.json.tmp").exists());
    }

    #[tokio::test]
    async fn sessions_are_isolated_by_id() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        let a = SessionId::parse("a").unwrap();
        let b = SessionId::parse("b").unwrap();

        let mut session = SetupSession::new(a.clone());
        session.setup_complete = true;
        store.commit(&session).await.unwrap();

        assert!(store.load(&a).await.unwrap().setup_complete);
        assert!(!store.load(&b).await.unwrap().setup_complete);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn session_files_are_owner_only() {
        use crate::setup::payload::{ServerConfigPayload, StepPayload};
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let mut session = SetupSession::new(SessionId::default());
        session.record_completed(StepPayload::ServerConfig(ServerConfigPayload {
            server_name: "My Server".into(),
            motd: String::new(),
            max_players: 20,
            password: Some("join-secret".into()),
        }));
        FileSessionStore::new(dir.path()).commit(&session).await.unwrap();

        let mode = std::fs::metadata(dir.path().join("default.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("default.json"), "{not json").await.unwrap();

        let result = FileSessionStore::new(dir.path()).load(&SessionId::default()).await;

        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }
}
