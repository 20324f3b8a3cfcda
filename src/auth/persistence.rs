// Server-side credential persistence toggle

use crate::console::classify::strip_ansi;
use crate::console::{ConsoleBridge, ConsoleError, ServerConsole};
use crate::fs_util::write_atomic_private;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Confirmed,
    Refused,
}

fn classify_reply(line: &str) -> Option<Reply> {
    let lower = line.to_lowercase();
    if !lower.contains("persistence") {
        return None;
    }
    if ["failed", "error", "invalid", "unknown"].iter().any(|w| lower.contains(w)) {
        Some(Reply::Refused)
    } else if ["enabled", "set to", "changed", "saved", "encrypted"]
        .iter()
        .any(|w| lower.contains(w))
    {
        Some(Reply::Confirmed)
    } else {
        None
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistenceRecord {
    enabled: bool,
    confirmed_at: DateTime<Utc>,
}

/// Asks the game server to keep its auth tokens across restarts. A
/// confirmation is recorded in `record_path` so it survives panel restarts.
pub struct CredentialPersistence {
    console: Arc<dyn ServerConsole>,
    bridge: Arc<ConsoleBridge>,
    command: String,
    timeout: Duration,
    record_path: PathBuf,
    enabled: AtomicBool,
}

impl CredentialPersistence {
    pub fn new(
        console: Arc<dyn ServerConsole>,
        bridge: Arc<ConsoleBridge>,
        command: impl Into<String>,
        timeout: Duration,
        record_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            console,
            bridge,
            command: command.into(),
            timeout,
            record_path: record_path.into(),
            enabled: AtomicBool::new(false),
        }
    }

    pub async fn is_enabled(&self) -> bool {
        if self.enabled.load(Ordering::SeqCst) {
            return true;
        }
        let Ok(content) = tokio::fs::read_to_string(&self.record_path).await else {
            return false;
        };
        match serde_json::from_str::<PersistenceRecord>(&content) {
            Ok(record) if record.enabled => {
                self.enabled.store(true, Ordering::SeqCst);
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!("Ignoring unreadable persistence record: {}", e);
                false
            }
        }
    }

    /// Send the persistence command and wait for the server to confirm.
    /// Returns false when the server refuses or stays silent.
    pub async fn enable(&self) -> Result<bool, ConsoleError> {
        if self.is_enabled().await {
            return Ok(true);
        }

        let mut events = self.bridge.subscribe();
        self.console.send_command(&self.command).await?;
        tracing::info!("Sent credential persistence command");

        let deadline = Instant::now() + self.timeout;
        let confirmed = loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) => match classify_reply(&strip_ansi(&event.line.message)) {
                    Some(Reply::Confirmed) => break true,
                    Some(Reply::Refused) => {
                        tracing::warn!("Server refused credential persistence: {}", event.line.message);
                        break false;
                    }
                    None => {}
                },
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => break false,
                Err(_) => {
                    tracing::warn!("No persistence confirmation within {:?}", self.timeout);
                    break false;
                }
            }
        };

        if confirmed {
            self.enabled.store(true, Ordering::SeqCst);
            tracing::info!("Credential persistence enabled");
            self.record().await;
        }
        Ok(confirmed)
    }

    async fn record(&self) {
        let record = PersistenceRecord {
            enabled: true,
            confirmed_at: Utc::now(),
        };
        let written = match serde_json::to_vec_pretty(&record) {
            Ok(json) => write_atomic_private(&self.record_path, &json)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = written {
            tracing::warn!("Could not record credential persistence: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::source::LineStream;
    use crate::console::{LayeredClassifier, LogSource, ReconnectPolicy};
    use async_trait::async_trait;
    use futures_util::stream::{self, StreamExt};
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct ChannelSource {
        rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    }

    #[async_trait]
    impl LogSource for ChannelSource {
        async fn follow(&self, _since: Option<i64>) -> Result<LineStream, ConsoleError> {
            match self.rx.lock().unwrap().take() {
                Some(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|line| (Ok(line), rx))
                })
                .boxed()),
                None => Err(ConsoleError::Unavailable("gone".into())),
            }
        }

        async fn tail(&self, _lines: usize) -> Result<Vec<String>, ConsoleError> {
            Ok(Vec::new())
        }
    }

    struct EchoConsole {
        tx: mpsc::UnboundedSender<String>,
        reply: Option<&'static str>,
    }

    #[async_trait]
    impl ServerConsole for EchoConsole {
        async fn send_command(&self, _command: &str) -> Result<(), ConsoleError> {
            if let Some(reply) = self.reply {
                let _ = self.tx.send(reply.to_string());
            }
            Ok(())
        }
    }

    async fn persistence(reply: Option<&'static str>, record: &Path) -> CredentialPersistence {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(ConsoleBridge::new(
            Arc::new(LayeredClassifier::default()),
            ReconnectPolicy::default(),
        ));
        bridge
            .attach(Arc::new(ChannelSource {
                rx: std::sync::Mutex::new(Some(rx)),
            }))
            .await;
        CredentialPersistence::new(
            Arc::new(EchoConsole { tx, reply }),
            bridge,
            "/auth persistence Encrypted",
            Duration::from_millis(300),
            record,
        )
    }

    #[test]
    fn replies_are_recognized() {
        assert_eq!(classify_reply("Credential persistence set to Encrypted"), Some(Reply::Confirmed));
        assert_eq!(classify_reply("Failed to change persistence: invalid mode"), Some(Reply::Refused));
        assert_eq!(classify_reply("Player joined"), None);
    }

    #[tokio::test]
    async fn confirmation_enables_persistence_across_restarts() {
        let dir = TempDir::new().unwrap();
        let record = dir.path().join("server-persistence.json");

        let persistence = persistence(Some("Credential persistence set to Encrypted"), &record).await;
        assert!(persistence.enable().await.unwrap());
        assert!(persistence.is_enabled().await);

        let restarted = self::persistence(None, &record).await;
        assert!(restarted.is_enabled().await);
        assert!(restarted.enable().await.unwrap());
    }

    #[tokio::test]
    async fn silence_times_out_without_enabling() {
        let dir = TempDir::new().unwrap();
        let record = dir.path().join("server-persistence.json");

        let persistence = persistence(None, &record).await;
        assert!(!persistence.enable().await.unwrap());
        assert!(!persistence.is_enabled().await);
        assert!(!record.exists());
    }
}
