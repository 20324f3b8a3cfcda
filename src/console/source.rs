// Console I/O seams: where lines come from and where commands go

use crate::docker::{DockerError, DockerManager};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("console source unavailable: {0}")]
    Unavailable(String),
}

pub type LineStream = BoxStream<'static, Result<String, ConsoleError>>;

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Open a live stream. `since` is the unix time of the last line seen,
    /// used to avoid replaying history after a reconnect.
    async fn follow(&self, since: Option<i64>) -> Result<LineStream, ConsoleError>;

    /// Last `lines` lines, without following.
    async fn tail(&self, lines: usize) -> Result<Vec<String>, ConsoleError>;
}

#[async_trait]
pub trait ServerConsole: Send + Sync {
    async fn send_command(&self, command: &str) -> Result<(), ConsoleError>;
}

/// Log source backed by the game server container.
pub struct DockerLogSource {
    container: String,
}

impl DockerLogSource {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
        }
    }
}

#[async_trait]
impl LogSource for DockerLogSource {
    async fn follow(&self, since: Option<i64>) -> Result<LineStream, ConsoleError> {
        let docker = DockerManager::new().await?;
        let rx = docker.follow_logs(&self.container, since);
        let lines = stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|item| (item.map_err(ConsoleError::from), rx))
        });
        Ok(lines.boxed())
    }

    async fn tail(&self, lines: usize) -> Result<Vec<String>, ConsoleError> {
        let docker = DockerManager::new().await?;
        Ok(docker.get_logs(&self.container, lines).await?)
    }
}

/// Sends commands to the game server through the container's stdin.
pub struct DockerConsole {
    container: String,
}

impl DockerConsole {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
        }
    }
}

#[async_trait]
impl ServerConsole for DockerConsole {
    async fn send_command(&self, command: &str) -> Result<(), ConsoleError> {
        let docker = DockerManager::new().await?;
        docker.send_stdin(&self.container, command).await?;
        Ok(())
    }
}
