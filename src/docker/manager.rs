// Docker Manager - container control consumed by the setup flow

use bollard::container::{
    AttachContainerOptions, AttachContainerResults, LogOutput, LogsOptions, StartContainerOptions,
};
use bollard::models::ContainerStateStatusEnum;
use bollard::Docker;
use futures_util::stream::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("Docker connection error: {0}")]
    ConnectionError(#[from] bollard::errors::Error),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Attach failed: {0}")]
    AttachFailed(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerInfo {
    pub memory_total_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Starting,
    Stopped,
    Error,
}

pub struct DockerManager {
    docker: Docker,
}

impl DockerManager {
    /// Create a new Docker manager instance
    pub async fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Ping Docker to check if it's running
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Host facts reported by the Docker daemon
    pub async fn get_info(&self) -> Result<DockerInfo, DockerError> {
        let info = self.docker.info().await?;

        Ok(DockerInfo {
            memory_total_mb: info.mem_total.unwrap_or(0).max(0) as u64 / 1024 / 1024,
        })
    }

    /// Start a container. Starting one that already runs is not an error.
    pub async fn start_container(&self, container: &str) -> Result<(), DockerError> {
        tracing::info!("Starting container: {}", container);
        match self
            .docker
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                tracing::info!("Container {} already running", container);
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                return Err(DockerError::ContainerNotFound(container.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!("Container start command sent: {}", container);
        Ok(())
    }

    /// Get container state by inspecting it directly
    pub async fn container_state(&self, container: &str) -> Result<ContainerState, DockerError> {
        match self.docker.inspect_container(container, None).await {
            Ok(info) => {
                let status = info.state.and_then(|state| state.status);
                tracing::debug!("Container {} status: {:?}", container, status);

                Ok(match status {
                    Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
                    Some(ContainerStateStatusEnum::RESTARTING) => ContainerState::Starting,
                    Some(ContainerStateStatusEnum::DEAD) => ContainerState::Error,
                    _ => ContainerState::Stopped,
                })
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Err(DockerError::ContainerNotFound(container.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send input to container's stdin using attach
    pub async fn send_stdin(&self, container: &str, input: &str) -> Result<(), DockerError> {
        use tokio::io::AsyncWriteExt;

        tracing::info!("Sending command to container {}", container);

        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(false),
            stderr: Some(false),
            stream: Some(true),
            logs: Some(false),
            ..Default::default()
        };

        match self.docker.attach_container(container, Some(options)).await {
            Ok(AttachContainerResults { input: mut stdin_writer, .. }) => {
                let data = format!("{}\n", input);
                stdin_writer
                    .write_all(data.as_bytes())
                    .await
                    .map_err(|e| DockerError::AttachFailed(format!("Failed to write to stdin: {}", e)))?;
                stdin_writer
                    .flush()
                    .await
                    .map_err(|e| DockerError::AttachFailed(format!("Failed to flush stdin: {}", e)))?;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to attach to container: {}", e);
                Err(DockerError::AttachFailed(e.to_string()))
            }
        }
    }

    /// Get the last `lines` log lines (non-streaming)
    pub async fn get_logs(&self, container: &str, lines: usize) -> Result<Vec<String>, DockerError> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: lines.to_string(),
            timestamps: false,
            ..Default::default()
        });

        let mut stream = self.docker.logs(container, options);
        let mut logs = Vec::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => {
                    for l in log_output_text(&output).lines() {
                        if !l.trim().is_empty() {
                            logs.push(l.to_string());
                        }
                    }
                }
                Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                    return Err(DockerError::ContainerNotFound(container.to_string()));
                }
                Err(e) => {
                    tracing::warn!("Error reading log: {}", e);
                }
            }
        }

        Ok(logs)
    }

    /// Follow the container's log stream. Lines are forwarded from a
    /// background task until the stream ends or the receiver is dropped.
    /// With `since` (unix seconds) only newer output is replayed.
    pub fn follow_logs(
        self,
        container: &str,
        since: Option<i64>,
    ) -> mpsc::Receiver<Result<String, DockerError>> {
        let (tx, rx) = mpsc::channel(256);
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            since: since.unwrap_or(0),
            tail: if since.is_some() { "all".to_string() } else { "50".to_string() },
            ..Default::default()
        };
        let container = container.to_string();

        tokio::spawn(async move {
            let mut log_stream = self.docker.logs(&container, Some(options));
            while let Some(result) = log_stream.next().await {
                match result {
                    Ok(output) => {
                        for line in log_output_text(&output).lines() {
                            if !line.is_empty() && tx.send(Ok(line.to_string())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                }
            }
        });

        rx
    }
}

pub fn log_output_text(output: &LogOutput) -> String {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => String::from_utf8_lossy(message).to_string(),
    }
}

