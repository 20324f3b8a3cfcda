// System checks - can this host run the game server?

use crate::docker::{ContainerState, DockerError, DockerManager};
use crate::setup::CheckSummary;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const RECOMMENDED_RAM_MB: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub id: &'static str,
    pub status: CheckStatus,
    pub required: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckResult {
    fn pass(id: &'static str, required: bool, message: impl Into<String>) -> Self {
        Self {
            id,
            status: CheckStatus::Pass,
            required,
            message: message.into(),
            details: None,
        }
    }

    fn fail(id: &'static str, required: bool, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            id,
            status: CheckStatus::Fail,
            required,
            message: message.into(),
            details,
        }
    }

    fn warn(id: &'static str, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            id,
            status: CheckStatus::Warning,
            required: false,
            message: message.into(),
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCheckReport {
    pub checks: Vec<CheckResult>,
    pub can_proceed: bool,
    pub detected_ram_mb: Option<u64>,
}

impl SystemCheckReport {
    pub fn new(checks: Vec<CheckResult>, detected_ram_mb: Option<u64>) -> Self {
        let can_proceed = !checks
            .iter()
            .any(|c| c.required && c.status == CheckStatus::Fail);
        Self {
            checks,
            can_proceed,
            detected_ram_mb,
        }
    }

    /// What step validation needs to know about this run.
    pub fn summary(&self) -> CheckSummary {
        CheckSummary {
            failed_required: self
                .checks
                .iter()
                .filter(|c| c.required && c.status == CheckStatus::Fail)
                .map(|c| c.id.to_string())
                .collect(),
            detected_ram_mb: self.detected_ram_mb,
        }
    }
}

pub struct SystemChecker {
    container: String,
    data_dir: PathBuf,
    downloader_configured: bool,
}

impl SystemChecker {
    pub fn new(container: impl Into<String>, data_dir: impl Into<PathBuf>, downloader_configured: bool) -> Self {
        Self {
            container: container.into(),
            data_dir: data_dir.into(),
            downloader_configured,
        }
    }

    pub async fn run(&self) -> SystemCheckReport {
        let mut checks = Vec::new();

        let docker = match DockerManager::new().await {
            Ok(docker) => match docker.ping().await {
                Ok(()) => {
                    checks.push(CheckResult::pass("docker", true, "Docker is running"));
                    Some(docker)
                }
                Err(e) => {
                    checks.push(CheckResult::fail(
                        "docker",
                        true,
                        "Docker is not responding",
                        Some(e.to_string()),
                    ));
                    None
                }
            },
            Err(e) => {
                checks.push(CheckResult::fail(
                    "docker",
                    true,
                    "Docker is not available",
                    Some(e.to_string()),
                ));
                None
            }
        };

        checks.push(match &docker {
            Some(docker) => container_check(&self.container, docker.container_state(&self.container).await),
            None => CheckResult::fail(
                "container",
                true,
                format!("Cannot inspect container {} without Docker", self.container),
                None,
            ),
        });

        checks.push(data_dir_check(&self.data_dir).await);

        let mut ram_mb = read_meminfo_mb().await;
        if ram_mb.is_none() {
            if let Some(docker) = &docker {
                ram_mb = docker.get_info().await.ok().map(|info| info.memory_total_mb);
            }
        }
        checks.push(memory_check(ram_mb));

        checks.push(if self.downloader_configured {
            CheckResult::pass("downloader-config", false, "Downloader authentication is configured")
        } else {
            CheckResult::warn(
                "downloader-config",
                "Downloader authentication is not configured",
                Some("Official downloads are unavailable; use the manual method".to_string()),
            )
        });

        let report = SystemCheckReport::new(checks, ram_mb);
        tracing::info!(
            "System check finished: can_proceed={}, ram={:?}MB",
            report.can_proceed,
            report.detected_ram_mb
        );
        report
    }
}

fn container_check(container: &str, state: Result<ContainerState, DockerError>) -> CheckResult {
    match state {
        Ok(state) => CheckResult::pass(
            "container",
            true,
            format!("Container {} exists ({:?})", container, state),
        ),
        Err(DockerError::ContainerNotFound(_)) => CheckResult::fail(
            "container",
            true,
            format!("Container {} was not found", container),
            Some("Create the game server container before running setup".to_string()),
        ),
        Err(e) => CheckResult::fail(
            "container",
            true,
            format!("Cannot inspect container {}", container),
            Some(e.to_string()),
        ),
    }
}

async fn data_dir_check(dir: &Path) -> CheckResult {
    let probe = dir.join(".write-test");
    let result = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await
    }
    .await;

    match result {
        Ok(()) => CheckResult::pass("data-dir", true, format!("{} is writable", dir.display())),
        Err(e) => CheckResult::fail(
            "data-dir",
            true,
            format!("{} is not writable", dir.display()),
            Some(e.to_string()),
        ),
    }
}

fn memory_check(ram_mb: Option<u64>) -> CheckResult {
    match ram_mb {
        Some(mb) if mb >= RECOMMENDED_RAM_MB => {
            CheckResult::pass("memory", false, format!("{} MB of memory available", mb))
        }
        Some(mb) => CheckResult::warn(
            "memory",
            format!("{} MB of memory available", mb),
            Some(format!("At least {} MB is recommended", RECOMMENDED_RAM_MB)),
        ),
        None => CheckResult::warn("memory", "Could not determine available memory", None),
    }
}

async fn read_meminfo_mb() -> Option<u64> {
    let content = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
    parse_meminfo_mb(&content)
}

fn parse_meminfo_mb(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}
