// Server archive download and verification

use super::relay::ProgressReporter;
use super::ProgressError;
use crate::fs_util::write_atomic;
use crate::setup::payload::Patchline;
use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const MANIFEST_FILE: &str = "manifest.json";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Record of the last successful download, used by verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadManifest {
    pub file_name: String,
    pub patchline: Patchline,
    pub url: String,
    pub size_bytes: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub verified: bool,
    pub file_name: String,
    pub size_bytes: Option<u64>,
    pub reason: Option<String>,
}

pub struct AssetDownloader {
    client: reqwest::Client,
    url_template: String,
    downloads_dir: PathBuf,
}

impl AssetDownloader {
    /// The client bounds connecting and each read, not the whole transfer.
    pub fn new(url_template: impl Into<String>, downloads_dir: impl Into<PathBuf>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url_template: url_template.into(),
            downloads_dir: downloads_dir.into(),
        })
    }

    pub fn url_for(&self, patchline: Patchline) -> String {
        self.url_template.replace("{patchline}", patchline.as_str())
    }

    pub fn file_name(patchline: Patchline) -> String {
        format!("server-{}.zip", patchline.as_str())
    }

    pub fn archive_path(&self, patchline: Patchline) -> PathBuf {
        self.downloads_dir.join(Self::file_name(patchline))
    }

    fn manifest_path(&self) -> PathBuf {
        self.downloads_dir.join(MANIFEST_FILE)
    }

    pub async fn read_manifest(&self) -> Option<DownloadManifest> {
        let content = tokio::fs::read_to_string(self.manifest_path()).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::warn!("Ignoring unreadable download manifest: {}", e);
                None
            }
        }
    }

    /// Download the archive for `patchline`, reporting through `reporter`.
    /// The reporter always ends with exactly one terminal event.
    pub async fn download(
        &self,
        patchline: Patchline,
        access_token: Option<String>,
        mut reporter: ProgressReporter,
    ) -> Result<DownloadManifest, ProgressError> {
        match self.fetch(patchline, access_token, &mut reporter).await {
            Ok(manifest) => {
                reporter.complete();
                Ok(manifest)
            }
            Err(e) => {
                reporter.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn fetch(
        &self,
        patchline: Patchline,
        access_token: Option<String>,
        reporter: &mut ProgressReporter,
    ) -> Result<DownloadManifest, ProgressError> {
        let url = self.url_for(patchline);
        tracing::info!("Downloading {} server archive from {}", patchline.as_str(), url);

        let mut request = self
            .client
            .get(&url)
            .header("User-Agent", concat!("gamepanel-setup/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ProgressError::BadStatus(response.status().as_u16()));
        }

        let total = response.content_length();
        reporter.set_totals(None, total);

        tokio::fs::create_dir_all(&self.downloads_dir).await?;
        let final_path = self.archive_path(patchline);
        let part_path = final_path.with_extension("zip.part");
        let mut file = tokio::fs::File::create(&part_path).await?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&part_path).await;
                    return Err(e.into());
                }
            };
            file.write_all(&chunk).await?;
            downloaded = downloaded.saturating_add(chunk.len() as u64);
            reporter.set_bytes(downloaded);
        }
        file.sync_all().await?;
        drop(file);

        // ZIP files start with "PK". Anything else is likely an HTML error page.
        if !has_zip_magic(&part_path).await? {
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(ProgressError::NotAnArchive);
        }
        tokio::fs::rename(&part_path, &final_path).await?;

        let manifest = DownloadManifest {
            file_name: Self::file_name(patchline),
            patchline,
            url,
            size_bytes: downloaded,
            completed_at: Utc::now(),
        };
        write_atomic(&self.manifest_path(), &serde_json::to_vec_pretty(&manifest)?).await?;
        tracing::info!("Downloaded {} ({} bytes)", manifest.file_name, downloaded);
        Ok(manifest)
    }

    /// Check the archive for `patchline`: it must exist, look like a ZIP and
    /// match the recorded size when it came from a tracked download.
    pub async fn verify(&self, patchline: Patchline) -> Result<VerifyReport, ProgressError> {
        let file_name = Self::file_name(patchline);
        let path = self.archive_path(patchline);
        let not_verified = |size: Option<u64>, reason: &str| VerifyReport {
            verified: false,
            file_name: file_name.clone(),
            size_bytes: size,
            reason: Some(reason.to_string()),
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(not_verified(None, "archive has not been downloaded"));
            }
            Err(e) => return Err(e.into()),
        };
        let size = metadata.len();

        if let Some(manifest) = self.read_manifest().await {
            if manifest.file_name == file_name && manifest.size_bytes != size {
                return Ok(not_verified(Some(size), "archive size does not match the download record"));
            }
        }
        if !has_zip_magic(&path).await? {
            return Ok(not_verified(Some(size), "archive is not a ZIP file"));
        }

        Ok(VerifyReport {
            verified: true,
            file_name,
            size_bytes: Some(size),
            reason: None,
        })
    }
}

async fn has_zip_magic(path: &Path) -> Result<bool, ProgressError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = [0u8; 2];
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read == 2 && &header == b"PK")
}
