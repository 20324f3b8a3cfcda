// Long-running operations observed through progress events

pub mod download;
pub mod extract;
pub mod relay;

pub use download::{AssetDownloader, DownloadManifest, VerifyReport};
pub use extract::{extract_archive, is_extracted, ExtractSummary};
pub use relay::{
    AlreadyRunning, OperationState, OperationStatus, ProgressEvent, ProgressRelay, ProgressReporter,
    ProgressSnapshot,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error(transparent)]
    AlreadyRunning(#[from] AlreadyRunning),

    #[error("download request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("download server answered with status {0}")]
    BadStatus(u16),

    #[error("downloaded file is not a ZIP archive")]
    NotAnArchive,

    #[error("archive has not been downloaded")]
    NotDownloaded,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("worker failed: {0}")]
    Worker(String),
}
