// Asset archive extraction

use super::relay::ProgressReporter;
use super::ProgressError;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use zip::ZipArchive;

pub const EXTRACTED_MARKER: &str = ".extracted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractSummary {
    pub files_extracted: u64,
    pub files_skipped: u64,
    pub destination: PathBuf,
}

/// Whether a previous extraction into `dest_dir` ran to completion.
pub async fn is_extracted(dest_dir: &Path) -> bool {
    tokio::fs::try_exists(dest_dir.join(EXTRACTED_MARKER))
        .await
        .unwrap_or(false)
}

/// Extract `archive` into `dest_dir` on a blocking worker. The reporter
/// receives one terminal event whatever the outcome.
pub async fn extract_archive(
    archive: PathBuf,
    dest_dir: PathBuf,
    mut reporter: ProgressReporter,
) -> Result<ExtractSummary, ProgressError> {
    tokio::task::spawn_blocking(move || {
        match extract_zip_with_progress(&archive, &dest_dir, &mut reporter) {
            Ok(summary) => {
                reporter.complete();
                Ok(summary)
            }
            Err(e) => {
                reporter.fail(e.to_string());
                Err(e)
            }
        }
    })
    .await
    .map_err(|e| ProgressError::Worker(e.to_string()))?
}

/// Uses `enclosed_name()` so entries cannot escape `dest_dir` (Zip Slip).
fn extract_zip_with_progress(
    zip_path: &Path,
    dest_dir: &Path,
    reporter: &mut ProgressReporter,
) -> Result<ExtractSummary, ProgressError> {
    let file = File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)?;

    let total_files = archive.len() as u64;
    let total_bytes: u64 = (0..archive.len())
        .filter_map(|i| archive.by_index_raw(i).ok().map(|entry| entry.size()))
        .sum();
    reporter.set_totals(Some(total_files), Some(total_bytes));

    std::fs::create_dir_all(dest_dir)?;
    let marker = dest_dir.join(EXTRACTED_MARKER);
    if marker.exists() {
        std::fs::remove_file(&marker)?;
    }

    let mut extracted: u64 = 0;
    let mut skipped: u64 = 0;
    let mut bytes: u64 = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let entry_name = entry.name().to_string();

        let Some(safe_rel) = entry.enclosed_name() else {
            tracing::warn!("Skipping unsafe archive path: {}", entry_name);
            skipped += 1;
            reporter.set_files(extracted + skipped, None);
            continue;
        };
        let out_path = dest_dir.join(safe_rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out_file = File::create(&out_path)?;
            bytes += std::io::copy(&mut entry, &mut out_file)?;
        }

        extracted += 1;
        reporter.set_bytes(bytes);
        reporter.set_files(extracted + skipped, Some(entry_name));
    }

    std::fs::write(&marker, chrono::Utc::now().to_rfc3339())?;
    tracing::info!(
        "Extracted {} entries into {:?} ({} skipped)",
        extracted,
        dest_dir,
        skipped
    );

    Ok(ExtractSummary {
        files_extracted: extracted,
        files_skipped: skipped,
        destination: dest_dir.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::relay::{OperationState, ProgressRelay};
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn extracts_and_marks_completion() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("assets.zip");
        write_zip(
            &archive,
            &[("Assets/models/a.bin", b"aaaa"), ("Assets/readme.txt", b"hello")],
        );
        let dest = dir.path().join("assets");
        let relay = ProgressRelay::new("extraction");

        let summary = extract_archive(archive, dest.clone(), relay.begin().unwrap())
            .await
            .unwrap();

        assert_eq!(summary.files_extracted, 2);
        assert_eq!(std::fs::read(dest.join("Assets/readme.txt")).unwrap(), b"hello");
        assert!(is_extracted(&dest).await);
        let status = relay.status();
        assert_eq!(status.state, OperationState::Complete);
        assert_eq!(status.progress.files_done, 2);
    }

    #[tokio::test]
    async fn traversal_entries_are_skipped() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", b"x"), ("ok.txt", b"y")]);
        let dest = dir.path().join("out");
        let relay = ProgressRelay::new("extraction");

        let summary = extract_archive(archive, dest.clone(), relay.begin().unwrap())
            .await
            .unwrap();

        assert_eq!(summary.files_skipped, 1);
        assert!(!dir.path().join("escape.txt").exists());
        assert!(dest.join("ok.txt").exists());
    }

    #[tokio::test]
    async fn corrupt_archive_fails_the_operation() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"PK but not really").unwrap();
        let dest = dir.path().join("out");
        let relay = ProgressRelay::new("extraction");

        assert!(extract_archive(archive, dest.clone(), relay.begin().unwrap())
            .await
            .is_err());
        assert_eq!(relay.status().state, OperationState::Failed);
        assert!(!is_extracted(&dest).await);
    }
}
