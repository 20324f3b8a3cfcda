// Filesystem helpers shared by the session store, credential store and finalizer

use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const PRIVATE_MODE: u32 = 0o600;

/// Write `contents` to `path` so readers only ever observe the old or the new
/// file: data goes to a sibling temp file, is fsynced, then renamed over the target.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_replacing(path, contents, None).await
}

/// Same as [`write_atomic`] but the file is owner-only on unix from the moment
/// the temp file exists.
pub async fn write_atomic_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_replacing(path, contents, Some(PRIVATE_MODE)).await
}

async fn write_replacing(path: &Path, contents: &[u8], mode: Option<u32>) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    tokio::fs::create_dir_all(parent).await?;

    let tmp_path = temp_sibling(path);
    let mut file = create_temp(&tmp_path, mode).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    // Persist the rename itself.
    #[cfg(unix)]
    {
        if let Ok(dir) = tokio::fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }

    Ok(())
}

/// A leftover temp file from a crash is removed first so the requested mode
/// always applies to a newly created file.
async fn create_temp(tmp_path: &Path, mode: Option<u32>) -> io::Result<tokio::fs::File> {
    match tokio::fs::remove_file(tmp_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        if let Some(mode) = mode {
            options.mode(mode);
        }
    }
    #[cfg(not(unix))]
    let _ = mode;
    options.open(tmp_path).await
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_atomic_creates_parents_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested").join("state.json");

        write_atomic(&target, b"{\"a\":1}").await.unwrap();
        write_atomic(&target, b"{\"a\":2}").await.unwrap();

        let content = tokio::fs::read_to_string(&target).await.unwrap();
        assert_eq!(content, "{\"a\":2}");
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn private_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("secret.json");
        write_atomic_private(&target, b"{}").await.unwrap();

        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn private_temp_file_is_owner_only_before_any_data_is_written() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("secret.json.tmp");
        std::fs::write(&tmp, b"stale").unwrap();
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).unwrap();

        let file = create_temp(&tmp, Some(PRIVATE_MODE)).await.unwrap();
        let mode = file.metadata().await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(file.metadata().await.unwrap().len(), 0);
    }
}
