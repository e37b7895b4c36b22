use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Atomically write content to a file
///
/// Writes to a sibling temporary file, syncs it, then renames it over the
/// target so readers never observe a half-written registry or secret.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_private_directory(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    {
        let mut file = File::create(&temp_path).with_context(|| {
            format!("Failed to create temporary file: {}", temp_path.display())
        })?;

        file.write_all(content)
            .context("Failed to write to temporary file")?;

        file.sync_all().context("Failed to sync file to disk")?;
    }

    set_file_permissions(&temp_path, 0o600)?;

    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

/// Ensure a directory exists and is only accessible by the current user
pub fn ensure_private_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
        set_file_permissions(path, 0o700)?;
    }

    Ok(())
}

/// Set file permissions to a specific mode (Unix only)
pub fn set_file_permissions(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to get metadata for: {}", path.display()))?;

        let mut permissions = metadata.permissions();
        permissions.set_mode(mode);

        std::fs::set_permissions(path, permissions)
            .with_context(|| format!("Failed to set permissions for: {}", path.display()))?;
    }

    #[cfg(windows)]
    {
        // Per-user ACLs are inherited from %LOCALAPPDATA%; only clear read-only.
        let _ = mode;
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to get metadata for: {}", path.display()))?;

        let mut permissions = metadata.permissions();
        permissions.set_readonly(false);

        std::fs::set_permissions(path, permissions)
            .with_context(|| format!("Failed to set permissions for: {}", path.display()))?;
    }

    Ok(())
}

/// Get the current OS username
pub fn current_username() -> Option<String> {
    #[cfg(target_os = "windows")]
    let var = "USERNAME";

    #[cfg(not(target_os = "windows"))]
    let var = "USER";

    std::env::var(var).ok().filter(|name| !name.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write() {
        let temp_dir = tempdir().unwrap();
        let test_file = temp_dir.path().join("installed_thumbprints.json");

        atomic_write(&test_file, b"[]").unwrap();

        assert_eq!(std::fs::read(&test_file).unwrap(), b"[]");
        assert!(!test_file.with_extension("tmp").exists());
    }

    #[test]
    fn test_atomic_write_replaces_existing_content() {
        let temp_dir = tempdir().unwrap();
        let test_file = temp_dir.path().join("secrets.dat");

        atomic_write(&test_file, b"first").unwrap();
        atomic_write(&test_file, b"second").unwrap();

        assert_eq!(std::fs::read(&test_file).unwrap(), b"second");
    }

    #[test]
    fn test_atomic_write_nested_path() {
        let temp_dir = tempdir().unwrap();
        let test_file = temp_dir.path().join("nested").join("path").join("config.json");

        atomic_write(&test_file, b"{}").unwrap();

        assert_eq!(std::fs::read(&test_file).unwrap(), b"{}");
    }

    #[cfg(unix)]
    #[test]
    fn test_atomic_write_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempdir().unwrap();
        let test_file = temp_dir.path().join("seal.key");
        atomic_write(&test_file, b"key").unwrap();

        let mode = std::fs::metadata(&test_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_ensure_private_directory_idempotent() {
        let temp_dir = tempdir().unwrap();
        let test_dir = temp_dir.path().join("logs");

        ensure_private_directory(&test_dir).unwrap();
        ensure_private_directory(&test_dir).unwrap();
        assert!(test_dir.is_dir());
    }
}
