/*
    atomic_file.rs - Crash-safe whole-file replacement

    Readers observe either the previous complete contents or the new
    complete contents of a store file, never a mix.

    Write protocol:
    - Write to a uniquely named temporary sibling
    - sync_all the temporary file
    - Rename over the target
    - fsync the containing directory so the rename itself is durable
*/

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Suffix used by temporary siblings; readers never open these.
pub const TEMP_SUFFIX: &str = ".tmp";

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let unique = uuid::Uuid::new_v4().simple().to_string();
    path.with_file_name(format!(".{}.{}{}", file_name, unique, TEMP_SUFFIX))
}

/// Atomically replace `path` with `data`
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = temp_path_for(path);
    let result = write_and_rename(&temp_path, path, data);
    if result.is_err() {
        // The target is untouched; only the sibling may be left behind.
        if let Err(e) = fs::remove_file(&temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %temp_path.display(), error = %e, "Failed to remove temporary file");
            }
        }
    }
    result
}

fn write_and_rename(temp_path: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(temp_path, path)?;
    sync_parent_dir(path)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => File::open(".")?.sync_all(),
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Read the whole file, or `None` if it does not exist
pub fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.pb");

        write_atomic(&path, b"hello").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert_eq!(entries(dir.path()), vec!["settings.pb".to_string()]);
    }

    #[test]
    fn test_write_replaces_previous_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.pb");

        write_atomic(&path, b"a much longer first version").unwrap();
        write_atomic(&path, b"short").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"short");
    }

    #[test]
    fn test_write_creates_missing_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("prefs");

        write_atomic(&path, b"{}").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"{}");
    }

    #[test]
    fn test_failed_write_leaves_target_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        write_atomic(&path, b"committed").unwrap();

        // Renaming a file over a non-empty directory fails on every platform.
        let blocked = dir.path().join("blocked");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("child"), b"x").unwrap();
        assert!(write_atomic(&blocked, b"new").is_err());

        assert_eq!(fs::read(&path).unwrap(), b"committed");
        assert!(entries(dir.path()).iter().all(|n| !n.ends_with(TEMP_SUFFIX)));
    }

    #[test]
    fn test_read_if_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing");

        assert!(read_if_exists(&path).unwrap().is_none());

        fs::write(&path, b"data").unwrap();
        assert_eq!(read_if_exists(&path).unwrap(), Some(b"data".to_vec()));
    }
}
