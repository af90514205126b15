//! Filesystem primitives the spool is built on: exclusive create, atomic
//! replace, and tolerant removal.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::Result;

/// Create `path` with `contents`, failing softly if it already exists.
///
/// Returns `Ok(false)` when the name is taken. This is the single atomic
/// action every lock in the spool rests on.
pub async fn create_exclusive(path: &Path, contents: &[u8]) -> Result<bool> {
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let written = async {
        file.write_all(contents).await?;
        file.sync_all().await
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(path).await;
        return Err(e.into());
    }
    Ok(true)
}

/// Replace `path` with `contents` via write-to-temp then rename.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = sibling_temp(path);
    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Remove a file, treating a missing file as already removed.
///
/// Returns whether anything was removed.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read and deserialize a JSON file, `None` if it does not exist.
pub async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// File names in `dir`; a missing directory is empty.
pub async fn list_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut rd = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = rd.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// A hidden, unique name next to `path`.
pub(crate) fn sibling_temp(path: &Path) -> PathBuf {
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("spool");
    path.with_file_name(format!(".{}.{}.tmp", base, ulid::Ulid::new()))
}

/// Move `path` to a unique hidden sibling. `None` if it was already gone.
///
/// The rename is atomic, so exactly one of several callers racing over the
/// same file gets it.
pub(crate) async fn set_aside(path: &Path) -> Result<Option<PathBuf>> {
    let aside = sibling_temp(path);
    match fs::rename(path, &aside).await {
        Ok(()) => Ok(Some(aside)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Put a file moved by [`set_aside`] back at `path` without overwriting.
///
/// Returns false if `path` was taken again in the meantime. The set-aside
/// copy is removed either way.
pub(crate) async fn put_back(aside: &Path, path: &Path) -> Result<bool> {
    let contents = fs::read(aside).await?;
    let restored = create_exclusive(path, &contents).await?;
    remove_if_exists(aside).await?;
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_exclusive_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LCK..hub");
        assert!(create_exclusive(&path, b"1").await.unwrap());
        assert!(!create_exclusive(&path, b"2").await.unwrap());
        assert_eq!(fs::read(&path).await.unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record");
        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"second");
        assert_eq!(list_names(dir.path()).await.unwrap(), vec!["record".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!remove_if_exists(&dir.path().join("gone")).await.unwrap());
        assert!(list_names(&dir.path().join("nope")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_aside_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LXQ.0");
        fs::write(&path, b"1").await.unwrap();
        let first = set_aside(&path).await.unwrap();
        let second = set_aside(&path).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        let aside = first.unwrap();
        assert!(put_back(&aside, &path).await.unwrap());
        assert_eq!(fs::read(&path).await.unwrap(), b"1");
        assert!(!aside.exists());
    }

    #[tokio::test]
    async fn test_put_back_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LXQ.0");
        fs::write(&path, b"old").await.unwrap();
        let aside = set_aside(&path).await.unwrap().unwrap();
        fs::write(&path, b"new").await.unwrap();
        assert!(!put_back(&aside, &path).await.unwrap());
        assert_eq!(fs::read(&path).await.unwrap(), b"new");
    }
}
