// neura-core/src/infrastructure/fs.rs

use crate::error::NeuraError;
use crate::infrastructure::error::InfrastructureError;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Write content to a file atomically using a temporary file.
///
/// This function:
/// 1. Creates a temporary file in the same directory as the target path.
/// 2. Writes the content to the temporary file.
/// 3. Persists (renames) the temporary file to the target path.
///
/// This ensures that the target file is either fully written or not written at all,
/// preventing partial data corruption.
pub fn atomic_write<P: AsRef<Path>, C: AsRef<[u8]>>(
    path: P,
    content: C,
) -> Result<(), InfrastructureError> {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    // Create a temporary file in the same directory to ensure atomic rename works across filesystems
    let mut temp_file = tempfile::NamedTempFile::new_in(parent).map_err(InfrastructureError::Io)?;

    // Write content
    temp_file
        .write_all(content.as_ref())
        .map_err(InfrastructureError::Io)?;

    // Atomic rename (persist)
    temp_file
        .persist(path)
        .map_err(|e| InfrastructureError::Io(e.error))?;

    Ok(())
}

/// Serialize to pretty JSON and write atomically.
pub fn write_json_atomic<P: AsRef<Path>, T: serde::Serialize>(
    path: P,
    value: &T,
) -> Result<(), InfrastructureError> {
    let content = serde_json::to_string_pretty(value)?;
    atomic_write(path, content)
}

/// Write UTF-8 text atomically.
pub fn write_text_atomic<P: AsRef<Path>, S: AsRef<str>>(
    path: P,
    text: S,
) -> Result<(), InfrastructureError> {
    atomic_write(path, text.as_ref().as_bytes())
}

/// Read and deserialize a JSON file, tolerating absence.
pub fn read_json_opt<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, InfrastructureError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Resolve `candidate` and confirm it stays under `root`.
///
/// Both sides are lexically normalized (`.`/`..` folded) so the check works
/// before the file exists.
pub fn resolve_under_root(root: &Path, candidate: &Path) -> Result<PathBuf, NeuraError> {
    let normalized_root = normalize(root);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        normalized_root.join(candidate)
    };
    let normalized = normalize(&joined);
    if !normalized.starts_with(&normalized_root) {
        return Err(NeuraError::UnsafePath(candidate.display().to_string()));
    }
    Ok(normalized)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_creates_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.txt");
        let content = "Hello, World!";

        atomic_write(&file_path, content)?;

        assert!(file_path.exists());
        let read_content = fs::read_to_string(file_path)?;
        assert_eq!(read_content, content);
        Ok(())
    }

    #[test]
    fn test_atomic_write_overwrites_existing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.txt");

        atomic_write(&file_path, "Initial")?;
        atomic_write(&file_path, "Updated")?;

        let read_content = fs::read_to_string(file_path)?;
        assert_eq!(read_content, "Updated");
        Ok(())
    }

    #[test]
    fn test_json_round_trip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.json");
        let value = serde_json::json!({"a": 1, "b": ["x", "y"], "c": {"nested": true}});

        write_json_atomic(&path, &value)?;
        let loaded: Option<serde_json::Value> = read_json_opt(&path)?;
        assert_eq!(loaded, Some(value));
        Ok(())
    }

    #[test]
    fn test_read_json_opt_missing_is_none() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let loaded: Option<serde_json::Value> = read_json_opt(&dir.path().join("missing.json"))?;
        assert!(loaded.is_none());
        Ok(())
    }

    #[test]
    fn test_resolve_under_root_accepts_children() {
        let root = Path::new("/srv/uploads");
        let resolved = resolve_under_root(root, Path::new("pdf/tpl-1/contract.json")).unwrap();
        assert_eq!(resolved, Path::new("/srv/uploads/pdf/tpl-1/contract.json"));
    }

    #[test]
    fn test_resolve_under_root_rejects_escape() {
        let root = Path::new("/srv/uploads");
        assert!(resolve_under_root(root, Path::new("../etc/passwd")).is_err());
        assert!(resolve_under_root(root, Path::new("pdf/../../etc")).is_err());
        assert!(resolve_under_root(root, Path::new("/etc/passwd")).is_err());
    }
}
