// neura-core/src/infrastructure/lock.rs

// Per-template advisory lock. The lockfile lives inside the template
// directory and embeds the holder's reason, correlation id and timestamp so
// a contended caller can say who is in the way. fs2 gives a fail-fast
// try-lock; the guard releases on every exit path.

use crate::domain::error::DomainError;
use crate::error::NeuraError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const LOCK_FILENAME: &str = ".template.lock";

#[derive(Debug)]
pub struct TemplateLock {
    file: File,
    path: PathBuf,
    reason: String,
}

impl TemplateLock {
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl Drop for TemplateLock {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "template lock release failed");
        }
        // Removal is cosmetic; the advisory lock itself is already gone.
        let _ = std::fs::remove_file(&self.path);
        debug!(path = %self.path.display(), reason = %self.reason, "template lock released");
    }
}

/// Acquire the advisory lock for a template directory, failing fast when
/// another holder is active. Covers the entire multi-step LLM/IO sequence.
pub fn acquire_template_lock(
    template_dir: &Path,
    reason: &str,
    correlation_id: Option<&str>,
) -> Result<TemplateLock, NeuraError> {
    std::fs::create_dir_all(template_dir)?;
    let path = template_dir.join(LOCK_FILENAME);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)?;

    if file.try_lock_exclusive().is_err() {
        let holder = std::fs::read_to_string(&path).unwrap_or_default();
        return Err(NeuraError::Domain(DomainError::TemplateLocked(format!(
            "{} (held by: {})",
            template_dir.display(),
            holder.trim()
        ))));
    }

    let body = format!(
        "{{\"reason\":\"{}\",\"correlation_id\":\"{}\",\"acquired_at\":\"{}\"}}",
        reason,
        correlation_id.unwrap_or(""),
        chrono::Utc::now().to_rfc3339()
    );
    file.set_len(0)?;
    file.write_all(body.as_bytes())?;
    file.flush()?;
    debug!(path = %path.display(), reason, "template lock acquired");

    Ok(TemplateLock { file, path, reason: reason.to_string() })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_acquire_and_release() {
        let dir = tempdir().unwrap();
        {
            let guard = acquire_template_lock(dir.path(), "mapping_preview", Some("cid-1")).unwrap();
            assert_eq!(guard.reason(), "mapping_preview");
            assert!(dir.path().join(LOCK_FILENAME).exists());
        }
        // Released on drop; a second acquisition must succeed.
        let again = acquire_template_lock(dir.path(), "reports_run", None);
        assert!(again.is_ok());
    }

    #[test]
    fn test_contended_lock_fails_fast() {
        let dir = tempdir().unwrap();
        let _held = acquire_template_lock(dir.path(), "reports_run", Some("cid-9")).unwrap();
        let err = acquire_template_lock(dir.path(), "mapping_preview", None).unwrap_err();
        match err {
            NeuraError::Domain(DomainError::TemplateLocked(msg)) => {
                assert!(msg.contains("reports_run"));
            }
            other => panic!("expected TemplateLocked, got {other:?}"),
        }
    }

    #[test]
    fn test_lockfile_embeds_correlation_id() {
        let dir = tempdir().unwrap();
        let _guard = acquire_template_lock(dir.path(), "verify", Some("cid-xyz")).unwrap();
        let body = std::fs::read_to_string(dir.path().join(LOCK_FILENAME)).unwrap();
        assert!(body.contains("cid-xyz"));
        assert!(body.contains("verify"));
    }
}
