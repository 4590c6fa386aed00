// neura-core/src/infrastructure/artifacts.rs

// Per-template artifact directory bookkeeping. The manifest is the source of
// truth for "has this stage produced output": a file listed in the manifest
// but missing on disk is a hard error at load.

use crate::error::NeuraError;
use crate::infrastructure::fs::{read_json_opt, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILENAME: &str = "artifact_manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactManifest {
    /// Artifact name -> path relative to the template directory.
    pub files: BTreeMap<String, String>,
    /// Artifact name -> sha256 of the file bytes at produce time.
    pub file_checksums: BTreeMap<String, String>,
    pub produced_at: DateTime<Utc>,
    pub step: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn sha256_file(path: &Path) -> Result<String, NeuraError> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

/// Record the artifacts a stage produced. Checksums are computed over the
/// current bytes of each file; files that do not exist (yet) are skipped
/// from the checksum table but kept in the name map.
pub fn write_artifact_manifest(
    template_dir: &Path,
    step: &str,
    files: &BTreeMap<String, PathBuf>,
    inputs: &[String],
    correlation_id: Option<&str>,
) -> Result<ArtifactManifest, NeuraError> {
    let mut names = BTreeMap::new();
    let mut checksums = BTreeMap::new();
    for (name, path) in files {
        let relative = path
            .strip_prefix(template_dir)
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|_| path.clone());
        names.insert(name.clone(), relative.to_string_lossy().to_string());
        if path.exists() {
            checksums.insert(name.clone(), sha256_file(path)?);
        }
    }
    let manifest = ArtifactManifest {
        files: names,
        file_checksums: checksums,
        produced_at: Utc::now(),
        step: step.to_string(),
        inputs: inputs.to_vec(),
        correlation_id: correlation_id.map(String::from),
    };
    write_json_atomic(template_dir.join(MANIFEST_FILENAME), &manifest)
        .map_err(NeuraError::Infrastructure)?;
    Ok(manifest)
}

/// Load the manifest, tolerating absence.
pub fn load_manifest(template_dir: &Path) -> Result<Option<ArtifactManifest>, NeuraError> {
    read_json_opt(&template_dir.join(MANIFEST_FILENAME)).map_err(NeuraError::Infrastructure)
}

/// Load the manifest and verify every listed file still exists at its
/// recorded checksum. Used by the pipeline cache check.
pub fn verify_manifest(template_dir: &Path) -> Result<Option<ArtifactManifest>, NeuraError> {
    let Some(manifest) = load_manifest(template_dir)? else {
        return Ok(None);
    };
    for (name, relpath) in &manifest.files {
        let path = template_dir.join(relpath);
        if !path.exists() {
            return Err(NeuraError::InternalError(format!(
                "manifest lists '{name}' at {relpath} but the file is missing"
            )));
        }
        if let Some(expected) = manifest.file_checksums.get(name) {
            let actual = sha256_file(&path)?;
            if &actual != expected {
                return Err(NeuraError::InternalError(format!(
                    "manifest checksum mismatch for '{name}' ({relpath})"
                )));
            }
        }
    }
    Ok(Some(manifest))
}

/// True when the manifest exists, its step matches and every checksum holds.
pub fn manifest_matches_step(template_dir: &Path, step: &str) -> bool {
    matches!(verify_manifest(template_dir), Ok(Some(manifest)) if manifest.step == step)
}

/// Best-effort removal of leftover `*.tmp` files after a cancelled or
/// crashed run. Returns the number of files removed.
pub fn sweep_temp_files(template_dir: &Path) -> usize {
    let mut removed = 0;
    for entry in walkdir::WalkDir::new(template_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let is_tmp = entry
            .path()
            .extension()
            .map(|ext| ext == "tmp")
            .unwrap_or(false);
        if is_tmp && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}
