//! Writing generated artifacts to disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zcl_config::{PackageId, SessionId, Tables, FEATURE_LEVEL};

use crate::engine::{generate, GenerateOptions, GenerationResult};
use crate::error::{GenerationError, Result};

/// File name of the generation manifest written next to the artifacts.
pub const GEN_RESULT_FILE: &str = "genResult.json";

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Rename an existing artifact to `<name>~` before overwriting it
    pub backup: bool,
    /// Also write `genResult.json`
    pub gen_result_file: bool,
    pub creator: String,
    pub generate: GenerateOptions,
}

/// Content of `genResult.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationManifest {
    /// Seconds since the Unix epoch
    pub write_time: u64,
    pub feature_level: u32,
    pub creator: String,
    pub content: Vec<String>,
    pub has_errors: bool,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn write_file(path: &Path, content: &str, backup: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| GenerationError::io(parent, e))?;
    }
    if backup && path.exists() {
        let mut backup_path = path.as_os_str().to_owned();
        backup_path.push("~");
        let backup_path = PathBuf::from(backup_path);
        fs::rename(path, &backup_path).map_err(|e| GenerationError::io(path, e))?;
        debug!(path = %backup_path.display(), "backed up");
    }
    fs::write(path, content).map_err(|e| GenerationError::io(path, e))
}

/// Writes every artifact of `result` below `dir`.
pub fn write_result(
    result: &GenerationResult,
    dir: &Path,
    options: &WriteOptions,
) -> Result<Option<GenerationManifest>> {
    fs::create_dir_all(dir).map_err(|e| GenerationError::io(dir, e))?;
    for (name, content) in &result.content {
        write_file(&dir.join(name), content, options.backup)?;
    }

    let manifest = options.gen_result_file.then(|| GenerationManifest {
        write_time: now(),
        feature_level: FEATURE_LEVEL,
        creator: options.creator.clone(),
        content: result.content.keys().cloned().collect(),
        has_errors: result.has_errors,
    });
    if let Some(manifest) = &manifest {
        let path = dir.join(GEN_RESULT_FILE);
        let json =
            serde_json::to_string_pretty(manifest).map_err(|e| GenerationError::json(&path, e))?;
        write_file(&path, &json, false)?;
    }

    info!(
        dir = %dir.display(),
        files = result.content.len(),
        "artifacts written"
    );
    Ok(manifest)
}

/// Generates `manifest` for `session` and writes the artifacts below `dir`.
pub fn generate_and_write_files(
    db: &Tables,
    manifest: PackageId,
    session: SessionId,
    dir: &Path,
    options: &WriteOptions,
) -> Result<GenerationResult> {
    let result = generate(db, manifest, session, &options.generate)?;
    write_result(&result, dir, options)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(content: &[(&str, &str)]) -> GenerationResult {
        GenerationResult {
            content: content
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn writes_artifacts_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let options = WriteOptions {
            gen_result_file: true,
            creator: "test".into(),
            ..Default::default()
        };
        let manifest = write_result(&result(&[("b.h", "B"), ("sub/a.h", "A")]), dir.path(), &options)
            .unwrap()
            .unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("b.h")).unwrap(), "B");
        assert_eq!(fs::read_to_string(dir.path().join("sub/a.h")).unwrap(), "A");
        assert_eq!(manifest.content, vec!["b.h", "sub/a.h"]);

        let written: GenerationManifest = serde_json::from_str(
            &fs::read_to_string(dir.path().join(GEN_RESULT_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(written, manifest);
        assert_eq!(written.feature_level, FEATURE_LEVEL);
        assert!(written.write_time > 0);
    }

    #[test]
    fn backup_keeps_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let options = WriteOptions {
            backup: true,
            ..Default::default()
        };
        write_result(&result(&[("a.h", "old")]), dir.path(), &options).unwrap();
        let manifest = write_result(&result(&[("a.h", "new")]), dir.path(), &options).unwrap();

        assert!(manifest.is_none());
        assert_eq!(fs::read_to_string(dir.path().join("a.h")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dir.path().join("a.h~")).unwrap(), "old");
        assert!(!dir.path().join(GEN_RESULT_FILE).exists());
    }

    #[test]
    fn no_backup_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let options = WriteOptions::default();
        write_result(&result(&[("a.h", "old")]), dir.path(), &options).unwrap();
        write_result(&result(&[("a.h", "new")]), dir.path(), &options).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("a.h")).unwrap(), "new");
        assert!(!dir.path().join("a.h~").exists());
    }
}
