//! Upload of a job's output tree plus manifest synthesis.
//!
//! [`ResultCollector::collect`] walks the output directory, uploads every
//! regular file under `<prefix>/<relative path>`, then writes and uploads
//! `manifest.json` last. Any upload failure aborts the whole collection;
//! the caller decides what, if anything, to commit.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use lipid_core::manifest::{Manifest, MANIFEST_FILE};
use lipid_core::storage::{join_key, ObjectStore, StorageError};
use walkdir::WalkDir;

/// Errors raised while collecting results.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("Failed to walk output directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Failed to read output file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to upload {path}: {source}")]
    Upload {
        path: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to write manifest: {0}")]
    Manifest(String),
}

/// A regular file found in the output tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    /// Path relative to the output root, `/`-separated.
    pub relative: String,
}

/// List regular files under `root`, sorted by relative path.
///
/// Symlinks are not followed and directories are not listed.
pub fn list_output_files(root: &Path) -> Result<Vec<OutputFile>, CollectError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(relative) = relative_key(root, entry.path()) {
            files.push(OutputFile {
                path: entry.path().to_path_buf(),
                relative,
            });
        }
    }
    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

/// `path` relative to `root`, joined with `/` regardless of platform.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

pub struct ResultCollector {
    store: Arc<dyn ObjectStore>,
}

impl ResultCollector {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Upload the output tree rooted at `out_dir` under `prefix`.
    ///
    /// Returns relative path -> storage URI for every uploaded file,
    /// including `manifest.json`.
    pub async fn collect(
        &self,
        out_dir: &Path,
        prefix: &str,
        input_ref: &str,
    ) -> Result<BTreeMap<String, String>, CollectError> {
        let mut uploaded = BTreeMap::new();

        for file in list_output_files(out_dir)? {
            if file.relative == MANIFEST_FILE {
                tracing::warn!(
                    path = %file.path.display(),
                    "Tool produced its own manifest.json; it will be replaced",
                );
                continue;
            }

            let bytes = tokio::fs::read(&file.path)
                .await
                .map_err(|source| CollectError::Read {
                    path: file.path.clone(),
                    source,
                })?;
            let uri = self.upload(bytes, prefix, &file.relative).await?;
            tracing::debug!(relative = %file.relative, uri = %uri, "Uploaded output");
            uploaded.insert(file.relative, uri);
        }

        let manifest = Manifest::new(input_ref, uploaded.keys().cloned());
        let bytes = manifest
            .to_json_pretty()
            .map_err(|e| CollectError::Manifest(e.to_string()))?;
        tokio::fs::write(out_dir.join(MANIFEST_FILE), &bytes)
            .await
            .map_err(|e| CollectError::Manifest(e.to_string()))?;

        let uri = self.upload(bytes, prefix, MANIFEST_FILE).await?;
        uploaded.insert(MANIFEST_FILE.to_string(), uri);

        tracing::info!(
            prefix,
            outputs = manifest.outputs.len(),
            "Uploaded outputs and manifest",
        );
        Ok(uploaded)
    }

    async fn upload(
        &self,
        bytes: Vec<u8>,
        prefix: &str,
        relative: &str,
    ) -> Result<String, CollectError> {
        self.store
            .put(bytes, &join_key(prefix, relative))
            .await
            .map_err(|source| CollectError::Upload {
                path: relative.to_string(),
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
