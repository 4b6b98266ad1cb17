//! Filesystem-backed object store for local development.
//!
//! `<scheme>://<bucket>/<key>` maps to `<root>/<bucket>/<key>`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use super::{ObjectStore, StorageError, StorageUri};

pub struct LocalObjectStore {
    root: PathBuf,
    scheme: String,
    results_bucket: String,
}

impl LocalObjectStore {
    pub fn new(
        root: impl Into<PathBuf>,
        scheme: impl Into<String>,
        results_bucket: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            scheme: scheme.into(),
            results_bucket: results_bucket.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a bucket/key pair to a path under the root.
    ///
    /// Keys may only contain normal path segments so that nothing outside
    /// the bucket directory can be read or written.
    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let all_normal = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        let bucket_ok = !bucket.is_empty()
            && bucket != ".."
            && !bucket.contains('/')
            && !bucket.contains('\\');
        if key.is_empty() || !all_normal || !bucket_ok {
            return Err(StorageError::InvalidKey(format!("{bucket}/{key}")));
        }
        Ok(self.root.join(bucket).join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, uri: &StorageUri) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(uri.bucket(), uri.key())?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(uri.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn put(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
        let path = self.object_path(&self.results_bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), "Stored object on local filesystem");
        Ok(StorageUri::new(&self.scheme, &self.results_bucket, key).to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
