//! In-process object store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ObjectStore, StorageError, StorageUri};

/// Object store kept entirely in memory.
///
/// Objects are keyed by their full URI string. Every call is counted so
/// tests can assert that a code path never touched storage, and uploads
/// can be made to fail for keys containing a given fragment.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    scheme: String,
    results_bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_puts_containing: Mutex<Option<String>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new(scheme: impl Into<String>, results_bucket: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            results_bucket: results_bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
            fail_puts_containing: Mutex::new(None),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    /// Seed an object directly, bypassing the call counters.
    pub fn insert(&self, uri: &str, bytes: impl Into<Vec<u8>>) {
        self.lock_objects().insert(uri.to_string(), bytes.into());
    }

    /// Make every subsequent `put` whose key contains `fragment` fail.
    pub fn fail_puts_containing(&self, fragment: impl Into<String>) {
        *self
            .fail_puts_containing
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(fragment.into());
    }

    /// Stored bytes for `uri`, if any.
    pub fn object(&self, uri: &str) -> Option<Vec<u8>> {
        self.lock_objects().get(uri).cloned()
    }

    /// All stored URIs in lexicographic order.
    pub fn uris(&self) -> Vec<String> {
        self.lock_objects().keys().cloned().collect()
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, uri: &StorageUri) -> Result<Vec<u8>, StorageError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let uri = uri.to_string();
        self.lock_objects()
            .get(&uri)
            .cloned()
            .ok_or(StorageError::NotFound(uri))
    }

    async fn put(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .fail_puts_containing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(fragment) = failing {
            if key.contains(&fragment) {
                return Err(StorageError::backend(format!(
                    "injected upload failure for '{key}'"
                )));
            }
        }

        let uri = StorageUri::new(&self.scheme, &self.results_bucket, key).to_string();
        self.lock_objects().insert(uri.clone(), bytes);
        Ok(uri)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
