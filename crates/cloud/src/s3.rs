//! S3-compatible object store.
//!
//! Works against AWS S3 and against S3-compatible endpoints (GCS XML
//! interoperability, MinIO) when `endpoint_url` is set.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use lipid_core::storage::{ObjectStore, StorageError, StorageUri};

/// Connection settings for [`S3ObjectStore`].
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// Bucket receiving job outputs.
    pub results_bucket: String,
    /// Scheme used when formatting returned URIs (e.g. `gs`, `s3`).
    pub scheme: String,
    /// Custom endpoint for S3-compatible services. Enables path-style
    /// addressing.
    pub endpoint_url: Option<String>,
}

pub struct S3ObjectStore {
    client: Client,
    settings: S3Settings,
}

impl S3ObjectStore {
    /// Build a client from the ambient AWS configuration (environment,
    /// profile, instance metadata).
    pub async fn from_env(settings: S3Settings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(url) = &settings.endpoint_url {
            loader = loader.endpoint_url(url);
        }
        let shared = loader.load().await;

        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(settings.endpoint_url.is_some())
            .build();

        tracing::info!(
            results_bucket = %settings.results_bucket,
            endpoint = settings.endpoint_url.as_deref().unwrap_or("default"),
            "S3 object store configured",
        );

        Self {
            client: Client::from_conf(config),
            settings,
        }
    }

    fn result_uri(&self, key: &str) -> String {
        result_uri(&self.settings, key)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, uri: &StorageUri) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(uri.bucket())
            .key(uri.key())
            .send()
            .await
            .map_err(|e| classify_get_error(uri, e))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(StorageError::backend)?;
        Ok(data.into_bytes().to_vec())
    }

    async fn put(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.settings.results_bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::backend(DisplayErrorContext(e).to_string()))?;

        tracing::debug!(key, size, "Uploaded object");
        Ok(self.result_uri(key))
    }
}

fn classify_get_error(uri: &StorageUri, err: SdkError<GetObjectError>) -> StorageError {
    if let SdkError::ServiceError(service) = &err {
        if service.err().is_no_such_key() {
            return StorageError::NotFound(uri.to_string());
        }
    }
    StorageError::backend(DisplayErrorContext(err).to_string())
}

fn result_uri(settings: &S3Settings, key: &str) -> String {
    StorageUri::new(&settings.scheme, &settings.results_bucket, key).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
