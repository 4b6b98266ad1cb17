//! `<scheme>://<bucket>/<key>` object references.

use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// A parsed object storage reference such as `gs://lipid-inputs/slides/a.tif`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageUri {
    scheme: String,
    bucket: String,
    key: String,
}

impl StorageUri {
    pub fn new(
        scheme: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse `<scheme>://<bucket>/<key>`. Scheme, bucket and key must all be
    /// non-empty.
    pub fn parse(uri: &str) -> Result<Self, CoreError> {
        let invalid = |reason| CoreError::InvalidUri {
            uri: uri.to_string(),
            reason,
        };

        let (scheme, rest) = uri.split_once("://").ok_or_else(|| invalid("missing '://'"))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid("invalid scheme"));
        }

        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing object key"))?;
        if bucket.is_empty() {
            return Err(invalid("empty bucket"));
        }
        if key.is_empty() {
            return Err(invalid("missing object key"));
        }

        Ok(Self::new(scheme, bucket, key))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last path segment of the key, if it is non-empty.
    pub fn file_name(&self) -> Option<&str> {
        self.key.rsplit('/').next().filter(|name| !name.is_empty())
    }
}

impl FromStr for StorageUri {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for StorageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

/// Join an object key onto a prefix with exactly one `/` between them.
pub fn join_key(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{prefix}/{relative}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
