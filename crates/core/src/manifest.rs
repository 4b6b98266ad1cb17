//! Result manifest written next to the segmentation outputs.

use serde::{Deserialize, Serialize};

/// Well-known path of the manifest under a job's result prefix.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Index of a job's uploaded artifacts.
///
/// Serialized as
/// `{ "inputs": { "image": ... }, "outputs": [sorted relative paths] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub inputs: ManifestInputs,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestInputs {
    /// Storage reference of the source image.
    pub image: String,
}

impl Manifest {
    /// Build a manifest from the uploaded relative paths.
    ///
    /// Paths are sorted lexicographically and deduplicated; the manifest's
    /// own path is never listed.
    pub fn new<I, S>(image: impl Into<String>, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut outputs: Vec<String> = outputs
            .into_iter()
            .map(Into::into)
            .filter(|p| p != MANIFEST_FILE)
            .collect();
        outputs.sort();
        outputs.dedup();

        Self {
            inputs: ManifestInputs {
                image: image.into(),
            },
            outputs,
        }
    }

    /// Pretty-printed JSON bytes, as stored in `manifest.json`.
    pub fn to_json_pretty(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
