/// Validation errors for job inputs (mode selector, storage URIs).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Unknown mode '{0}'. Must be one of: 40X, 20X")]
    UnknownMode(String),

    #[error("Invalid storage URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: &'static str },
}
