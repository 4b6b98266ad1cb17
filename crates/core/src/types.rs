/// Job identifiers are assigned by the external scheduler and treated as opaque.
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
