//! `lipid-core` -- domain types and collaborator interfaces for the
//! segmentation worker.
//!
//! Holds the job model, the status document exchanged with the status
//! store, the result manifest, the object store / status store traits
//! with their in-process backends, and the shared subprocess runner.

pub mod error;
pub mod job;
pub mod manifest;
pub mod scripting;
pub mod status;
pub mod storage;
pub mod types;
