//! `lipid-worker` -- runs one segmentation job end to end.
//!
//! The binary reads its job and deployment settings from the environment
//! ([`config::BootstrapConfig`], [`config::WorkerConfig`]), wires the
//! configured stores into a [`runner::JobRunner`], and exits with the job's outcome.

pub mod collector;
pub mod config;
pub mod processor;
pub mod runner;
