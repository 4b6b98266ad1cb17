//! `lipid-cloud` -- cloud object storage adapters.

pub mod s3;

pub use s3::{S3ObjectStore, S3Settings};
