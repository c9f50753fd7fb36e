//! Object storage seam: one trait, an
//! S3-compatible implementation ([`super::s3`], feature `s3`) and an
//! in-memory one ([`super::memory`]) for tests and database-free runs.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
	#[error("object {bucket}/{key} not found")]
	NotFound { bucket: String, key: String },
	#[error("object store request failed: {0}")]
	Backend(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
	async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), ObjectStoreError>;
	async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError>;
	async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;
}
