//! S3-compatible [`ObjectStore`] backed by `aws_sdk_s3::Client`, covering the
//! gateway's put/get/delete shape.

use super::object_store::{ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tracing::error;

pub struct S3ObjectStore {
	client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
	#[must_use]
	pub fn new(client: aws_sdk_s3::Client) -> Self {
		Self { client }
	}

	/// Builds a client from the standard AWS credential/region chain via
	/// `aws_config::load_defaults`.
	pub async fn from_environment() -> Self {
		let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
		Self::new(aws_sdk_s3::Client::new(&sdk_config))
	}
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
	async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), ObjectStoreError> {
		self.client
			.put_object()
			.bucket(bucket)
			.key(key)
			.body(ByteStream::from(body))
			.send()
			.await
			.map_err(|err| {
				error!(%bucket, %key, "s3 put_object failed: {err:?}");
				ObjectStoreError::Backend(err.to_string())
			})?;
		Ok(())
	}

	async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError> {
		let response = self.client.get_object().bucket(bucket).key(key).send().await.map_err(|err| {
			if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
				ObjectStoreError::NotFound { bucket: bucket.to_owned(), key: key.to_owned() }
			} else {
				error!(%bucket, %key, "s3 get_object failed: {err:?}");
				ObjectStoreError::Backend(err.to_string())
			}
		})?;
		let bytes = response.body.collect().await.map_err(|err| ObjectStoreError::Backend(err.to_string()))?;
		Ok(bytes.into_bytes())
	}

	async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
		self.client.delete_object().bucket(bucket).key(key).send().await.map_err(|err| {
			error!(%bucket, %key, "s3 delete_object failed: {err:?}");
			ObjectStoreError::Backend(err.to_string())
		})?;
		Ok(())
	}
}
