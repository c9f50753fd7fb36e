//! In-memory [`ObjectStore`] for tests and database-free runs.

use super::object_store::{ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryObjectStore {
	objects: Mutex<HashMap<(String, String), Bytes>>,
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
	async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), ObjectStoreError> {
		self.objects.lock().unwrap().insert((bucket.to_owned(), key.to_owned()), body);
		Ok(())
	}

	async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError> {
		self.objects
			.lock()
			.unwrap()
			.get(&(bucket.to_owned(), key.to_owned()))
			.cloned()
			.ok_or_else(|| ObjectStoreError::NotFound { bucket: bucket.to_owned(), key: key.to_owned() })
	}

	async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
		self.objects
			.lock()
			.unwrap()
			.remove(&(bucket.to_owned(), key.to_owned()))
			.map(|_| ())
			.ok_or_else(|| ObjectStoreError::NotFound { bucket: bucket.to_owned(), key: key.to_owned() })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn round_trips_a_put_object() {
		let store = InMemoryObjectStore::default();
		store.put("dicom", "1.2.3", Bytes::from_static(b"bytes")).await.unwrap();
		assert_eq!(store.get("dicom", "1.2.3").await.unwrap(), Bytes::from_static(b"bytes"));
	}

	#[tokio::test]
	async fn get_missing_key_errors() {
		let store = InMemoryObjectStore::default();
		assert!(matches!(store.get("dicom", "missing").await, Err(ObjectStoreError::NotFound { .. })));
	}

	#[tokio::test]
	async fn delete_removes_the_object() {
		let store = InMemoryObjectStore::default();
		store.put("dicom", "1.2.3", Bytes::from_static(b"bytes")).await.unwrap();
		store.delete("dicom", "1.2.3").await.unwrap();
		assert!(matches!(store.get("dicom", "1.2.3").await, Err(ObjectStoreError::NotFound { .. })));
	}
}
