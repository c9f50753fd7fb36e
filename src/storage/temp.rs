//! Local buffering for ingested bytes before the upload worker ships them to
//! the object store.
//!
//! `StorageConfig::temporary_data_storage` selects between the disk-backed
//! and in-memory implementations below, so the ingestors never touch
//! `std::fs` directly.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TempStoreError {
	#[error("temporary object at {0:?} not found")]
	NotFound(PathBuf),
	#[error("temporary storage I/O error: {0}")]
	Io(#[from] std::io::Error),
}

/// A handle the caller treats opaquely: pass it back to [`TemporaryStore::read`]
/// or [`TemporaryStore::delete`], never inspect its contents.
pub type TempHandle = PathBuf;

#[async_trait]
pub trait TemporaryStore: Send + Sync {
	async fn write(&self, identifier: &str, bytes: Bytes) -> Result<TempHandle, TempStoreError>;
	async fn read(&self, handle: &Path) -> Result<Bytes, TempStoreError>;
	async fn delete(&self, handle: &Path) -> Result<(), TempStoreError>;
}

/// Writes to real files under a configured root directory.
pub struct LocalDiskTemporaryStore {
	root: PathBuf,
}

impl LocalDiskTemporaryStore {
	#[must_use]
	pub fn new(root: PathBuf) -> Self {
		Self { root }
	}

	fn path_for(&self, identifier: &str) -> PathBuf {
		self.root.join(sanitize(identifier))
	}
}

fn sanitize(identifier: &str) -> String {
	identifier.chars().map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' }).collect()
}

#[async_trait]
impl TemporaryStore for LocalDiskTemporaryStore {
	async fn write(&self, identifier: &str, bytes: Bytes) -> Result<TempHandle, TempStoreError> {
		let path = self.path_for(identifier);
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::write(&path, &bytes).await?;
		Ok(path)
	}

	async fn read(&self, handle: &Path) -> Result<Bytes, TempStoreError> {
		tokio::fs::read(handle).await.map(Bytes::from).map_err(|source| {
			if source.kind() == std::io::ErrorKind::NotFound {
				TempStoreError::NotFound(handle.to_path_buf())
			} else {
				TempStoreError::Io(source)
			}
		})
	}

	async fn delete(&self, handle: &Path) -> Result<(), TempStoreError> {
		match tokio::fs::remove_file(handle).await {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(TempStoreError::Io(err)),
		}
	}
}

/// Keeps bytes in a process-local map instead of touching disk, per the
/// `temporary-data-storage = "memory"` configuration choice. Handles are
/// synthetic paths (`mem://<identifier>`) used only as map keys.
#[derive(Default)]
pub struct InMemoryTemporaryStore {
	objects: Mutex<HashMap<PathBuf, Bytes>>,
}

#[async_trait]
impl TemporaryStore for InMemoryTemporaryStore {
	async fn write(&self, identifier: &str, bytes: Bytes) -> Result<TempHandle, TempStoreError> {
		let handle = PathBuf::from(format!("mem://{identifier}"));
		self.objects.lock().unwrap().insert(handle.clone(), bytes);
		Ok(handle)
	}

	async fn read(&self, handle: &Path) -> Result<Bytes, TempStoreError> {
		self.objects.lock().unwrap().get(handle).cloned().ok_or_else(|| TempStoreError::NotFound(handle.to_path_buf()))
	}

	async fn delete(&self, handle: &Path) -> Result<(), TempStoreError> {
		self.objects.lock().unwrap().remove(handle);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn local_disk_store_round_trips_bytes() {
		let dir = tempfile::tempdir().unwrap();
		let store = LocalDiskTemporaryStore::new(dir.path().to_path_buf());
		let handle = store.write("1.2.3", Bytes::from_static(b"dicom")).await.unwrap();
		assert_eq!(store.read(&handle).await.unwrap(), Bytes::from_static(b"dicom"));
		store.delete(&handle).await.unwrap();
		assert!(matches!(store.read(&handle).await, Err(TempStoreError::NotFound(_))));
	}

	#[tokio::test]
	async fn in_memory_store_round_trips_bytes() {
		let store = InMemoryTemporaryStore::default();
		let handle = store.write("1.2.3", Bytes::from_static(b"dicom")).await.unwrap();
		assert_eq!(store.read(&handle).await.unwrap(), Bytes::from_static(b"dicom"));
		store.delete(&handle).await.unwrap();
		assert!(matches!(store.read(&handle).await, Err(TempStoreError::NotFound(_))));
	}
}
