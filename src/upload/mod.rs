//! Object-Upload Queue & Worker: drains
//! [`FileMetadataRepository::list_pending_uploads`] through a
//! bounded-concurrency pool of object-store writes, retrying each with
//! [`crate::retry::retry`] and marking the metadata row uploaded or
//! terminally failed.
//!
//! Bounds concurrent object-store calls with
//! `futures::stream::StreamExt::buffer_unordered` rather than a hand-rolled
//! semaphore loop.

use crate::component::{Component, ComponentStatus, StatusCell};
use crate::model::file_metadata::{FileStorageMetadata, StoredFile};
use crate::repository::{FileMetadataRepository, RepositoryError};
use crate::retry::retry;
use crate::storage::object_store::ObjectStore;
use crate::storage::temp::TemporaryStore;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
	#[error(transparent)]
	Repository(#[from] RepositoryError),
	#[error("{identifier}: temporary file missing a local path")]
	MissingTemporaryFile { identifier: String },
	#[error("{identifier}: failed to read temporary object: {source}")]
	Read { identifier: String, source: crate::storage::temp::TempStoreError },
	#[error(transparent)]
	Store(#[from] crate::storage::object_store::ObjectStoreError),
}

/// One unit of work: upload a `FileStorageMetadata`'s primary file (and its
/// optional JSON sidecar) to the object store, then mark it uploaded.
pub struct ObjectUploadQueue {
	file_repository: Arc<dyn FileMetadataRepository>,
	temporary_store: Arc<dyn TemporaryStore>,
	object_store: Arc<dyn ObjectStore>,
	bucket: String,
	concurrency: usize,
	retry_delays: Vec<Duration>,
	tick: Duration,
	status: StatusCell,
	/// Notifies a waiting [`run`] loop that new work may be available,
	/// rather than polling `list_pending_uploads` on a fixed tick alone.
	notify: mpsc::UnboundedSender<()>,
	wake: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
}

impl ObjectUploadQueue {
	#[must_use]
	pub fn new(
		file_repository: Arc<dyn FileMetadataRepository>,
		temporary_store: Arc<dyn TemporaryStore>,
		object_store: Arc<dyn ObjectStore>,
		bucket: String,
		concurrency: usize,
		retry_delays: Vec<Duration>,
		tick: Duration,
	) -> Self {
		let (notify, wake) = mpsc::unbounded_channel();
		Self { file_repository, temporary_store, object_store, bucket, concurrency, retry_delays, tick, status: StatusCell::new(), notify, wake: tokio::sync::Mutex::new(wake) }
	}

	/// Enqueues a freshly-ingested file for upload. The worker picks it up
	/// on its next drain without waiting a full tick.
	pub fn enqueue(&self, _metadata: &FileStorageMetadata) {
		let _ = self.notify.send(());
	}

	async fn drain_once(&self) {
		let pending = match self.file_repository.list_pending_uploads().await {
			Ok(pending) => pending,
			Err(err) => {
				error!("failed to list pending uploads: {err}");
				return;
			}
		};
		if pending.is_empty() {
			return;
		}

		let bucket = self.bucket.clone();
		let results: Vec<(String, Result<(), UploadError>)> = stream::iter(pending)
			.map(|metadata| {
				let object_store = Arc::clone(&self.object_store);
				let temporary_store = Arc::clone(&self.temporary_store);
				let bucket = bucket.clone();
				let delays = self.retry_delays.clone();
				async move {
					let identifier = metadata.identifier.clone();
					let result = upload_one(object_store.as_ref(), temporary_store.as_ref(), &bucket, &delays, metadata).await;
					(identifier, result)
				}
			})
			.buffer_unordered(self.concurrency)
			.collect()
			.await;

		for (identifier, result) in results {
			if let Err(err) = self.apply_result(&identifier, result).await {
				error!(identifier, "failed to persist upload outcome: {err}");
			}
		}
	}

	async fn apply_result(&self, identifier: &str, result: Result<(), UploadError>) -> Result<(), RepositoryError> {
		let mut metadata = self.file_repository.get(identifier).await?;
		match result {
			Ok(()) => {
				metadata.file.uploaded = Some((self.bucket.clone(), identifier.to_owned()));
				if let Some(json_file) = metadata.json_file.as_mut() {
					json_file.uploaded = Some((self.bucket.clone(), json_key(identifier)));
				}
				metadata.is_uploaded = metadata.all_uploaded();
				info!(identifier, "uploaded object");
			}
			Err(err) => {
				warn!(identifier, "upload exhausted its retry budget: {err}");
				metadata.upload_failed = true;
			}
		}
		self.file_repository.put(metadata).await
	}

	/// Deletes every `FileStorageMetadata` row still unuploaded at startup.
	/// A process killed mid-upload leaves temporary files the restarted
	/// worker has no correlation id to recover, so the row is dropped
	/// rather than re-queued blind. Runs once, before the worker begins
	/// draining new work.
	pub async fn evict_stale_pending_on_startup(&self) -> Result<usize, RepositoryError> {
		let pending = self.file_repository.list_pending_uploads().await?;
		let count = pending.len();
		for metadata in pending {
			self.file_repository.delete(&metadata.identifier).await?;
		}
		Ok(count)
	}
}

fn json_key(identifier: &str) -> String {
	format!("{identifier}.json")
}

/// Uploads the optional JSON sidecar first, then the primary file, so a
/// crash between the two leaves `all_uploaded` correctly false rather than
/// a sidecar-less row mistaken for complete.
async fn upload_one(
	object_store: &dyn ObjectStore,
	temporary_store: &dyn TemporaryStore,
	bucket: &str,
	delays: &[Duration],
	metadata: FileStorageMetadata,
) -> Result<(), UploadError> {
	if let Some(json_file) = metadata.json_file.as_ref().filter(|json_file| !json_file.is_uploaded()) {
		upload_stored_file(object_store, temporary_store, bucket, delays, &json_key(&metadata.identifier), json_file).await?;
	}
	upload_stored_file(object_store, temporary_store, bucket, delays, &metadata.identifier, &metadata.file).await
}

async fn upload_stored_file(
	object_store: &dyn ObjectStore,
	temporary_store: &dyn TemporaryStore,
	bucket: &str,
	delays: &[Duration],
	key: &str,
	file: &StoredFile,
) -> Result<(), UploadError> {
	let Some(handle) = file.temporary_path.clone() else {
		return Err(UploadError::MissingTemporaryFile { identifier: key.to_owned() });
	};
	let body = temporary_store.read(&handle).await.map_err(|source| UploadError::Read { identifier: key.to_owned(), source })?;
	retry(delays, "object-upload", || {
		let body = body.clone();
		let key = key.to_owned();
		async move { object_store.put(bucket, &key, body).await }
	})
	.await?;
	Ok(())
}

#[async_trait::async_trait]
impl Component for ObjectUploadQueue {
	fn name(&self) -> &'static str {
		"upload-worker"
	}

	#[instrument(skip_all, name = "upload_worker")]
	async fn run(&self, token: CancellationToken) {
		self.status.set(ComponentStatus::Running);
		if let Ok(evicted) = self.evict_stale_pending_on_startup().await {
			if evicted > 0 {
				warn!(evicted, "dropped stale pending-upload records left over from a prior run");
			}
		}

		let mut interval = tokio::time::interval(self.tick);
		let mut wake = self.wake.lock().await;
		loop {
			tokio::select! {
				() = token.cancelled() => break,
				_ = interval.tick() => self.drain_once().await,
				_ = wake.recv() => self.drain_once().await,
			}
		}
		self.status.set(ComponentStatus::Cancelled);
	}

	fn status(&self) -> ComponentStatus {
		self.status.get()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::file_metadata::{DataService, ObjectIdentity, StoredFile};
	use crate::repository::memory::InMemoryFileMetadataRepository;
	use crate::storage::memory::InMemoryObjectStore;
	use crate::storage::temp::InMemoryTemporaryStore;
	use std::time::SystemTime;

	fn metadata(identifier: &str, path: Option<std::path::PathBuf>) -> FileStorageMetadata {
		FileStorageMetadata {
			identifier: identifier.to_owned(),
			correlation_id: String::from("assoc-1"),
			payload_id: None,
			identity: ObjectIdentity::Dicom {
				study_uid: String::from("1.2.3"),
				series_uid: String::from("1.2.3.4"),
				sop_instance_uid: identifier.to_owned(),
			},
			source: String::from("PACS1"),
			destination: String::from("GATEWAY"),
			data_service: DataService::Dimse,
			workflows: Vec::new(),
			file: StoredFile { temporary_path: path, content_type: String::from("application/dicom"), ..Default::default() },
			json_file: None,
			is_uploaded: false,
			upload_failed: false,
			created_at: SystemTime::now(),
		}
	}

	#[tokio::test]
	async fn uploads_a_pending_file_and_marks_it_uploaded() {
		let temporary_store = Arc::new(InMemoryTemporaryStore::default());
		let handle = temporary_store.write("sop-1", bytes::Bytes::from_static(b"dicom bytes")).await.unwrap();

		let file_repo = Arc::new(InMemoryFileMetadataRepository::default());
		file_repo.put(metadata("sop-1", Some(handle))).await.unwrap();
		let object_store = Arc::new(InMemoryObjectStore::default());

		let queue = ObjectUploadQueue::new(file_repo.clone(), temporary_store, object_store.clone(), String::from("dicom"), 4, vec![], Duration::from_millis(5));
		queue.drain_once().await;

		let stored = file_repo.get("sop-1").await.unwrap();
		assert!(stored.is_uploaded);
		assert!(object_store.get("dicom", "sop-1").await.is_ok());
	}

	#[tokio::test]
	async fn missing_temporary_file_fails_terminally_after_retries_exhaust() {
		let temporary_store = Arc::new(InMemoryTemporaryStore::default());
		let file_repo = Arc::new(InMemoryFileMetadataRepository::default());
		file_repo.put(metadata("sop-2", Some(std::path::PathBuf::from("mem://missing")))).await.unwrap();
		let object_store = Arc::new(InMemoryObjectStore::default());

		let queue = ObjectUploadQueue::new(file_repo.clone(), temporary_store, object_store, String::from("dicom"), 4, vec![], Duration::from_millis(5));
		queue.drain_once().await;

		let stored = file_repo.get("sop-2").await.unwrap();
		assert!(stored.upload_failed);
		assert!(!stored.is_uploaded);
	}

	#[tokio::test]
	async fn uploads_the_json_sidecar_alongside_the_primary_file() {
		let temporary_store = Arc::new(InMemoryTemporaryStore::default());
		let handle = temporary_store.write("sop-4", bytes::Bytes::from_static(b"dicom bytes")).await.unwrap();
		let json_handle = temporary_store.write("sop-4.json", bytes::Bytes::from_static(b"{}")).await.unwrap();

		let mut row = metadata("sop-4", Some(handle));
		row.json_file = Some(StoredFile { temporary_path: Some(json_handle), content_type: String::from("application/dicom+json"), ..Default::default() });

		let file_repo = Arc::new(InMemoryFileMetadataRepository::default());
		file_repo.put(row).await.unwrap();
		let object_store = Arc::new(InMemoryObjectStore::default());

		let queue = ObjectUploadQueue::new(file_repo.clone(), temporary_store, object_store.clone(), String::from("dicom"), 4, vec![], Duration::from_millis(5));
		queue.drain_once().await;

		let stored = file_repo.get("sop-4").await.unwrap();
		assert!(stored.is_uploaded);
		assert!(stored.file.is_uploaded());
		assert!(stored.json_file.as_ref().unwrap().is_uploaded());
		assert!(object_store.get("dicom", "sop-4").await.is_ok());
		assert!(object_store.get("dicom", "sop-4.json").await.is_ok());
	}

	#[tokio::test]
	async fn evict_stale_pending_on_startup_removes_unuploaded_rows() {
		let temporary_store = Arc::new(InMemoryTemporaryStore::default());
		let file_repo = Arc::new(InMemoryFileMetadataRepository::default());
		file_repo.put(metadata("sop-3", None)).await.unwrap();
		let object_store = Arc::new(InMemoryObjectStore::default());
		let queue = ObjectUploadQueue::new(file_repo.clone(), temporary_store, object_store, String::from("dicom"), 4, vec![], Duration::from_millis(5));

		let evicted = queue.evict_stale_pending_on_startup().await.unwrap();
		assert_eq!(evicted, 1);
		assert!(file_repo.get("sop-3").await.is_err());
	}
}
