//! Payload Assembler: coalesces per-instance file metadata
//! into payloads bounded by an inactivity window, publishing a
//! `WorkflowRequest` when a bucket's window closes.
//!
//! A `Mutex`-guarded `HashMap` keyed by the grouping key, with a background
//! task driving state transitions: the payload bucket map is guarded by a
//! single mutex and every read or write of a `Bucket` field takes it.

use crate::bus::MessageBus;
use crate::component::{Component, ComponentStatus, StatusCell};
use crate::config::BusConfig;
use crate::model::file_metadata::FileStorageMetadata;
use crate::model::payload::{Payload, PayloadState};
use crate::repository::{FileMetadataRepository, PayloadRepository};
use crate::retry::retry;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

struct Bucket {
	payload_id: Uuid,
	correlation_id: String,
	files: Vec<String>,
	/// `(identifier)` set already queued, so `Queue` is idempotent per
	/// `(key, metadata.identifier)`.
	seen: std::collections::HashSet<String>,
	deadline: Instant,
	workflows: Vec<String>,
	data_origin_service: String,
	source: String,
	destination: String,
}

/// One object handed to the assembler, carrying just enough context to
/// build the eventual `WorkflowRequestEvent`.
#[derive(Debug, Clone)]
pub struct DataOrigin {
	pub data_service: String,
	pub source: String,
	pub destination: String,
}

#[derive(Debug, Serialize)]
struct FileRef {
	path: String,
	identifier: String,
}

/// The message published to the workflow-request bus topic when a bucket's
/// window closes.
#[derive(Debug, Serialize)]
pub struct WorkflowRequestEvent {
	pub payload_id: Uuid,
	pub bucket: String,
	pub correlation_id: String,
	pub workflows: Vec<String>,
	pub data_trigger: DataTrigger,
	pub files: Vec<FileRef>,
}

#[derive(Debug, Serialize)]
pub struct DataTrigger {
	pub service: String,
	pub source: String,
	pub destination: String,
}

/// Groups incoming file metadata into time-windowed payloads and publishes
/// `WorkflowRequest` events when a window closes.
pub struct PayloadAssembler {
	buckets: Mutex<HashMap<String, Bucket>>,
	payload_repository: Arc<dyn PayloadRepository>,
	file_repository: Arc<dyn FileMetadataRepository>,
	bus: Arc<dyn MessageBus>,
	bus_config: BusConfig,
	object_store_bucket: String,
	tick: Duration,
	retry_delays: Vec<Duration>,
	/// Emits a copy of every payload this assembler publishes, so tests and
	/// other in-process consumers can observe completion without round
	/// tripping through the bus.
	completed: mpsc::UnboundedSender<Payload>,
	status: StatusCell,
}

impl PayloadAssembler {
	#[must_use]
	pub fn new(
		payload_repository: Arc<dyn PayloadRepository>,
		file_repository: Arc<dyn FileMetadataRepository>,
		bus: Arc<dyn MessageBus>,
		bus_config: BusConfig,
		object_store_bucket: String,
		tick: Duration,
		retry_delays: Vec<Duration>,
	) -> (Self, mpsc::UnboundedReceiver<Payload>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(
			Self {
				buckets: Mutex::new(HashMap::new()),
				payload_repository,
				file_repository,
				bus,
				bus_config,
				object_store_bucket,
				tick,
				retry_delays,
				completed: tx,
				status: StatusCell::new(),
			},
			rx,
		)
	}

	/// Queues one object's metadata under `key`, creating a new bucket (and
	/// durable `Payload{state=Created}` row) if none exists yet, or sliding
	/// the existing bucket's deadline forward otherwise. Idempotent per
	/// `(key, metadata.identifier)`.
	#[instrument(skip(self, metadata))]
	pub async fn queue(
		&self,
		key: &str,
		metadata: FileStorageMetadata,
		origin: DataOrigin,
		timeout: Duration,
	) -> Result<Uuid, AssemblerError> {
		let mut buckets = self.buckets.lock().await;
		let correlation_id = metadata.correlation_id.clone();
		let identifier = metadata.identifier.clone();

		if let Some(bucket) = buckets.get_mut(key) {
			bucket.deadline = std::cmp::max(bucket.deadline, Instant::now() + timeout);
			if bucket.seen.insert(identifier) {
				let mut metadata = metadata;
				metadata.payload_id = Some(bucket.payload_id);
				bucket.files.push(metadata.identifier.clone());
				self.file_repository.put(metadata).await?;
			}
			return Ok(bucket.payload_id);
		}

		let payload = Payload::new(key.to_owned(), correlation_id.clone(), timeout, hostname());
		let payload_id = payload.payload_id;
		self.payload_repository.put(payload).await?;

		let mut metadata = metadata;
		metadata.payload_id = Some(payload_id);
		self.file_repository.put(metadata).await?;

		let mut seen = std::collections::HashSet::new();
		seen.insert(identifier.clone());
		buckets.insert(
			key.to_owned(),
			Bucket {
				payload_id,
				correlation_id,
				files: vec![identifier],
				seen,
				deadline: Instant::now() + timeout,
				workflows: Vec::new(),
				data_origin_service: origin.data_service,
				source: origin.source,
				destination: origin.destination,
			},
		);
		Ok(payload_id)
	}

	/// Sets the workflow ids a bucket's eventual event should carry. Called
	/// by the ingestor once it resolves the owning AE's configured
	/// workflows; the assembler itself stays opaque to what the grouping
	/// key means.
	pub async fn set_workflows(&self, key: &str, workflows: Vec<String>) {
		if let Some(bucket) = self.buckets.lock().await.get_mut(key) {
			bucket.workflows = workflows;
		}
	}

	async fn close_expired_buckets(&self) {
		let ready_keys: Vec<String> = {
			let buckets = self.buckets.lock().await;
			let now = Instant::now();
			buckets.iter().filter(|(_, bucket)| bucket.deadline <= now).map(|(key, _)| key.clone()).collect()
		};

		for key in ready_keys {
			if let Err(err) = self.close_bucket(&key).await {
				error!(key, "failed to close payload bucket: {err}");
			}
		}
	}

	/// Drives one bucket through `Move -> Notify -> Published`. Durable
	/// transitions happen before the bucket is removed from the in-memory
	/// map, so a crash between any two steps resumes cleanly on restart via
	/// [`Self::recover`].
	async fn close_bucket(&self, key: &str) -> Result<(), AssemblerError> {
		let (payload_id, correlation_id, files, workflows, data_origin_service, source, destination) = {
			let buckets = self.buckets.lock().await;
			let Some(bucket) = buckets.get(key) else { return Ok(()) };
			(
				bucket.payload_id,
				bucket.correlation_id.clone(),
				bucket.files.clone(),
				bucket.workflows.clone(),
				bucket.data_origin_service.clone(),
				bucket.source.clone(),
				bucket.destination.clone(),
			)
		};

		let mut payload = self.payload_repository.get(payload_id).await?;
		if payload.state == PayloadState::Created {
			payload.transition(PayloadState::Move).map_err(AssemblerError::InvalidTransition)?;
			payload.files = files.clone();
			self.payload_repository.put(payload.clone()).await?;
		}

		if !self.all_uploaded(&files).await? {
			// Leave the bucket in place; the next tick re-checks upload
			// completion without re-extending the deadline.
			return Ok(());
		}

		if self.any_upload_failed(&files).await? {
			payload.transition(PayloadState::Failed).map_err(AssemblerError::InvalidTransition)?;
			self.payload_repository.put(payload).await?;
			self.buckets.lock().await.remove(key);
			warn!(%payload_id, "payload failed: one or more files exhausted their upload retry budget");
			return Ok(());
		}

		payload.transition(PayloadState::Notify).map_err(AssemblerError::InvalidTransition)?;
		self.payload_repository.put(payload.clone()).await?;

		let event = WorkflowRequestEvent {
			payload_id,
			bucket: self.object_store_bucket.clone(),
			correlation_id,
			workflows,
			data_trigger: DataTrigger { service: data_origin_service, source, destination },
			files: files.iter().map(|identifier| FileRef { path: identifier.clone(), identifier: identifier.clone() }).collect(),
		};

		self.publish(event).await?;

		payload.transition(PayloadState::Published).map_err(AssemblerError::InvalidTransition)?;
		self.payload_repository.put(payload.clone()).await?;
		self.buckets.lock().await.remove(key);
		let _ = self.completed.send(payload);
		info!(%payload_id, "published payload");
		Ok(())
	}

	async fn publish(&self, event: WorkflowRequestEvent) -> Result<(), AssemblerError> {
		let body = serde_json::to_vec(&event)?;
		let topic = self.bus_config.workflow_request_topic.clone();
		let bus = Arc::clone(&self.bus);
		retry(&self.retry_delays, "publish-workflow-request", || {
			let bus = Arc::clone(&bus);
			let topic = topic.clone();
			let body = body.clone();
            async move { bus.publish(&topic, body).await }
		})
		.await
		.map_err(AssemblerError::Bus)
	}

	async fn all_uploaded(&self, identifiers: &[String]) -> Result<bool, AssemblerError> {
		for identifier in identifiers {
			let metadata = self.file_repository.get(identifier).await?;
			if !metadata.all_uploaded() {
				return Ok(false);
			}
		}
		Ok(true)
	}

	async fn any_upload_failed(&self, identifiers: &[String]) -> Result<bool, AssemblerError> {
		for identifier in identifiers {
			let metadata = self.file_repository.get(identifier).await?;
			if metadata.upload_failed {
				return Ok(true);
			}
		}
		Ok(false)
	}

	/// Rehydrates in-flight buckets from the durable store on startup:
	/// buckets in `Created`/`Move` are resumed with an already-elapsed
	/// deadline (so the next tick re-evaluates them immediately); a bucket
	/// already in `Notify` is re-attempted, relying on publication being
	/// idempotent by `payloadId`.
	pub async fn recover(&self) -> Result<(), AssemblerError> {
		let open = self.payload_repository.list_open().await?;
		let mut buckets = self.buckets.lock().await;
		for payload in open {
			let files = self.file_repository.list_by_payload(payload.payload_id).await?;
			let origin_service =
				files.first().map(|f| format!("{:?}", f.data_service)).unwrap_or_default();
			let source = files.first().map(|f| f.source.clone()).unwrap_or_default();
			let destination = files.first().map(|f| f.destination.clone()).unwrap_or_default();
			buckets.insert(
				payload.key.clone(),
				Bucket {
					payload_id: payload.payload_id,
					correlation_id: payload.correlation_id.clone(),
					files: payload.files.clone(),
					seen: payload.files.iter().cloned().collect(),
					// Already elapsed: the next tick re-evaluates immediately.
					deadline: Instant::now(),
					workflows: Vec::new(),
					data_origin_service: origin_service,
					source,
					destination,
				},
			);
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl Component for PayloadAssembler {
	fn name(&self) -> &'static str {
		"payload-assembler"
	}

	async fn run(&self, token: CancellationToken) {
		self.status.set(ComponentStatus::Running);
		if let Err(err) = self.recover().await {
			error!("failed to rehydrate in-flight payload buckets: {err}");
		}

		let mut interval = tokio::time::interval(self.tick);
		loop {
			tokio::select! {
				() = token.cancelled() => break,
				_ = interval.tick() => self.close_expired_buckets().await,
			}
		}
		self.status.set(ComponentStatus::Cancelled);
	}

	fn status(&self) -> ComponentStatus {
		self.status.get()
	}
}

fn hostname() -> String {
	std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("informatics-gateway"))
}

#[allow(clippy::ignored_unit_patterns)]
#[derive(Debug, thiserror::Error)]
pub enum AssemblerError {
	#[error(transparent)]
	Repository(#[from] crate::repository::RepositoryError),
	#[error(transparent)]
	InvalidTransition(#[from] crate::model::payload::InvalidTransition),
	#[error(transparent)]
	Bus(crate::bus::BusError),
	#[error(transparent)]
	Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::memory::InMemoryMessageBus;
	use crate::model::file_metadata::{DataService, ObjectIdentity, StoredFile};
	use crate::repository::memory::{InMemoryFileMetadataRepository, InMemoryPayloadRepository};

	fn bus_config() -> BusConfig {
		BusConfig {
			workflow_request_topic: String::from("workflowrequest"),
			export_request_topic: String::from("exportrequest"),
			export_complete_topic: String::from("exportcomplete"),
			nats_url: String::from("nats://localhost:4222"),
		}
	}

	fn metadata(id: &str, uploaded: bool) -> FileStorageMetadata {
		FileStorageMetadata {
			identifier: id.to_owned(),
			correlation_id: String::from("assoc-1"),
			payload_id: None,
			identity: ObjectIdentity::Dicom {
				study_uid: String::from("1.2.3"),
				series_uid: String::from("1.2.3.4"),
				sop_instance_uid: id.to_owned(),
			},
			source: String::from("PACS1"),
			destination: String::from("GATEWAY"),
			data_service: DataService::Dimse,
			workflows: Vec::new(),
			file: StoredFile { uploaded: uploaded.then(|| (String::from("bucket"), id.to_owned())), ..Default::default() },
			json_file: None,
			is_uploaded: uploaded,
			upload_failed: false,
			created_at: SystemTime::UNIX_EPOCH,
		}
	}

	#[tokio::test]
	async fn closes_a_window_and_publishes_once_every_file_is_uploaded() {
		let payload_repo = Arc::new(InMemoryPayloadRepository::default());
		let file_repo = Arc::new(InMemoryFileMetadataRepository::default());
		let bus = Arc::new(InMemoryMessageBus::default());
		let (assembler, mut completed) = PayloadAssembler::new(
			payload_repo,
			file_repo,
			bus.clone(),
			bus_config(),
			String::from("dicom"),
			Duration::from_millis(5),
			vec![],
		);

		let origin = DataOrigin { data_service: String::from("DIMSE"), source: String::from("PACS1"), destination: String::from("GATEWAY") };
		assembler.queue("1.2.3", metadata("sop-1", true), origin.clone(), Duration::from_millis(10)).await.unwrap();
		assembler.queue("1.2.3", metadata("sop-2", true), origin, Duration::from_millis(10)).await.unwrap();

		tokio::time::sleep(Duration::from_millis(20)).await;
		assembler.close_expired_buckets().await;

		let published = completed.try_recv().expect("a payload should have been published");
		assert_eq!(published.state, PayloadState::Published);
		assert_eq!(published.files.len(), 2);
		assert_eq!(bus.published().len(), 1);
	}

	#[tokio::test]
	async fn does_not_close_while_a_file_is_still_pending_upload() {
		let payload_repo = Arc::new(InMemoryPayloadRepository::default());
		let file_repo = Arc::new(InMemoryFileMetadataRepository::default());
		let bus = Arc::new(InMemoryMessageBus::default());
		let (assembler, mut completed) = PayloadAssembler::new(
			payload_repo,
			file_repo,
			bus,
			bus_config(),
			String::from("dicom"),
			Duration::from_millis(5),
			vec![],
		);

		let origin = DataOrigin { data_service: String::from("DIMSE"), source: String::from("PACS1"), destination: String::from("GATEWAY") };
		assembler.queue("1.2.3", metadata("sop-1", false), origin, Duration::from_millis(10)).await.unwrap();

		tokio::time::sleep(Duration::from_millis(20)).await;
		assembler.close_expired_buckets().await;

		assert!(completed.try_recv().is_err());
	}

	#[tokio::test]
	async fn closes_on_a_later_tick_once_the_pending_file_finishes_uploading() {
		let payload_repo = Arc::new(InMemoryPayloadRepository::default());
		let file_repo = Arc::new(InMemoryFileMetadataRepository::default());
		let bus = Arc::new(InMemoryMessageBus::default());
		let (assembler, mut completed) = PayloadAssembler::new(
			Arc::clone(&payload_repo) as Arc<dyn PayloadRepository>,
			Arc::clone(&file_repo) as Arc<dyn FileMetadataRepository>,
			bus.clone(),
			bus_config(),
			String::from("dicom"),
			Duration::from_millis(5),
			vec![],
		);

		let origin = DataOrigin { data_service: String::from("DIMSE"), source: String::from("PACS1"), destination: String::from("GATEWAY") };
		assembler.queue("1.2.3", metadata("sop-1", false), origin, Duration::from_millis(10)).await.unwrap();

		tokio::time::sleep(Duration::from_millis(20)).await;
		assembler.close_expired_buckets().await;
		assert!(completed.try_recv().is_err(), "the bucket must not close while the file is still pending upload");

		file_repo.put(metadata("sop-1", true)).await.unwrap();

		// The deadline has already elapsed, so the very next tick re-evaluates
		// and must now publish without the bucket having been dropped.
		assembler.close_expired_buckets().await;

		let published = completed.try_recv().expect("a payload should have been published once the pending file finished uploading");
		assert_eq!(published.state, PayloadState::Published);
		assert_eq!(published.files.len(), 1);
		assert_eq!(bus.published().len(), 1);
	}

	#[tokio::test]
	async fn queue_is_idempotent_per_key_and_identifier() {
		let payload_repo = Arc::new(InMemoryPayloadRepository::default());
		let file_repo = Arc::new(InMemoryFileMetadataRepository::default());
		let bus = Arc::new(InMemoryMessageBus::default());
		let (assembler, _completed) = PayloadAssembler::new(
			payload_repo,
			file_repo,
			bus,
			bus_config(),
			String::from("dicom"),
			Duration::from_millis(5),
			vec![],
		);

		let origin = DataOrigin { data_service: String::from("DIMSE"), source: String::from("PACS1"), destination: String::from("GATEWAY") };
		let first = assembler.queue("1.2.3", metadata("sop-1", true), origin.clone(), Duration::from_millis(50)).await.unwrap();
		let second = assembler.queue("1.2.3", metadata("sop-1", true), origin, Duration::from_millis(50)).await.unwrap();
		assert_eq!(first, second);

		let buckets = assembler.buckets.lock().await;
		assert_eq!(buckets.get("1.2.3").unwrap().files.len(), 1);
	}

	/// Simulates a crash where only the first of two same-study instances
	/// is queued, then a restart that queues the second. A fresh
	/// `PayloadAssembler` over the same repositories must recover the
	/// still-open bucket and publish a single payload with both files.
	#[tokio::test]
	async fn restarted_assembler_recovers_an_open_bucket_and_publishes_once() {
		let payload_repo = Arc::new(InMemoryPayloadRepository::default());
		let file_repo = Arc::new(InMemoryFileMetadataRepository::default());
		let bus = Arc::new(InMemoryMessageBus::default());
		let origin = DataOrigin { data_service: String::from("DIMSE"), source: String::from("PACS1"), destination: String::from("GATEWAY") };

		let (first_run, _completed) = PayloadAssembler::new(
			Arc::clone(&payload_repo) as Arc<dyn PayloadRepository>,
			Arc::clone(&file_repo) as Arc<dyn FileMetadataRepository>,
			bus.clone(),
			bus_config(),
			String::from("dicom"),
			Duration::from_millis(5),
			vec![],
		);
		let payload_id = first_run.queue("1.2.3", metadata("sop-1", true), origin.clone(), Duration::from_millis(10)).await.unwrap();
		// Process "crashes" here: `first_run` is dropped without ever ticking.

		let (second_run, mut completed) = PayloadAssembler::new(
			payload_repo,
			file_repo,
			bus.clone(),
			bus_config(),
			String::from("dicom"),
			Duration::from_millis(5),
			vec![],
		);
		second_run.recover().await.unwrap();
		let resumed_id = second_run.queue("1.2.3", metadata("sop-2", true), origin, Duration::from_millis(10)).await.unwrap();
		assert_eq!(resumed_id, payload_id, "the recovered bucket must keep its original payloadId");

		tokio::time::sleep(Duration::from_millis(15)).await;
		second_run.close_expired_buckets().await;

		let published = completed.try_recv().expect("a single payload should have been published");
		assert_eq!(published.payload_id, payload_id);
		assert_eq!(published.files.len(), 2);
		assert_eq!(bus.published().len(), 1);
	}
}
