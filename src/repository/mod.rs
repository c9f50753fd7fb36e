//! Data-access traits for the gateway's persisted entities.
//!
//! The concrete database engine is out of scope; these
//! traits are the seam `main.rs` wires a chosen backend behind. Only an
//! in-memory reference implementation ([`memory`]) ships here, suitable for
//! tests and for running the gateway without an external database.

pub mod memory;

use crate::model::ae::{DestinationApplicationEntity, MonaiApplicationEntity, SourceApplicationEntity, VirtualApplicationEntity};
use crate::model::association::DicomAssociationInfo;
use crate::model::export::ExportRequest;
use crate::model::file_metadata::FileStorageMetadata;
use crate::model::inference_request::{InferenceRequest, InferenceRequestStatus};
use crate::model::payload::Payload;
use crate::model::remote_app_execution::RemoteAppExecution;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
	#[error("no {kind} found for key {key:?}")]
	NotFound { kind: &'static str, key: String },
	#[error("{kind} with key {key:?} already exists")]
	Conflict { kind: &'static str, key: String },
}

#[async_trait]
pub trait AeRepository: Send + Sync {
	async fn get_monai_ae(&self, name: &str) -> Result<MonaiApplicationEntity, RepositoryError>;
	async fn list_monai_aes(&self) -> Result<Vec<MonaiApplicationEntity>, RepositoryError>;
	async fn put_monai_ae(&self, ae: MonaiApplicationEntity) -> Result<(), RepositoryError>;
	async fn delete_monai_ae(&self, name: &str) -> Result<(), RepositoryError>;

	async fn get_source_ae(&self, aet: &str) -> Result<SourceApplicationEntity, RepositoryError>;
	async fn list_source_aes(&self) -> Result<Vec<SourceApplicationEntity>, RepositoryError>;
	async fn put_source_ae(&self, ae: SourceApplicationEntity) -> Result<(), RepositoryError>;

	async fn get_destination_ae(&self, name: &str) -> Result<DestinationApplicationEntity, RepositoryError>;
	async fn list_destination_aes(&self) -> Result<Vec<DestinationApplicationEntity>, RepositoryError>;
	async fn put_destination_ae(&self, ae: DestinationApplicationEntity) -> Result<(), RepositoryError>;

	async fn get_virtual_ae(&self, name: &str) -> Result<VirtualApplicationEntity, RepositoryError>;
	async fn put_virtual_ae(&self, ae: VirtualApplicationEntity) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait FileMetadataRepository: Send + Sync {
	async fn get(&self, identifier: &str) -> Result<FileStorageMetadata, RepositoryError>;
	async fn list_pending_uploads(&self) -> Result<Vec<FileStorageMetadata>, RepositoryError>;
	async fn list_by_payload(&self, payload_id: Uuid) -> Result<Vec<FileStorageMetadata>, RepositoryError>;
	async fn put(&self, metadata: FileStorageMetadata) -> Result<(), RepositoryError>;
	async fn delete(&self, identifier: &str) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait PayloadRepository: Send + Sync {
	async fn get(&self, payload_id: Uuid) -> Result<Payload, RepositoryError>;
	async fn get_by_key(&self, key: &str) -> Result<Option<Payload>, RepositoryError>;
	async fn list_open(&self) -> Result<Vec<Payload>, RepositoryError>;
	async fn put(&self, payload: Payload) -> Result<(), RepositoryError>;
	async fn delete(&self, payload_id: Uuid) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait InferenceRequestRepository: Send + Sync {
	async fn get(&self, inference_request_id: &str) -> Result<InferenceRequest, RepositoryError>;
	/// A straight read keyed by the caller-supplied transaction id rather
	/// than the internally assigned `inferenceRequestId`.
	async fn get_by_transaction_id(&self, transaction_id: &str) -> Result<InferenceRequest, RepositoryError>;
	/// Whether a request with this id exists, without fetching the row.
	async fn exists(&self, inference_request_id: &str) -> Result<bool, RepositoryError>;
	/// The terminal status of a completed request, or `Unknown` while still
	/// `Queued`/`InProcess`.
	async fn status(&self, inference_request_id: &str) -> Result<InferenceRequestStatus, RepositoryError>;
	/// Atomically leases the oldest `Queued` request (by `created_at`) by
	/// transitioning it to `InProcess`.
	async fn take_next_queued(&self) -> Result<Option<InferenceRequest>, RepositoryError>;
	async fn put(&self, request: InferenceRequest) -> Result<(), RepositoryError>;
}

/// Polls [`InferenceRequestRepository::take_next_queued`] every 250ms until
/// a request is leased or `token` is cancelled. No in-process consumer
/// drives this today — the request execution engine that would call it is
/// an external collaborator — but it is the blocking counterpart the
/// non-blocking `take_next_queued` is built to support.
pub async fn take_next_queued_blocking(
	repository: &dyn InferenceRequestRepository,
	token: &CancellationToken,
) -> Result<Option<InferenceRequest>, RepositoryError> {
	let mut interval = tokio::time::interval(Duration::from_millis(250));
	loop {
		if let Some(request) = repository.take_next_queued().await? {
			return Ok(Some(request));
		}
		tokio::select! {
			() = token.cancelled() => return Ok(None),
			_ = interval.tick() => {}
		}
	}
}

#[async_trait]
pub trait AssociationRepository: Send + Sync {
	async fn put(&self, association: DicomAssociationInfo) -> Result<(), RepositoryError>;
	async fn get(&self, id: Uuid) -> Result<DicomAssociationInfo, RepositoryError>;
}

/// Stands in for a subscription to the `ExportRequest` topic: a durable
/// FIFO the export service leases from, shaped like
/// [`InferenceRequestRepository::take_next_queued`] but without the
/// `Queued`/`InProcess` state machine — a dequeue is itself the lease.
#[async_trait]
pub trait ExportRequestRepository: Send + Sync {
	async fn enqueue(&self, request: ExportRequest) -> Result<(), RepositoryError>;
	/// Removes and returns the oldest pending request, or `None` if empty.
	async fn take_next(&self) -> Result<Option<ExportRequest>, RepositoryError>;
}

#[async_trait]
pub trait RemoteAppExecutionRepository: Send + Sync {
	async fn put(&self, execution: RemoteAppExecution) -> Result<(), RepositoryError>;
	async fn contains(&self, outgoing_uid: &str) -> Result<bool, RepositoryError>;
	/// Deletes every record whose `request_time` has aged past `ttl`,
	/// standing in for the originating system's TTL index.
	async fn evict_expired(&self, ttl: std::time::Duration) -> Result<usize, RepositoryError>;
}
