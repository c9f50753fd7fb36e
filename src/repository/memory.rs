//! In-memory reference implementations of the [`super`] repository traits,
//! guarded by `std::sync::Mutex`.

use super::{
	AeRepository, AssociationRepository, ExportRequestRepository, FileMetadataRepository, InferenceRequestRepository,
	PayloadRepository, RemoteAppExecutionRepository, RepositoryError,
};
use crate::model::ae::{DestinationApplicationEntity, MonaiApplicationEntity, SourceApplicationEntity, VirtualApplicationEntity};
use crate::model::association::DicomAssociationInfo;
use crate::model::export::ExportRequest;
use crate::model::file_metadata::FileStorageMetadata;
use crate::model::inference_request::{InferenceRequest, InferenceRequestState, InferenceRequestStatus};
use crate::model::payload::{Payload, PayloadState};
use crate::model::remote_app_execution::RemoteAppExecution;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryAeRepository {
	monai: Mutex<HashMap<String, MonaiApplicationEntity>>,
	source: Mutex<HashMap<String, SourceApplicationEntity>>,
	destination: Mutex<HashMap<String, DestinationApplicationEntity>>,
	virtual_ae: Mutex<HashMap<String, VirtualApplicationEntity>>,
}

fn not_found(kind: &'static str, key: &str) -> RepositoryError {
	RepositoryError::NotFound { kind, key: key.to_owned() }
}

#[async_trait]
impl AeRepository for InMemoryAeRepository {
	async fn get_monai_ae(&self, name: &str) -> Result<MonaiApplicationEntity, RepositoryError> {
		self.monai.lock().unwrap().get(name).cloned().ok_or_else(|| not_found("MonaiApplicationEntity", name))
	}

	async fn list_monai_aes(&self) -> Result<Vec<MonaiApplicationEntity>, RepositoryError> {
		Ok(self.monai.lock().unwrap().values().cloned().collect())
	}

	async fn put_monai_ae(&self, ae: MonaiApplicationEntity) -> Result<(), RepositoryError> {
		self.monai.lock().unwrap().insert(ae.base.name.clone(), ae);
		Ok(())
	}

	async fn delete_monai_ae(&self, name: &str) -> Result<(), RepositoryError> {
		self.monai
			.lock()
			.unwrap()
			.remove(name)
			.map(|_| ())
			.ok_or_else(|| not_found("MonaiApplicationEntity", name))
	}

	async fn get_source_ae(&self, aet: &str) -> Result<SourceApplicationEntity, RepositoryError> {
		self.source.lock().unwrap().get(aet).cloned().ok_or_else(|| not_found("SourceApplicationEntity", aet))
	}

	async fn list_source_aes(&self) -> Result<Vec<SourceApplicationEntity>, RepositoryError> {
		Ok(self.source.lock().unwrap().values().cloned().collect())
	}

	async fn put_source_ae(&self, ae: SourceApplicationEntity) -> Result<(), RepositoryError> {
		self.source.lock().unwrap().insert(ae.base.aet.as_str().to_owned(), ae);
		Ok(())
	}

	async fn get_destination_ae(&self, name: &str) -> Result<DestinationApplicationEntity, RepositoryError> {
		self.destination
			.lock()
			.unwrap()
			.get(name)
			.cloned()
			.ok_or_else(|| not_found("DestinationApplicationEntity", name))
	}

	async fn list_destination_aes(&self) -> Result<Vec<DestinationApplicationEntity>, RepositoryError> {
		Ok(self.destination.lock().unwrap().values().cloned().collect())
	}

	async fn put_destination_ae(&self, ae: DestinationApplicationEntity) -> Result<(), RepositoryError> {
		self.destination.lock().unwrap().insert(ae.base.name.clone(), ae);
		Ok(())
	}

	async fn get_virtual_ae(&self, name: &str) -> Result<VirtualApplicationEntity, RepositoryError> {
		self.virtual_ae.lock().unwrap().get(name).cloned().ok_or_else(|| not_found("VirtualApplicationEntity", name))
	}

	async fn put_virtual_ae(&self, ae: VirtualApplicationEntity) -> Result<(), RepositoryError> {
		self.virtual_ae.lock().unwrap().insert(ae.name.clone(), ae);
		Ok(())
	}
}

#[derive(Default)]
pub struct InMemoryFileMetadataRepository {
	files: Mutex<HashMap<String, FileStorageMetadata>>,
}

#[async_trait]
impl FileMetadataRepository for InMemoryFileMetadataRepository {
	async fn get(&self, identifier: &str) -> Result<FileStorageMetadata, RepositoryError> {
		self.files.lock().unwrap().get(identifier).cloned().ok_or_else(|| not_found("FileStorageMetadata", identifier))
	}

	async fn list_pending_uploads(&self) -> Result<Vec<FileStorageMetadata>, RepositoryError> {
		Ok(self.files.lock().unwrap().values().filter(|f| !f.all_uploaded() && !f.upload_failed).cloned().collect())
	}

	async fn list_by_payload(&self, payload_id: Uuid) -> Result<Vec<FileStorageMetadata>, RepositoryError> {
		Ok(self.files.lock().unwrap().values().filter(|f| f.payload_id == Some(payload_id)).cloned().collect())
	}

	async fn put(&self, metadata: FileStorageMetadata) -> Result<(), RepositoryError> {
		self.files.lock().unwrap().insert(metadata.identifier.clone(), metadata);
		Ok(())
	}

	async fn delete(&self, identifier: &str) -> Result<(), RepositoryError> {
		self.files.lock().unwrap().remove(identifier).map(|_| ()).ok_or_else(|| not_found("FileStorageMetadata", identifier))
	}
}

#[derive(Default)]
pub struct InMemoryPayloadRepository {
	payloads: Mutex<HashMap<Uuid, Payload>>,
}

#[async_trait]
impl PayloadRepository for InMemoryPayloadRepository {
	async fn get(&self, payload_id: Uuid) -> Result<Payload, RepositoryError> {
		self.payloads
			.lock()
			.unwrap()
			.get(&payload_id)
			.cloned()
			.ok_or_else(|| not_found("Payload", &payload_id.to_string()))
	}

	async fn get_by_key(&self, key: &str) -> Result<Option<Payload>, RepositoryError> {
		Ok(self.payloads.lock().unwrap().values().find(|p| p.key == key && p.state != PayloadState::Published).cloned())
	}

	async fn list_open(&self) -> Result<Vec<Payload>, RepositoryError> {
		Ok(self
			.payloads
			.lock()
			.unwrap()
			.values()
			.filter(|p| !matches!(p.state, PayloadState::Published | PayloadState::Failed))
			.cloned()
			.collect())
	}

	async fn put(&self, payload: Payload) -> Result<(), RepositoryError> {
		self.payloads.lock().unwrap().insert(payload.payload_id, payload);
		Ok(())
	}

	async fn delete(&self, payload_id: Uuid) -> Result<(), RepositoryError> {
		self.payloads
			.lock()
			.unwrap()
			.remove(&payload_id)
			.map(|_| ())
			.ok_or_else(|| not_found("Payload", &payload_id.to_string()))
	}
}

#[derive(Default)]
pub struct InMemoryInferenceRequestRepository {
	requests: Mutex<HashMap<String, InferenceRequest>>,
}

#[async_trait]
impl InferenceRequestRepository for InMemoryInferenceRequestRepository {
	async fn get(&self, inference_request_id: &str) -> Result<InferenceRequest, RepositoryError> {
		self.requests
			.lock()
			.unwrap()
			.get(inference_request_id)
			.cloned()
			.ok_or_else(|| not_found("InferenceRequest", inference_request_id))
	}

	async fn get_by_transaction_id(&self, transaction_id: &str) -> Result<InferenceRequest, RepositoryError> {
		self.requests
			.lock()
			.unwrap()
			.values()
			.find(|r| r.transaction_id == transaction_id)
			.cloned()
			.ok_or_else(|| not_found("InferenceRequest", transaction_id))
	}

	async fn exists(&self, inference_request_id: &str) -> Result<bool, RepositoryError> {
		Ok(self.requests.lock().unwrap().contains_key(inference_request_id))
	}

	async fn status(&self, inference_request_id: &str) -> Result<InferenceRequestStatus, RepositoryError> {
		self.requests
			.lock()
			.unwrap()
			.get(inference_request_id)
			.map(|r| r.status)
			.ok_or_else(|| not_found("InferenceRequest", inference_request_id))
	}

	async fn take_next_queued(&self) -> Result<Option<InferenceRequest>, RepositoryError> {
		let mut requests = self.requests.lock().unwrap();
		let next_id = requests
			.values()
			.filter(|r| r.state == InferenceRequestState::Queued)
			.min_by_key(|r| r.created_at)
			.map(|r| r.inference_request_id.clone());
		let Some(id) = next_id else { return Ok(None) };
		let request = requests.get_mut(&id).expect("id came from this map");
		request.state = InferenceRequestState::InProcess;
		Ok(Some(request.clone()))
	}

	async fn put(&self, request: InferenceRequest) -> Result<(), RepositoryError> {
		self.requests.lock().unwrap().insert(request.inference_request_id.clone(), request);
		Ok(())
	}
}

#[derive(Default)]
pub struct InMemoryAssociationRepository {
	associations: Mutex<HashMap<Uuid, DicomAssociationInfo>>,
}

#[async_trait]
impl AssociationRepository for InMemoryAssociationRepository {
	async fn put(&self, association: DicomAssociationInfo) -> Result<(), RepositoryError> {
		self.associations.lock().unwrap().insert(association.id, association);
		Ok(())
	}

	async fn get(&self, id: Uuid) -> Result<DicomAssociationInfo, RepositoryError> {
		self.associations.lock().unwrap().get(&id).cloned().ok_or_else(|| not_found("DicomAssociationInfo", &id.to_string()))
	}
}

#[derive(Default)]
pub struct InMemoryExportRequestRepository {
	queue: Mutex<VecDeque<ExportRequest>>,
}

#[async_trait]
impl ExportRequestRepository for InMemoryExportRequestRepository {
	async fn enqueue(&self, request: ExportRequest) -> Result<(), RepositoryError> {
		self.queue.lock().unwrap().push_back(request);
		Ok(())
	}

	async fn take_next(&self) -> Result<Option<ExportRequest>, RepositoryError> {
		Ok(self.queue.lock().unwrap().pop_front())
	}
}

#[derive(Default)]
pub struct InMemoryRemoteAppExecutionRepository {
	executions: Mutex<HashMap<String, RemoteAppExecution>>,
}

#[async_trait]
impl RemoteAppExecutionRepository for InMemoryRemoteAppExecutionRepository {
	async fn put(&self, execution: RemoteAppExecution) -> Result<(), RepositoryError> {
		self.executions.lock().unwrap().insert(execution.outgoing_uid.clone(), execution);
		Ok(())
	}

	async fn contains(&self, outgoing_uid: &str) -> Result<bool, RepositoryError> {
		Ok(self.executions.lock().unwrap().contains_key(outgoing_uid))
	}

	async fn evict_expired(&self, ttl: Duration) -> Result<usize, RepositoryError> {
		let now = SystemTime::now();
		let mut executions = self.executions.lock().unwrap();
		let before = executions.len();
		executions.retain(|_, execution| !execution.is_expired(now, ttl));
		Ok(before - executions.len())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::Priority;

	#[tokio::test]
	async fn take_next_queued_leases_the_oldest_row_first() {
		let repo = InMemoryInferenceRequestRepository::default();
		let now = SystemTime::now();

		let mut newer = InferenceRequest::new(String::from("t1"), String::from("ir-newer"), Priority::Medium);
		newer.created_at = now;
		newer.try_count = 2;
		let mut older = InferenceRequest::new(String::from("t2"), String::from("ir-older"), Priority::Medium);
		older.created_at = now - Duration::from_secs(60);
		older.try_count = 0;

		repo.put(newer).await.unwrap();
		repo.put(older).await.unwrap();

		let leased = repo.take_next_queued().await.unwrap().unwrap();
		assert_eq!(leased.inference_request_id, "ir-older", "the oldest queued row leases first regardless of try_count");
		assert_eq!(leased.state, InferenceRequestState::InProcess);

		let stored = repo.get("ir-older").await.unwrap();
		assert_eq!(stored.state, InferenceRequestState::InProcess);
	}

	#[tokio::test]
	async fn exists_and_status_reflect_the_stored_row() {
		let repo = InMemoryInferenceRequestRepository::default();
		assert!(!repo.exists("ir-1").await.unwrap());
		assert!(repo.status("ir-1").await.is_err());

		let mut request = InferenceRequest::new(String::from("t1"), String::from("ir-1"), Priority::Medium);
		request.apply_result(true, 3);
		repo.put(request).await.unwrap();

		assert!(repo.exists("ir-1").await.unwrap());
		assert_eq!(repo.status("ir-1").await.unwrap(), InferenceRequestStatus::Success);
	}

	#[tokio::test]
	async fn take_next_queued_returns_none_when_empty() {
		let repo = InMemoryInferenceRequestRepository::default();
		assert!(repo.take_next_queued().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn evict_expired_removes_only_aged_records() {
		let repo = InMemoryRemoteAppExecutionRepository::default();
		let now = SystemTime::now();
		repo.put(RemoteAppExecution { outgoing_uid: String::from("fresh"), request_time: now }).await.unwrap();
		repo.put(RemoteAppExecution { outgoing_uid: String::from("stale"), request_time: now - Duration::from_secs(3600) })
			.await
			.unwrap();

		let evicted = repo.evict_expired(Duration::from_secs(60)).await.unwrap();
		assert_eq!(evicted, 1);
		assert!(repo.contains("fresh").await.unwrap());
		assert!(!repo.contains("stale").await.unwrap());
	}

	#[tokio::test]
	async fn export_request_repository_is_fifo() {
		let repo = InMemoryExportRequestRepository::default();
		repo.enqueue(ExportRequest {
			export_task_id: String::from("t1"),
			correlation_id: String::from("c1"),
			files: vec![String::from("f1")],
			destinations: vec![String::from("d1")],
		})
		.await
		.unwrap();
		repo.enqueue(ExportRequest {
			export_task_id: String::from("t2"),
			correlation_id: String::from("c2"),
			files: vec![String::from("f2")],
			destinations: vec![String::from("d1")],
		})
		.await
		.unwrap();

		assert_eq!(repo.take_next().await.unwrap().unwrap().export_task_id, "t1");
		assert_eq!(repo.take_next().await.unwrap().unwrap().export_task_id, "t2");
		assert!(repo.take_next().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn payload_get_by_key_ignores_published_payloads() {
		let repo = InMemoryPayloadRepository::default();
		let mut payload = Payload::new(String::from("1.2.3"), String::from("corr-1"), Duration::from_secs(5), String::from("host"));
		payload.transition(PayloadState::Move).unwrap();
		payload.transition(PayloadState::Notify).unwrap();
		payload.transition(PayloadState::Published).unwrap();
		repo.put(payload).await.unwrap();

		assert!(repo.get_by_key("1.2.3").await.unwrap().is_none());
	}
}
