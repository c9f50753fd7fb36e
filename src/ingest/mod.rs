//! Shared post-admission ingestion path: the
//! steps the DIMSE C-STORE handler and the DICOMweb STOW-RS ingestor both
//! run once a single instance has cleared admission. Pulling it out once
//! avoids the two ingestors duplicating the plug-in chain / temp-write /
//! upload-enqueue / assembler-queue sequence and then drifting apart.

use crate::assembler::{AssemblerError, DataOrigin, PayloadAssembler};
use crate::error::{AdmissionError, GatewayError, TerminalError};
use crate::model::ae::SopClassFilter;
use crate::model::file_metadata::{DataService, FileStorageMetadata, ObjectIdentity, StoredFile};
use crate::plugin::registry::PluginRegistry;
use crate::plugin::run_input_chain;
use crate::storage::temp::TemporaryStore;
use crate::storage::StorageInfoProvider;
use crate::upload::ObjectUploadQueue;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// One object handed to the pipeline, already past SOP-class filtering
/// decisions the caller made with information only it has (e.g. the
/// negotiated presentation context) — the filter itself still runs here so
/// the decision is made in one place per instance.
pub struct IngestRequest {
	/// Stable identifier this object is known by, e.g. a SOP instance UID,
	/// FHIR resource id, or HL7 message control id.
	pub identifier: String,
	pub correlation_id: String,
	pub source: String,
	pub destination: String,
	pub data_service: DataService,
	pub identity: ObjectIdentity,
	pub workflows: Vec<String>,
	/// The assembler's grouping key: the AE's configured DICOM tag value for
	/// DIMSE, or the request's correlation id for DICOMweb.
	pub grouping_key: String,
	pub timeout: Duration,
	/// `None` for non-DICOM data services, which carry no SOP class to
	/// filter on.
	pub sop_class_uid: Option<String>,
	pub sop_class_filter: SopClassFilter,
	pub plug_in_assemblies: Vec<String>,
	pub content_type: String,
	pub bytes: Bytes,
	/// Optional DICOM-JSON sidecar, stored and uploaded alongside the
	/// primary file.
	pub json_bytes: Option<Bytes>,
}

#[derive(Debug)]
pub enum IngestOutcome {
	Stored { identifier: String, payload_id: Uuid },
	/// Filtered out by the AE's `allowedSopClasses`/`ignoredSopClasses`:
	/// the caller reports success without having stored anything.
	Filtered,
}

/// Runs the common tail of ingestion: storage admission, SOP-class
/// filtering, the input plug-in chain, writing bytes to the temporary
/// store, enqueuing the upload, and queuing the assembler bucket.
pub struct IngestPipeline {
	storage_info: Arc<dyn StorageInfoProvider>,
	plugin_registry: Arc<PluginRegistry>,
	temporary_store: Arc<dyn TemporaryStore>,
	upload_queue: Arc<ObjectUploadQueue>,
	assembler: Arc<PayloadAssembler>,
}

impl IngestPipeline {
	#[must_use]
	pub fn new(
		storage_info: Arc<dyn StorageInfoProvider>,
		plugin_registry: Arc<PluginRegistry>,
		temporary_store: Arc<dyn TemporaryStore>,
		upload_queue: Arc<ObjectUploadQueue>,
		assembler: Arc<PayloadAssembler>,
	) -> Self {
		Self { storage_info, plugin_registry, temporary_store, upload_queue, assembler }
	}

	pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome, GatewayError> {
		if !self.storage_info.has_space_to_store() {
			return Err(AdmissionError::InsufficientStorage.into());
		}

		if let Some(sop_class_uid) = &request.sop_class_uid {
			if !request.sop_class_filter.admits(sop_class_uid) {
				return Ok(IngestOutcome::Filtered);
			}
		}

		let metadata = FileStorageMetadata {
			identifier: request.identifier.clone(),
			correlation_id: request.correlation_id.clone(),
			payload_id: None,
			identity: request.identity,
			source: request.source.clone(),
			destination: request.destination.clone(),
			data_service: request.data_service,
			workflows: request.workflows.clone(),
			file: StoredFile { content_type: request.content_type, ..Default::default() },
			json_file: None,
			is_uploaded: false,
			upload_failed: false,
			created_at: SystemTime::now(),
		};

		let (bytes, mut metadata) =
			run_input_chain(&request.plug_in_assemblies, &self.plugin_registry, request.bytes, metadata).await?;

		let handle = self
			.temporary_store
			.write(&metadata.identifier, bytes)
			.await
			.map_err(|source| TerminalError::UploadError(source.to_string()))?;
		metadata.file.temporary_path = Some(handle);

		if let Some(json_bytes) = request.json_bytes {
			let json_identifier = format!("{}.json", metadata.identifier);
			let json_handle = self
				.temporary_store
				.write(&json_identifier, json_bytes)
				.await
				.map_err(|source| TerminalError::UploadError(source.to_string()))?;
			metadata.json_file =
				Some(StoredFile { temporary_path: Some(json_handle), content_type: String::from("application/dicom+json"), ..Default::default() });
		}

		let origin = DataOrigin {
			data_service: request.data_service.as_str().to_owned(),
			source: request.source,
			destination: request.destination,
		};

		let payload_id = self
			.assembler
			.queue(&request.grouping_key, metadata.clone(), origin, request.timeout)
			.await
			.map_err(map_assembler_error)?;
		self.upload_queue.enqueue(&metadata);

		if !request.workflows.is_empty() {
			self.assembler.set_workflows(&request.grouping_key, request.workflows).await;
		}

		Ok(IngestOutcome::Stored { identifier: request.identifier, payload_id })
	}
}

fn map_assembler_error(err: AssemblerError) -> GatewayError {
	match err {
		AssemblerError::Repository(e) => GatewayError::Repository(e),
		AssemblerError::Bus(e) => GatewayError::Bus(e),
		AssemblerError::InvalidTransition(_) | AssemblerError::Serialize(_) => {
			GatewayError::Terminal(TerminalError::UploadError(err.to_string()))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::memory::InMemoryMessageBus;
	use crate::config::BusConfig;
	use crate::model::ae::SopClassFilter;
	use crate::plugin::registry::builtin_registry;
	use crate::repository::memory::{InMemoryFileMetadataRepository, InMemoryPayloadRepository};
	use crate::storage::memory::InMemoryObjectStore;
	use crate::storage::temp::InMemoryTemporaryStore;
	use std::collections::HashSet;

	struct AlwaysHasSpace;
	impl StorageInfoProvider for AlwaysHasSpace {
		fn has_space_to_store(&self) -> bool {
			true
		}
	}

	struct NeverHasSpace;
	impl StorageInfoProvider for NeverHasSpace {
		fn has_space_to_store(&self) -> bool {
			false
		}
	}

	fn bus_config() -> BusConfig {
		BusConfig {
			workflow_request_topic: String::from("workflowrequest"),
			export_request_topic: String::from("exportrequest"),
			export_complete_topic: String::from("exportcomplete"),
			nats_url: String::from("nats://localhost:4222"),
		}
	}

	fn pipeline(storage_info: Arc<dyn StorageInfoProvider>) -> IngestPipeline {
		let (assembler, _completed) = PayloadAssembler::new(
			Arc::new(InMemoryPayloadRepository::default()),
			Arc::new(InMemoryFileMetadataRepository::default()),
			Arc::new(InMemoryMessageBus::default()),
			bus_config(),
			String::from("dicom"),
			Duration::from_millis(10),
			vec![],
		);
		let upload_queue = ObjectUploadQueue::new(
			Arc::new(InMemoryFileMetadataRepository::default()),
			Arc::new(InMemoryTemporaryStore::default()),
			Arc::new(InMemoryObjectStore::default()),
			String::from("dicom"),
			4,
			vec![],
			Duration::from_millis(10),
		);
		IngestPipeline::new(
			storage_info,
			Arc::new(builtin_registry()),
			Arc::new(InMemoryTemporaryStore::default()),
			Arc::new(upload_queue),
			Arc::new(assembler),
		)
	}

	fn request(identifier: &str, sop_class_uid: Option<&str>, filter: SopClassFilter) -> IngestRequest {
		IngestRequest {
			identifier: identifier.to_owned(),
			correlation_id: String::from("assoc-1"),
			source: String::from("PACS1"),
			destination: String::from("GATEWAY"),
			data_service: DataService::Dimse,
			identity: ObjectIdentity::Dicom {
				study_uid: String::from("1.2.3"),
				series_uid: String::from("1.2.3.4"),
				sop_instance_uid: identifier.to_owned(),
			},
			workflows: vec![String::from("wf-1")],
			grouping_key: String::from("1.2.3"),
			timeout: Duration::from_millis(20),
			sop_class_uid: sop_class_uid.map(str::to_owned),
			sop_class_filter: filter,
			plug_in_assemblies: vec![String::from("passthrough")],
			content_type: String::from("application/dicom"),
			bytes: Bytes::from_static(b"dicom bytes"),
			json_bytes: None,
		}
	}

	#[tokio::test]
	async fn insufficient_storage_is_rejected_before_anything_is_persisted() {
		let pipeline = pipeline(Arc::new(NeverHasSpace));
		let err = pipeline.ingest(request("sop-1", None, SopClassFilter::None)).await.unwrap_err();
		assert!(matches!(err, GatewayError::Admission(AdmissionError::InsufficientStorage)));
	}

	#[tokio::test]
	async fn ignored_sop_class_is_filtered_without_storing() {
		let filter = SopClassFilter::new(HashSet::new(), HashSet::from([String::from("1.2.840.10008.5.1.4.1.1.1.1")])).unwrap();
		let pipeline = pipeline(Arc::new(AlwaysHasSpace));
		let outcome = pipeline.ingest(request("sop-1", Some("1.2.840.10008.5.1.4.1.1.1.1"), filter)).await.unwrap();
		assert!(matches!(outcome, IngestOutcome::Filtered));
	}

	#[tokio::test]
	async fn admitted_instance_is_stored_and_queued() {
		let pipeline = pipeline(Arc::new(AlwaysHasSpace));
		let outcome = pipeline.ingest(request("sop-1", Some("1.2.840.10008.5.1.4.1.1.1"), SopClassFilter::None)).await.unwrap();
		assert!(matches!(outcome, IngestOutcome::Stored { .. }));
	}
}
