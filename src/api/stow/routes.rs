//! HTTP router for the Store Transaction
//! <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.5>,
//! generalized to the workflow-scoped path and richer result dataset.
//! Multipart decoding via [`DicomMultipart`], `DicomJson` response encoding,
//! with a per-instance loop into [`IngestPipeline`] — mirroring
//! `backend/dimse/scp.rs`'s `handle_c_store`, the DIMSE side of the same
//! shared pipeline.

use crate::api::stow::service::{FailedInstance, ReferencedInstance, StoreResponse};
use crate::error::{AdmissionError, DimseStatus, GatewayError};
use crate::ingest::{IngestOutcome, IngestPipeline, IngestRequest};
use crate::model::ae::{MonaiApplicationEntity, SopClassFilter};
use crate::model::file_metadata::{DataService, ObjectIdentity};
use crate::repository::AeRepository;
use crate::utils::multipart::DicomMultipart;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Buf;
use dicom::dictionary_std::tags;
use dicom::object::{FileDicomObject, InMemDicomObject};
use dicom_json::DicomJson;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// State the STOW-RS router needs, independent of any admin/QIDO/WADO
/// surface this gateway does not implement.
#[derive(Clone)]
pub struct StowState {
	pub ingest: Arc<IngestPipeline>,
	pub ae_repository: Arc<dyn AeRepository>,
}

pub fn routes() -> Router<StowState> {
	Router::new()
		.route("/studies", post(studies))
		.route("/studies/{study}", post(studies_with_study))
		.route("/{workflow}/studies", post(workflow_studies))
		.route("/{workflow}/studies/{study}", post(workflow_studies_with_study))
}

#[instrument(skip_all)]
async fn studies(State(state): State<StowState>, multipart: DicomMultipart<'static>) -> Response {
	store(state, None, None, multipart).await
}

#[instrument(skip_all)]
async fn studies_with_study(State(state): State<StowState>, Path(study): Path<String>, multipart: DicomMultipart<'static>) -> Response {
	store(state, None, Some(study), multipart).await
}

#[instrument(skip_all)]
async fn workflow_studies(State(state): State<StowState>, Path(workflow): Path<String>, multipart: DicomMultipart<'static>) -> Response {
	store(state, Some(workflow), None, multipart).await
}

#[instrument(skip_all)]
async fn workflow_studies_with_study(
	State(state): State<StowState>,
	Path((workflow, study)): Path<(String, String)>,
	multipart: DicomMultipart<'static>,
) -> Response {
	store(state, Some(workflow), Some(study), multipart).await
}

/// The AE-like configuration a STOW-RS request is admitted under: a
/// `{workflow}` path segment names a `VirtualApplicationEntity`; if absent,
/// the request carries no workflow fan-out and no plug-in chain — this is
/// the only ingress protocol where the workflow binding is optional.
struct WorkflowContext {
	destination: String,
	workflows: Vec<String>,
	plug_in_assemblies: Vec<String>,
}

#[instrument(skip_all, fields(workflow = workflow.as_deref()))]
async fn store(state: StowState, workflow: Option<String>, _study: Option<String>, mut multipart: DicomMultipart<'static>) -> Response {
	let context = match &workflow {
		Some(name) => match state.ae_repository.get_virtual_ae(name).await {
			Ok(ae) => WorkflowContext {
				destination: ae.name,
				workflows: ae.workflows.into_iter().collect(),
				plug_in_assemblies: ae.plug_in_assemblies,
			},
			Err(_) => return (StatusCode::NOT_FOUND, format!("unknown workflow {name:?}")).into_response(),
		},
		None => WorkflowContext { destination: String::from("dicomweb"), workflows: Vec::new(), plug_in_assemblies: Vec::new() },
	};

	let correlation_id = Uuid::new_v4().to_string();
	let mut response = StoreResponse::default();
	let mut index = 0usize;

	loop {
		let field = match multipart.next_field().await {
			Ok(Some(field)) => field,
			Ok(None) => break,
			Err(err) => {
				warn!("failed to read multipart/related stream: {err}");
				return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
			}
		};

		let bytes = match field.bytes().await {
			Ok(bytes) => bytes,
			Err(err) => {
				warn!("failed to read multipart field: {err}");
				return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
			}
		};

		index += 1;
		match FileDicomObject::from_reader(bytes.clone().reader()) {
			Ok(instance) => {
				let outcome = store_instance(&state, &context, &correlation_id, instance, bytes).await;
				match outcome {
					Ok(item) => response.referenced_sequence.push(item),
					Err(item) => response.failed_sequence.push(item),
				}
			}
			Err(err) => {
				warn!(index, "instance {index} is not a parsable DICOM object: {err}");
				response.failed_sequence.push(FailedInstance {
					sop_class_uid: String::new(),
					sop_instance_uid: format!("unknown-{index}"),
					failure_reason: DimseStatus::StorageCannotUnderstand.code(),
				});
			}
		}
	}

	respond(response)
}

/// Runs the same per-instance admission-through-enqueue processing the DIMSE
/// SCP uses, reused verbatim for the DICOMweb ingress rather than
/// re-derived: builds an [`IngestRequest`] and hands it to the same
/// [`IngestPipeline`] the DIMSE SCP calls.
async fn store_instance(
	state: &StowState,
	context: &WorkflowContext,
	correlation_id: &str,
	instance: FileDicomObject<InMemDicomObject>,
	bytes: bytes::Bytes,
) -> Result<ReferencedInstance, FailedInstance> {
	let sop_class_uid = instance.meta().media_storage_sop_class_uid().to_owned();
	let sop_instance_uid = instance.meta().media_storage_sop_instance_uid().to_owned();
	let study_uid = instance
		.element(tags::STUDY_INSTANCE_UID)
		.ok()
		.and_then(|e| e.to_str().ok())
		.map(|s| s.trim_end_matches('\0').to_owned())
		.unwrap_or_default();
	let series_uid = instance
		.element(tags::SERIES_INSTANCE_UID)
		.ok()
		.and_then(|e| e.to_str().ok())
		.map(|s| s.trim_end_matches('\0').to_owned())
		.unwrap_or_default();

	let request = IngestRequest {
		identifier: sop_instance_uid.clone(),
		correlation_id: correlation_id.to_owned(),
		source: String::from("stow-rs"),
		destination: context.destination.clone(),
		data_service: DataService::DicomWeb,
		identity: ObjectIdentity::Dicom { study_uid, series_uid, sop_instance_uid: sop_instance_uid.clone() },
		workflows: context.workflows.clone(),
		// The grouping key for DICOMweb ingestion is the request's own
		// correlation id: every instance in one multipart/related POST is a
		// single bucket.
		grouping_key: correlation_id.to_owned(),
		timeout: Duration::from_secs(u64::from(MonaiApplicationEntity::DEFAULT_TIMEOUT_SECONDS)),
		sop_class_uid: Some(sop_class_uid.clone()),
		sop_class_filter: SopClassFilter::None,
		plug_in_assemblies: context.plug_in_assemblies.clone(),
		content_type: String::from("application/dicom"),
		bytes,
		json_bytes: None,
	};

	match state.ingest.ingest(request).await {
		Ok(IngestOutcome::Stored { .. }) => {
			info!(sop_instance_uid, "stored STOW-RS instance");
			Ok(ReferencedInstance { sop_class_uid, sop_instance_uid, warning_reason: None })
		}
		Ok(IngestOutcome::Filtered) => {
			Ok(ReferencedInstance { sop_class_uid, sop_instance_uid, warning_reason: Some(DimseStatus::SuccessWithWarning.code()) })
		}
		Err(GatewayError::Admission(AdmissionError::InsufficientStorage)) => {
			warn!(sop_instance_uid, "rejected STOW-RS instance: insufficient storage");
			Err(FailedInstance { sop_class_uid, sop_instance_uid, failure_reason: DimseStatus::OutOfResources.code() })
		}
		Err(err) => {
			warn!(sop_instance_uid, "failed to ingest STOW-RS instance: {err}");
			Err(FailedInstance { sop_class_uid, sop_instance_uid, failure_reason: DimseStatus::ProcessingFailure.code() })
		}
	}
}

/// Maps the result dataset onto one of the four status codes:
/// `200` all stored, `202` partial, `204` empty, `409` all failed.
fn respond(response: StoreResponse) -> Response {
	let status = if response.is_empty() {
		StatusCode::NO_CONTENT
	} else if response.failed_sequence.is_empty() {
		StatusCode::OK
	} else if response.referenced_sequence.is_empty() {
		StatusCode::CONFLICT
	} else {
		StatusCode::ACCEPTED
	};

	if status == StatusCode::NO_CONTENT {
		return Response::builder().status(status).body(Body::empty()).expect("building an empty response never fails");
	}

	let json = DicomJson::from(InMemDicomObject::from(response));
	Response::builder()
		.status(status)
		.header(CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
		.body(Body::from(serde_json::to_string(&json).unwrap_or_default()))
		.expect("building a JSON response never fails")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn referenced(sop_instance_uid: &str) -> ReferencedInstance {
		ReferencedInstance { sop_class_uid: String::from("1.2.840.10008.5.1.4.1.1.1"), sop_instance_uid: sop_instance_uid.to_owned(), warning_reason: None }
	}

	fn failed(sop_instance_uid: &str) -> FailedInstance {
		FailedInstance { sop_class_uid: String::new(), sop_instance_uid: sop_instance_uid.to_owned(), failure_reason: DimseStatus::StorageCannotUnderstand.code() }
	}

	/// Three instances posted, the second unreadable.
	#[test]
	fn partial_success_reports_202_accepted() {
		let response = StoreResponse { referenced_sequence: vec![referenced("1.1"), referenced("1.3")], failed_sequence: vec![failed("unknown-2")] };
		assert_eq!(respond(response).status(), StatusCode::ACCEPTED);
	}

	#[test]
	fn every_instance_stored_reports_200_ok() {
		let response = StoreResponse { referenced_sequence: vec![referenced("1.1")], failed_sequence: vec![] };
		assert_eq!(respond(response).status(), StatusCode::OK);
	}

	#[test]
	fn every_instance_failed_reports_409_conflict() {
		let response = StoreResponse { referenced_sequence: vec![], failed_sequence: vec![failed("unknown-1")] };
		assert_eq!(respond(response).status(), StatusCode::CONFLICT);
	}

	#[test]
	fn no_instances_reports_204_no_content() {
		assert_eq!(respond(StoreResponse::default()).status(), StatusCode::NO_CONTENT);
	}
}
