//! DICOMweb Exporter, the one concrete [`RemoteSender`].
//!
//! Mirrors `api/stow/routes.rs`'s inbound `multipart/related` handling for
//! the outbound STOW-RS POST via `reqwest::multipart`, and uses
//! [`crate::model::inference_request`] for the destination/auth lookup this
//! step is specialized over.

use super::RemoteSender;
use crate::model::export::{ExportRequest, FileExportResult, FileExportStatus};
use crate::model::inference_request::{AuthType, InferenceRequest, OutputResource};
use crate::repository::InferenceRequestRepository;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use dicom::dictionary_std::tags;
use dicom::object::{FileDicomObject, InMemDicomObject};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct DicomWebSender {
	inference_requests: Arc<dyn InferenceRequestRepository>,
	client: Client,
}

impl DicomWebSender {
	#[must_use]
	pub fn new(inference_requests: Arc<dyn InferenceRequestRepository>, client_timeout: Duration) -> Self {
		let client = Client::builder().timeout(client_timeout).build().unwrap_or_default();
		Self { inference_requests, client }
	}

	/// Resolves the owning inference request by `exportTaskId` first,
	/// falling back to the request's correlation id, then selects its
	/// `DicomWeb`-kind output resources.
	async fn resolve_destinations(&self, request: &ExportRequest) -> Result<Vec<OutputResource>, &'static str> {
		let inference_request = self.load_inference_request(request).await.ok_or("no inference request found for export task")?;
		let destinations: Vec<OutputResource> = inference_request.dicom_web_destinations().into_iter().cloned().collect();
		if destinations.is_empty() {
			return Err("inference request has no configured DicomWeb destination");
		}
		Ok(destinations)
	}

	async fn load_inference_request(&self, request: &ExportRequest) -> Option<InferenceRequest> {
		if let Ok(found) = self.inference_requests.get(&request.export_task_id).await {
			return Some(found);
		}
		self.inference_requests.get_by_transaction_id(&request.correlation_id).await.ok()
	}

	async fn send_to(&self, destination: &OutputResource, file_path: &str, bytes: Bytes) -> FileExportStatus {
		let study_instance_uid = study_instance_uid(&bytes).unwrap_or_default();
		let url = format!("{}/studies/{study_instance_uid}", destination.uri.trim_end_matches('/'));

		let part = match reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(file_path.to_owned()).mime_str("application/dicom") {
			Ok(part) => part,
			Err(err) => {
				warn!(file_path, "failed to build STOW-RS multipart part: {err}");
				return FileExportStatus::ServiceError;
			}
		};
		let form = reqwest::multipart::Form::new().part("file", part);
		let request = apply_auth(self.client.post(&url), destination).multipart(form);

		// Only a bare `200 OK` counts as success — a `202 Accepted` partial
		// response is classified as `ServiceError` here, not papered over as
		// a success.
		match request.send().await {
			Ok(response) if response.status() == StatusCode::OK => FileExportStatus::Success,
			Ok(response) => {
				warn!(file_path, url, status = %response.status(), "STOW-RS destination did not return 200 OK");
				FileExportStatus::ServiceError
			}
			Err(err) => {
				warn!(file_path, url, "STOW-RS request failed: {err}");
				FileExportStatus::ServiceError
			}
		}
	}
}

fn apply_auth(builder: RequestBuilder, destination: &OutputResource) -> RequestBuilder {
	let Some(auth) = destination.auth.as_ref() else { return builder };
	match auth.auth_type {
		AuthType::None => builder,
		AuthType::Basic => builder.header(reqwest::header::AUTHORIZATION, format!("Basic {}", auth.auth_id)),
		AuthType::Bearer => builder.bearer_auth(&auth.auth_id),
	}
}

fn study_instance_uid(bytes: &Bytes) -> Option<String> {
	let object = FileDicomObject::<InMemDicomObject>::from_reader(bytes.clone().reader()).ok()?;
	let uid = object.element(tags::STUDY_INSTANCE_UID).ok()?.to_str().ok()?;
	Some(uid.trim_end_matches('\0').to_owned())
}

#[async_trait]
impl RemoteSender for DicomWebSender {
	async fn send(&self, file_path: &str, bytes: Bytes, request: &ExportRequest) -> FileExportResult {
		let destinations = match self.resolve_destinations(request).await {
			Ok(destinations) => destinations,
			Err(message) => {
				warn!(export_task_id = request.export_task_id, message, "DICOMweb export configuration error");
				return FileExportResult {
					file_path: file_path.to_owned(),
					status: FileExportStatus::ConfigurationError,
					message: Some(message.to_owned()),
				};
			}
		};

		let mut status = FileExportStatus::Success;
		let mut message = None;
		for destination in &destinations {
			let result = self.send_to(destination, file_path, bytes.clone()).await;
			if !result.is_success() {
				status = result;
				message = Some(format!("STOW-RS POST to {} did not succeed", destination.uri));
			}
		}
		FileExportResult { file_path: file_path.to_owned(), status, message }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::inference_request::{Auth, ResourceKind};
	use crate::repository::memory::InMemoryInferenceRequestRepository;
	use crate::types::Priority;

	fn export_request(export_task_id: &str, correlation_id: &str) -> ExportRequest {
		ExportRequest {
			export_task_id: export_task_id.to_owned(),
			correlation_id: correlation_id.to_owned(),
			files: vec![String::from("f1")],
			destinations: vec![],
		}
	}

	#[tokio::test]
	async fn missing_inference_request_is_a_configuration_error() {
		let sender = DicomWebSender::new(Arc::new(InMemoryInferenceRequestRepository::default()), Duration::from_secs(1));
		let result = sender.send("f1", Bytes::from_static(b"dicom"), &export_request("task-1", "corr-1")).await;
		assert_eq!(result.status, FileExportStatus::ConfigurationError);
	}

	#[tokio::test]
	async fn inference_request_without_a_dicomweb_destination_is_a_configuration_error() {
		let repository = InMemoryInferenceRequestRepository::default();
		let mut request = InferenceRequest::new(String::from("corr-1"), String::from("task-1"), Priority::Medium);
		request.output_resources.push(OutputResource { kind: ResourceKind::Dimse, uri: String::from("dimse://dest"), auth: None });
		repository.put(request).await.unwrap();

		let sender = DicomWebSender::new(Arc::new(repository), Duration::from_secs(1));
		let result = sender.send("f1", Bytes::from_static(b"dicom"), &export_request("task-1", "corr-1")).await;
		assert_eq!(result.status, FileExportStatus::ConfigurationError);
	}

	#[tokio::test]
	async fn falls_back_to_correlation_id_when_export_task_id_is_unknown() {
		let repository = InMemoryInferenceRequestRepository::default();
		let mut request = InferenceRequest::new(String::from("corr-1"), String::from("inference-id-1"), Priority::Medium);
		request.output_resources.push(OutputResource {
			kind: ResourceKind::DicomWeb,
			uri: String::from("http://127.0.0.1:1/dicomweb"),
			auth: Some(Auth { auth_type: AuthType::Bearer, auth_id: String::from("token") }),
		});
		repository.put(request).await.unwrap();

		let sender = DicomWebSender::new(Arc::new(repository), Duration::from_millis(50));
		// The export task id does not match anything, but the correlation id
		// does — `send` should get past destination resolution and attempt
		// (and fail) the actual HTTP call rather than short-circuiting with
		// `ConfigurationError`.
		let result = sender.send("f1", Bytes::from_static(b"dicom"), &export_request("unknown-task", "corr-1")).await;
		assert_eq!(result.status, FileExportStatus::ServiceError);
	}

	#[test]
	fn bearer_auth_sets_the_authorization_header() {
		let destination =
			OutputResource { kind: ResourceKind::DicomWeb, uri: String::from("http://dest"), auth: Some(Auth { auth_type: AuthType::Bearer, auth_id: String::from("xyz") }) };
		let client = Client::new();
		let request = apply_auth(client.post("http://dest"), &destination).build().unwrap();
		assert_eq!(request.headers().get(reqwest::header::AUTHORIZATION).unwrap(), "Bearer xyz");
	}

	#[test]
	fn no_auth_sets_no_header() {
		let destination = OutputResource { kind: ResourceKind::DicomWeb, uri: String::from("http://dest"), auth: None };
		let client = Client::new();
		let request = apply_auth(client.post("http://dest"), &destination).build().unwrap();
		assert!(request.headers().get(reqwest::header::AUTHORIZATION).is_none());
	}
}
