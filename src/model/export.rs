//! Export dataflow messages. Unlike the other
//! entities in this module, `ExportRequest`/`ExportCompleteEvent` are not
//! persisted state the HTTP admin plane owns — they are the bus-shaped
//! messages the export service consumes and produces. A
//! [`crate::repository::ExportRequestRepository`] stands in for the
//! `ExportRequest` topic subscription: the originating
//! system subscribes directly to a broker topic, but this core polls a
//! durable queue instead, the same shape already used for
//! [`crate::model::inference_request::InferenceRequest`] leasing, so the
//! export service needs no bus subscription capability the rest of the
//! gateway does not already have.

/// One instance's outcome within an export task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FileExportStatus {
	Success,
	DownloadError,
	ServiceError,
	ConfigurationError,
}

impl FileExportStatus {
	#[must_use]
	pub const fn is_success(self) -> bool {
		matches!(self, Self::Success)
	}
}

/// A request to export a set of already-uploaded files to one or more
/// destinations.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExportRequest {
	pub export_task_id: String,
	pub correlation_id: String,
	pub files: Vec<String>,
	pub destinations: Vec<String>,
}

/// Per-file result recorded as each stage of the dataflow completes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FileExportResult {
	pub file_path: String,
	pub status: FileExportStatus,
	pub message: Option<String>,
}

/// Published once every file in an `ExportRequest` has a status.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExportCompleteEvent {
	pub export_task_id: String,
	pub correlation_id: String,
	pub success: bool,
	pub file_results: Vec<FileExportResult>,
}

impl ExportCompleteEvent {
	#[must_use]
	pub fn new(export_task_id: String, correlation_id: String, file_results: Vec<FileExportResult>) -> Self {
		let success = !file_results.is_empty() && file_results.iter().all(|r| r.status.is_success());
		Self { export_task_id, correlation_id, success, file_results }
	}
}
