//! Per-received-object metadata.

use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

/// Which ingress protocol produced this object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DataService {
	Dimse,
	DicomWeb,
	Fhir,
	Hl7,
	Acr,
}

impl DataService {
	/// The string form carried on `WorkflowRequestEvent.dataTrigger.service`,
	/// stable across the enum's `Debug` representation.
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Dimse => "DIMSE",
			Self::DicomWeb => "DicomWeb",
			Self::Fhir => "Fhir",
			Self::Hl7 => "Hl7",
			Self::Acr => "ACR",
		}
	}
}

/// The protocol-specific identity carried alongside the stable `identifier`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ObjectIdentity {
	Dicom { study_uid: String, series_uid: String, sop_instance_uid: String },
	Fhir { resource_type: String, id: String },
	Hl7 { message_control_id: String },
}

/// A single local or remote copy of the received bytes.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StoredFile {
	pub temporary_path: Option<PathBuf>,
	pub content_type: String,
	/// Set by the upload worker on success: `(bucket, remote_path)`.
	pub uploaded: Option<(String, String)>,
	pub remote_path: Option<String>,
}

impl StoredFile {
	#[must_use]
	pub fn is_uploaded(&self) -> bool {
		self.uploaded.is_some()
	}
}

/// Metadata for one received object, owned by the ingestor, mutated by the
/// upload worker, consumed by the assembler, and deleted once its payload is
/// published and acknowledged.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FileStorageMetadata {
	pub identifier: String,
	pub correlation_id: String,
	pub payload_id: Option<Uuid>,
	pub identity: ObjectIdentity,
	pub source: String,
	pub destination: String,
	pub data_service: DataService,
	pub workflows: Vec<String>,
	pub file: StoredFile,
	pub json_file: Option<StoredFile>,
	pub is_uploaded: bool,
	/// Set once an upload attempt is exhausted terminally; the assembler
	/// treats a bucket containing a failed file as failed rather than
	/// waiting for it to become uploaded.
	pub upload_failed: bool,
	pub created_at: SystemTime,
}

impl FileStorageMetadata {
	/// All files that must reach `is_uploaded` before this metadata's
	/// payload can be published (primary plus optional JSON sidecar).
	#[must_use]
	pub fn all_uploaded(&self) -> bool {
		self.file.is_uploaded() && self.json_file.as_ref().is_none_or(StoredFile::is_uploaded)
	}
}
