//! Error taxonomy for the gateway: admission / validation / transient /
//! terminal / configuration / protocol.
//!
//! Admission and plug-in paths never use exceptions as control flow: every
//! fallible operation returns one of these enums instead of panicking.
//! `anyhow` is reserved for `main` and component bootstrap.

use thiserror::Error;

/// Why an association or upload was refused before any bytes were accepted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
	#[error("verification service is disabled")]
	VerificationDisabled,
	#[error("calling AE title {calling_aet} at {remote_host} is not a recognized source")]
	CallingAeNotRecognized { calling_aet: String, remote_host: String },
	#[error("called AE title {called_aet} is not a recognized local entity")]
	CalledAeNotRecognized { called_aet: String },
	#[error("maximum concurrent associations ({max}) reached")]
	TooManyAssociations { max: usize },
	#[error("insufficient storage to accept new data")]
	InsufficientStorage,
}

/// Malformed input rejected before persistence.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
	#[error("AE title {0:?} must be 1-16 ASCII characters from [A-Za-z0-9._-]")]
	InvalidAeTitle(String),
	#[error("DICOM tag {0:?} is not a valid `gggg,eeee` grouping tag")]
	InvalidGroupingTag(String),
	#[error("allowedSopClasses and ignoredSopClasses cannot both be non-empty")]
	ConflictingSopClassFilters,
	#[error("name must not be empty")]
	EmptyName,
}

/// A single instance/file failed past its terminal retry budget.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TerminalError {
	#[error("download failed after exhausting retries: {0}")]
	DownloadError(String),
	#[error("remote service rejected the request: {0}")]
	ServiceError(String),
	#[error("upload failed after exhausting retries: {0}")]
	UploadError(String),
}

/// Unresolved configuration referenced at runtime (missing plug-in, missing
/// destination, unknown AE).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
	#[error("no plug-in registered for identifier {0:?}")]
	UnknownPlugin(String),
	#[error("inference request {0} has no configured DicomWeb destination")]
	NoDicomWebDestination(String),
	#[error("inference request {0} could not be found")]
	UnknownInferenceRequest(String),
}

/// DICOM DIMSE status codes the SCP returns to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
	Success,
	SuccessWithWarning,
	ProcessingFailure,
	OutOfResources,
	StorageCannotUnderstand,
}

impl DimseStatus {
	#[must_use]
	pub const fn code(self) -> u16 {
		match self {
			Self::Success => 0x0000,
			Self::SuccessWithWarning => 0xB000,
			Self::ProcessingFailure => 0x0110,
			Self::OutOfResources => 0xA700,
			Self::StorageCannotUnderstand => 0xC000,
		}
	}
}

/// Top-level error returned by ingress/assembler/upload/export operations.
/// Transient I/O errors are not represented here: callers retry those with
/// [`crate::retry::retry`] and only surface the exhausted [`TerminalError`].
#[derive(Debug, Error)]
pub enum GatewayError {
	#[error(transparent)]
	Admission(#[from] AdmissionError),
	#[error(transparent)]
	Validation(#[from] ValidationError),
	#[error(transparent)]
	Terminal(#[from] TerminalError),
	#[error(transparent)]
	Configuration(#[from] ConfigurationError),
	#[error(transparent)]
	Repository(#[from] crate::repository::RepositoryError),
	#[error(transparent)]
	ObjectStore(#[from] crate::storage::object_store::ObjectStoreError),
	#[error(transparent)]
	Bus(#[from] crate::bus::BusError),
	#[error(transparent)]
	Plugin(#[from] crate::plugin::PluginError),
}
