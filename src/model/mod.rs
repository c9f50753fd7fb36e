//! Persisted domain entities, owned by the HTTP admin plane,
//! the ingress/assembler path, or the upload worker depending on the type —
//! never shared mutable state, always handed around through the
//! [`crate::repository`] traits.

pub mod ae;
pub mod association;
pub mod export;
pub mod file_metadata;
pub mod inference_request;
pub mod payload;
pub mod remote_app_execution;
