//! Plug-in chains.
//!
//! Plug-ins are resolved through a compile-time string-keyed table of
//! in-process factories ([`registry`]) rather than a dynamically loaded
//! `.so`/`.dylib` resolved by a fully-qualified class name — `execute` runs
//! in-process, with no FFI boundary between the chain and its caller.

pub mod builtin;
pub mod registry;

use crate::model::file_metadata::FileStorageMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
	#[error("no plug-in registered for identifier {0:?}")]
	UnknownIdentifier(String),
	#[error("plug-in {identifier:?} failed: {message}")]
	ExecutionFailed { identifier: String, message: String },
}

/// One stage of an ingress plug-in chain: `execute(bytes, metadata) ->
/// (bytes', metadata')`.
#[async_trait]
pub trait InputPlugin: Send + Sync {
	async fn execute(&self, bytes: Bytes, metadata: FileStorageMetadata) -> Result<(Bytes, FileStorageMetadata), PluginError>;
}

/// One stage of an export plug-in chain, operating on the bytes of a
/// `ExportRequestDataMessage` instance in flight.
#[async_trait]
pub trait OutputPlugin: Send + Sync {
	async fn execute(&self, bytes: Bytes) -> Result<Bytes, PluginError>;
}

/// Runs an ordered chain of input plug-ins, resolving every identifier
/// before executing any of them — an unresolved identifier is a
/// `ConfigurationError`-shaped failure surfaced to the caller as a whole,
/// rather than failing partway through the chain.
pub async fn run_input_chain(
	identifiers: &[String],
	registry: &registry::PluginRegistry,
	mut bytes: Bytes,
	mut metadata: FileStorageMetadata,
) -> Result<(Bytes, FileStorageMetadata), PluginError> {
	let plugins: Vec<_> =
		identifiers.iter().map(|id| registry.resolve_input(id).ok_or_else(|| PluginError::UnknownIdentifier(id.clone()))).collect::<Result<_, _>>()?;
	for plugin in plugins {
		let (next_bytes, next_metadata) = plugin.execute(bytes, metadata).await?;
		bytes = next_bytes;
		metadata = next_metadata;
	}
	Ok((bytes, metadata))
}

/// Runs an ordered chain of output plug-ins over export bytes, mirroring
/// [`run_input_chain`]'s resolve-then-execute structure.
pub async fn run_output_chain(identifiers: &[String], registry: &registry::PluginRegistry, mut bytes: Bytes) -> Result<Bytes, PluginError> {
	let plugins: Vec<_> = identifiers
		.iter()
		.map(|id| registry.resolve_output(id).ok_or_else(|| PluginError::UnknownIdentifier(id.clone())))
		.collect::<Result<_, _>>()?;
	for plugin in plugins {
		bytes = plugin.execute(bytes).await?;
	}
	Ok(bytes)
}
