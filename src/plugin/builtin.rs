//! Built-in plug-ins available without any external plugin crate.

use super::{InputPlugin, OutputPlugin, PluginError};
use crate::model::file_metadata::FileStorageMetadata;
use async_trait::async_trait;
use bytes::Bytes;

/// Identity transform, used as the default chain entry and in tests.
pub struct PassthroughInputPlugin;

#[async_trait]
impl InputPlugin for PassthroughInputPlugin {
	async fn execute(&self, bytes: Bytes, metadata: FileStorageMetadata) -> Result<(Bytes, FileStorageMetadata), PluginError> {
		Ok((bytes, metadata))
	}
}

pub struct PassthroughOutputPlugin;

#[async_trait]
impl OutputPlugin for PassthroughOutputPlugin {
	async fn execute(&self, bytes: Bytes) -> Result<Bytes, PluginError> {
		Ok(bytes)
	}
}
