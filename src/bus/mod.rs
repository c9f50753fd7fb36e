//! Workflow message bus seam: one
//! trait, a NATS implementation ([`nats`], feature `nats`) and an in-memory
//! one ([`memory`]) for tests.

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
	#[error("publish to subject {subject:?} failed: {source}")]
	Publish { subject: String, source: String },
}

/// A topic-addressed at-least-once publish surface. Subscription is not
/// modeled here: every consumer in, export
/// request intake, export complete) either owns the publish side or polls a
/// repository rather than subscribing, so the trait only needs `publish`.
#[async_trait]
pub trait MessageBus: Send + Sync {
	async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;
}
