//! NATS [`MessageBus`]: publishes the payload via
//! `client.publish(subject, payload)` after the bytes backing it have
//! already landed in the object store.

use super::{BusError, MessageBus};
use async_trait::async_trait;
use bytes::Bytes;

pub struct NatsMessageBus {
	client: async_nats::Client,
}

impl NatsMessageBus {
	#[must_use]
	pub fn new(client: async_nats::Client) -> Self {
		Self { client }
	}

	pub async fn connect(url: &str) -> Result<Self, async_nats::ConnectError> {
		let client = async_nats::connect(url).await?;
		Ok(Self::new(client))
	}
}

#[async_trait]
impl MessageBus for NatsMessageBus {
	async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
		self.client.publish(subject.to_owned(), Bytes::from(payload)).await.map_err(|err| BusError::Publish {
			subject: subject.to_owned(),
			source: err.to_string(),
		})
	}
}
