//! In-memory [`MessageBus`] for tests: publishes are appended to a shared
//! log rather than sent anywhere, so tests can assert on what would have
//! gone out.

use super::{BusError, MessageBus};
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryMessageBus {
	published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl InMemoryMessageBus {
	#[must_use]
	pub fn published(&self) -> Vec<(String, Vec<u8>)> {
		self.published.lock().unwrap().clone()
	}
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
	async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
		self.published.lock().unwrap().push((subject.to_owned(), payload));
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn publish_appends_to_the_log() {
		let bus = InMemoryMessageBus::default();
		bus.publish("workflow.request", b"payload".to_vec()).await.unwrap();
		assert_eq!(bus.published(), vec![(String::from("workflow.request"), b"payload".to_vec())]);
	}
}
