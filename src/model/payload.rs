//! Payload assembled by the grouping engine.

use std::time::{Duration, SystemTime};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PayloadState {
	Created,
	Move,
	Notify,
	Published,
	Failed,
}

/// Error returned when a caller attempts a transition the state machine
/// does not allow, e.g. `Notify -> Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot transition payload from {from:?} to {to:?}")]
pub struct InvalidTransition {
	pub from: PayloadState,
	pub to: PayloadState,
}

impl PayloadState {
	/// Whether moving from `self` to `next` is a legal forward transition
	/// (or a no-op failure transition, which is always allowed).
	#[must_use]
	pub fn can_advance_to(self, next: Self) -> bool {
		use PayloadState::{Created, Failed, Move, Notify, Published};
		matches!(
			(self, next),
			(Created, Move)
				| (Move, Notify)
				| (Notify, Published)
				| (Created, Failed)
				| (Move, Failed)
				| (Notify, Failed)
		)
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Payload {
	pub payload_id: Uuid,
	pub key: String,
	pub correlation_id: String,
	pub workflow_instance_id: Option<Uuid>,
	/// References to `FileStorageMetadata::identifier`, immutable after
	/// `Notify`.
	pub files: Vec<String>,
	pub state: PayloadState,
	pub retry_count: u32,
	pub timeout: Duration,
	pub date_created: SystemTime,
	pub machine_name: String,
}

impl Payload {
	#[must_use]
	pub fn new(key: String, correlation_id: String, timeout: Duration, machine_name: String) -> Self {
		Self {
			payload_id: Uuid::new_v4(),
			key,
			correlation_id,
			workflow_instance_id: None,
			files: Vec::new(),
			state: PayloadState::Created,
			retry_count: 0,
			timeout,
			date_created: SystemTime::now(),
			machine_name,
		}
	}

	/// Applies a validated state transition, refusing to mutate `files`
	/// after `Notify` per the assembler's invariant.
	pub fn transition(&mut self, next: PayloadState) -> Result<(), InvalidTransition> {
		if self.state.can_advance_to(next) {
			self.state = next;
			Ok(())
		} else {
			Err(InvalidTransition { from: self.state, to: next })
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn state_machine_follows_the_documented_path() {
		let mut payload = Payload::new(String::from("1.2.3"), String::from("assoc-1"), Duration::from_secs(5), String::from("host"));
		assert_eq!(payload.state, PayloadState::Created);
		payload.transition(PayloadState::Move).unwrap();
		payload.transition(PayloadState::Notify).unwrap();
		payload.transition(PayloadState::Published).unwrap();
		assert_eq!(payload.state, PayloadState::Published);
	}

	#[test]
	fn state_machine_rejects_skipping_stages() {
		let mut payload = Payload::new(String::from("1.2.3"), String::from("assoc-1"), Duration::from_secs(5), String::from("host"));
		assert!(payload.transition(PayloadState::Notify).is_err());
		assert_eq!(payload.state, PayloadState::Created);
	}

	#[test]
	fn any_non_terminal_state_can_fail() {
		let mut payload = Payload::new(String::from("1.2.3"), String::from("assoc-1"), Duration::from_secs(5), String::from("host"));
		payload.transition(PayloadState::Move).unwrap();
		payload.transition(PayloadState::Failed).unwrap();
		assert_eq!(payload.state, PayloadState::Failed);
	}
}
