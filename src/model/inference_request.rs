//! Remote inference job descriptor.

use crate::types::Priority;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InferenceRequestState {
	Queued,
	InProcess,
	Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InferenceRequestStatus {
	Unknown,
	Success,
	Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ResourceKind {
	DicomWeb,
	Dimse,
	Algorithm,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OutputResource {
	pub kind: ResourceKind,
	pub uri: String,
	pub auth: Option<Auth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AuthType {
	None,
	Basic,
	Bearer,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Auth {
	pub auth_type: AuthType,
	pub auth_id: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InferenceRequest {
	pub transaction_id: String,
	pub inference_request_id: String,
	pub priority: Priority,
	pub input_resources: Vec<String>,
	pub output_resources: Vec<OutputResource>,
	pub input_metadata: serde_json::Value,
	pub state: InferenceRequestState,
	pub status: InferenceRequestStatus,
	pub try_count: u32,
	/// When the request was first queued, used to lease the oldest queued
	/// row rather than an arbitrary one.
	pub created_at: SystemTime,
}

impl InferenceRequest {
	#[must_use]
	pub fn new(transaction_id: String, inference_request_id: String, priority: Priority) -> Self {
		Self {
			transaction_id,
			inference_request_id,
			priority,
			input_resources: Vec::new(),
			output_resources: Vec::new(),
			input_metadata: serde_json::Value::Null,
			state: InferenceRequestState::Queued,
			status: InferenceRequestStatus::Unknown,
			try_count: 0,
			created_at: SystemTime::now(),
		}
	}

	/// Applies the result of a lease: on success the request becomes
	/// terminal; on failure it either retries (`Queued`) or exhausts its
	/// budget (`Completed/Fail`).
	///
	/// `retry_cap` is `len(retryDelays)`: a request fails terminally once
	/// `try_count >= retry_cap` after incrementing, rather than strictly
	/// exceeding it — the boundary where `try_count` lands exactly on the
	/// cap is the failing case, not the one after it.
	pub fn apply_result(&mut self, success: bool, retry_cap: usize) {
		if success {
			self.state = InferenceRequestState::Completed;
			self.status = InferenceRequestStatus::Success;
		} else {
			self.try_count += 1;
			if self.try_count as usize >= retry_cap {
				self.state = InferenceRequestState::Completed;
				self.status = InferenceRequestStatus::Fail;
			} else {
				self.state = InferenceRequestState::Queued;
			}
		}
	}

	#[must_use]
	pub fn dicom_web_destinations(&self) -> Vec<&OutputResource> {
		self.output_resources.iter().filter(|r| r.kind == ResourceKind::DicomWeb).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn success_leaves_try_count_untouched() {
		let mut req = InferenceRequest::new(String::from("t1"), String::from("ir1"), Priority::Medium);
		req.state = InferenceRequestState::InProcess;
		req.apply_result(true, 3);
		assert_eq!(req.state, InferenceRequestState::Completed);
		assert_eq!(req.status, InferenceRequestStatus::Success);
		assert_eq!(req.try_count, 0);
	}

	#[test]
	fn failure_one_below_cap_requeues() {
		let mut req = InferenceRequest::new(String::from("t1"), String::from("ir1"), Priority::Medium);
		req.try_count = 1;
		req.apply_result(false, 3);
		assert_eq!(req.try_count, 2);
		assert_eq!(req.state, InferenceRequestState::Queued);
	}

	#[test]
	fn failure_at_cap_fails_terminally() {
		let mut req = InferenceRequest::new(String::from("t1"), String::from("ir1"), Priority::Medium);
		req.try_count = 2;
		req.apply_result(false, 3);
		assert_eq!(req.try_count, 3);
		assert_eq!(req.state, InferenceRequestState::Completed);
		assert_eq!(req.status, InferenceRequestStatus::Fail);
	}
}
