//! DICOM association audit record.

use std::net::IpAddr;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DicomAssociationInfo {
	pub id: Uuid,
	pub correlation_id: String,
	pub calling_aet: String,
	pub called_aet: String,
	pub remote_host: IpAddr,
	pub remote_port: u16,
	pub file_count: u32,
	pub created_at: SystemTime,
	pub disconnected_at: Option<SystemTime>,
	pub duration: Option<Duration>,
	pub errors: Vec<String>,
}

impl DicomAssociationInfo {
	#[must_use]
	pub fn new(calling_aet: String, called_aet: String, remote_host: IpAddr, remote_port: u16) -> Self {
		let id = Uuid::new_v4();
		Self {
			id,
			correlation_id: id.to_string(),
			calling_aet,
			called_aet,
			remote_host,
			remote_port,
			file_count: 0,
			created_at: SystemTime::now(),
			disconnected_at: None,
			duration: None,
			errors: Vec::new(),
		}
	}

	pub fn close(&mut self, now: SystemTime) {
		self.disconnected_at = Some(now);
		self.duration = now.duration_since(self.created_at).ok();
	}
}
