//! Audit record for outbound proxying. The TTL index itself is a store concern; this only carries the
//! predicate a store would filter expired rows by.

use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemoteAppExecution {
	pub outgoing_uid: String,
	pub request_time: SystemTime,
}

impl RemoteAppExecution {
	/// The default retention window for outbound proxy audit rows: one week.
	pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

	#[must_use]
	pub fn is_expired(&self, now: SystemTime, ttl: Duration) -> bool {
		now.duration_since(self.request_time).is_ok_and(|elapsed| elapsed >= ttl)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn not_expired_before_ttl_elapses() {
		let record = RemoteAppExecution { outgoing_uid: String::from("1.2.3"), request_time: SystemTime::now() };
		assert!(!record.is_expired(SystemTime::now(), Duration::from_secs(60)));
	}

	#[test]
	fn expired_once_ttl_elapses() {
		let now = SystemTime::now();
		let record = RemoteAppExecution {
			outgoing_uid: String::from("1.2.3"),
			request_time: now - Duration::from_secs(120),
		};
		assert!(record.is_expired(now, Duration::from_secs(60)));
	}
}
