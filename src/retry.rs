//! A small retry helper shared by upload, export and repository call sites.
//!
//! Takes a labelled operation name plus a list of delays, with a structured
//! log on every attempt. Mirrors `storage.retries.retryDelays` /
//! `database.retries.retryDelays` from the configuration.

use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Runs `operation` until it succeeds or `delays` is exhausted, sleeping
/// `delays[attempt]` between attempts. Returns the last error if every
/// attempt failed.
pub async fn retry<T, E, F, Fut>(delays: &[Duration], op_name: &str, mut operation: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: std::fmt::Display,
{
	let mut attempt = 0usize;
	loop {
		match operation().await {
			Ok(value) => return Ok(value),
			Err(err) => {
				if attempt >= delays.len() {
					error!(operation = op_name, attempt, "exhausted retry budget: {err}");
					return Err(err);
				}
				warn!(
					operation = op_name,
					attempt,
					delay_ms = delays[attempt].as_millis(),
					"attempt failed, retrying: {err}"
				);
				tokio::time::sleep(delays[attempt]).await;
				attempt += 1;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[tokio::test]
	async fn succeeds_without_retry() {
		let calls = AtomicUsize::new(0);
		let result: Result<u32, &str> = retry(&[], "noop", || async {
			calls.fetch_add(1, Ordering::SeqCst);
			Ok(42)
		})
		.await;
		assert_eq!(result, Ok(42));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn retries_until_delays_exhausted() {
		let calls = AtomicUsize::new(0);
		let delays = [Duration::from_millis(1), Duration::from_millis(1)];
		let result: Result<u32, &str> = retry(&delays, "flaky", || async {
			let n = calls.fetch_add(1, Ordering::SeqCst);
			if n < 2 {
				Err("not yet")
			} else {
				Ok(7)
			}
		})
		.await;
		assert_eq!(result, Ok(7));
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn returns_last_error_after_exhaustion() {
		let delays = [Duration::from_millis(1)];
		let result: Result<u32, &str> = retry(&delays, "always-fails", || async { Err("boom") }).await;
		assert_eq!(result, Err("boom"));
	}
}
