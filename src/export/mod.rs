//! Export Pipeline: leases queued [`ExportRequest`]s and
//! runs each through a three-stage per-task dataflow — download, output
//! plug-in transform, `sendRemote` — before publishing an
//! `ExportCompleteEvent`.
//!
//! Shaped like [`crate::upload::ObjectUploadQueue`]: a [`Component`] that
//! ticks a durable queue (here, [`crate::repository::ExportRequestRepository`],
//! standing in for a broker subscription) and fans per-item work out through
//! `futures::stream::buffer_unordered`, here with two nested levels — one
//! task at a time admitted past a concurrency gate (a [`Semaphore`] standing
//! in for "prefetch = concurrency"), each task's files then fanned out
//! concurrently within it, since a single `ExportRequest` can itself name
//! many files.
//!
//! The shared state every spawned task needs outlives the tick that spawned
//! it, so it lives behind its own `Arc` ([`Inner`]) rather than requiring an
//! `Arc<Self>` the fixed `Component::run(&self, ..)` signature cannot hand
//! out.
//!
//! `sendRemote` is intentionally left abstract behind [`RemoteSender`]:
//! only the DICOMweb exporter ([`dicomweb::DicomWebSender`]) is fully
//! specified here; other destination kinds (DIMSE C-STORE) are a matter of
//! supplying another [`RemoteSender`] impl.

pub mod dicomweb;

use crate::component::{Component, ComponentStatus, StatusCell};
use crate::model::export::{ExportCompleteEvent, ExportRequest, FileExportResult, FileExportStatus};
use crate::plugin::registry::PluginRegistry;
use crate::plugin::run_output_chain;
use crate::repository::ExportRequestRepository;
use crate::retry::retry;
use crate::storage::object_store::ObjectStore;
use crate::storage::StorageInfoProvider;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// `sendRemote`: sends one already
/// downloaded-and-transformed file to whatever destinations the task
/// names, returning the status to record for that file.
#[async_trait]
pub trait RemoteSender: Send + Sync {
	async fn send(&self, file_path: &str, bytes: Bytes, request: &ExportRequest) -> FileExportResult;
}

struct Inner<R: RemoteSender> {
	export_repository: Arc<dyn ExportRequestRepository>,
	storage_info: Arc<dyn StorageInfoProvider>,
	object_store: Arc<dyn ObjectStore>,
	bucket: String,
	plugin_registry: Arc<PluginRegistry>,
	output_plugins: Vec<String>,
	bus: Arc<dyn crate::bus::MessageBus>,
	export_complete_topic: String,
	remote: Arc<R>,
	concurrency: usize,
	retry_delays: Vec<Duration>,
	/// Process-wide lock over in-flight `exportTaskId`s, standing in for an
	/// in-flight `exportRequests` table guarded during insert/complete — a
	/// `HashSet` plays that table here.
	in_flight: Mutex<HashSet<String>>,
	admission: Arc<Semaphore>,
}

/// Export Pipeline base service, parameterized over the
/// `sendRemote` stage so the DICOMweb exporter (and, eventually, a DIMSE
/// C-STORE one) can share admission, dedup, download, plug-in transform and
/// aggregation.
pub struct ExportService<R: RemoteSender> {
	inner: Arc<Inner<R>>,
	tick: Duration,
	status: StatusCell,
}

impl<R: RemoteSender + 'static> ExportService<R> {
	#[must_use]
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		export_repository: Arc<dyn ExportRequestRepository>,
		storage_info: Arc<dyn StorageInfoProvider>,
		object_store: Arc<dyn ObjectStore>,
		bucket: String,
		plugin_registry: Arc<PluginRegistry>,
		output_plugins: Vec<String>,
		bus: Arc<dyn crate::bus::MessageBus>,
		export_complete_topic: String,
		remote: Arc<R>,
		concurrency: usize,
		retry_delays: Vec<Duration>,
		tick: Duration,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				export_repository,
				storage_info,
				object_store,
				bucket,
				plugin_registry,
				output_plugins,
				bus,
				export_complete_topic,
				remote,
				concurrency,
				retry_delays,
				in_flight: Mutex::new(HashSet::new()),
				admission: Arc::new(Semaphore::new(concurrency)),
			}),
			tick,
			status: StatusCell::new(),
		}
	}

	/// One polling tick: admission, then dedup against in-flight export
	/// tasks, then spawns the per-task dataflow so the next tick is not
	/// blocked on it.
	async fn tick_once(&self) {
		tick_once(&self.inner).await;
	}
}

async fn tick_once<R: RemoteSender + 'static>(inner: &Arc<Inner<R>>) {
	if !inner.storage_info.has_space_to_export() {
		return;
	}
	let Ok(permit) = Arc::clone(&inner.admission).try_acquire_owned() else {
		// At concurrency capacity: leave the request queued for a later
		// tick rather than taking it off the queue now, relying on the
		// broker to requeue it if this process dies before draining it.
		return;
	};

	let request = match inner.export_repository.take_next().await {
		Ok(Some(request)) => request,
		Ok(None) => return,
		Err(err) => {
			error!("failed to take next export request: {err}");
			return;
		}
	};

	{
		let mut in_flight = inner.in_flight.lock().unwrap();
		if !in_flight.insert(request.export_task_id.clone()) {
			warn!(export_task_id = request.export_task_id, "export task already in flight, dropping duplicate");
			return;
		}
	}

	let inner = Arc::clone(inner);
	tokio::spawn(async move {
		run_task(&inner, request).await;
		drop(permit);
	});
}

#[instrument(skip_all, fields(export_task_id = %request.export_task_id))]
async fn run_task<R: RemoteSender + 'static>(inner: &Arc<Inner<R>>, request: ExportRequest) {
	let files = request.files.clone();
	let file_results: Vec<FileExportResult> = stream::iter(files)
		.map(|file_path| {
			let inner = Arc::clone(inner);
			let request = request.clone();
			async move { run_file(&inner, file_path, &request).await }
		})
		.buffer_unordered(inner.concurrency)
		.collect()
		.await;

	let event = ExportCompleteEvent::new(request.export_task_id.clone(), request.correlation_id.clone(), file_results);
	publish_complete(inner, event).await;

	inner.in_flight.lock().unwrap().remove(&request.export_task_id);
}

/// `download` + `plugInTransform` + `sendRemote` for one file. A failure at
/// any stage short-circuits the remaining ones: once a file has failed
/// upstream, later stages pass it through without re-attempting it.
async fn run_file<R: RemoteSender + 'static>(inner: &Arc<Inner<R>>, file_path: String, request: &ExportRequest) -> FileExportResult {
	let object_store = Arc::clone(&inner.object_store);
	let bucket = inner.bucket.clone();
	let key = file_path.clone();
	let bytes = retry(&inner.retry_delays, "export-download", move || {
		let object_store = Arc::clone(&object_store);
		let bucket = bucket.clone();
		let key = key.clone();
		async move { object_store.get(&bucket, &key).await }
	})
	.await;
	let bytes = match bytes {
		Ok(bytes) => bytes,
		Err(err) => {
			warn!(file_path, "export download exhausted its retry budget: {err}");
			return FileExportResult { file_path, status: FileExportStatus::DownloadError, message: Some(err.to_string()) };
		}
	};

	let bytes = match run_output_chain(&inner.output_plugins, &inner.plugin_registry, bytes).await {
		Ok(bytes) => bytes,
		Err(err) => {
			warn!(file_path, "export output plug-in chain failed: {err}");
			return FileExportResult { file_path, status: FileExportStatus::ConfigurationError, message: Some(err.to_string()) };
		}
	};

	inner.remote.send(&file_path, bytes, request).await
}

/// Publishes `ExportComplete` with its own independent retry budget,
/// separate from the download and per-destination send retries.
async fn publish_complete<R: RemoteSender + 'static>(inner: &Arc<Inner<R>>, event: ExportCompleteEvent) {
	let Ok(payload) = serde_json::to_vec(&event) else {
		error!(export_task_id = event.export_task_id, "failed to serialize ExportCompleteEvent");
		return;
	};
	let topic = inner.export_complete_topic.clone();
	let bus = Arc::clone(&inner.bus);
	let result = retry(&inner.retry_delays, "export-complete-publish", move || {
		let bus = Arc::clone(&bus);
		let topic = topic.clone();
		let payload = payload.clone();
		async move { bus.publish(&topic, payload).await }
	})
	.await;
	if let Err(err) = result {
		error!(export_task_id = event.export_task_id, "failed to publish ExportCompleteEvent: {err}");
	} else {
		info!(export_task_id = event.export_task_id, success = event.success, "published ExportCompleteEvent");
	}
}

#[async_trait]
impl<R: RemoteSender + 'static> Component for ExportService<R> {
	fn name(&self) -> &'static str {
		"export-service"
	}

	#[instrument(skip_all, name = "export_service")]
	async fn run(&self, token: CancellationToken) {
		self.status.set(ComponentStatus::Running);
		let mut interval = tokio::time::interval(self.tick);
		loop {
			tokio::select! {
				() = token.cancelled() => break,
				_ = interval.tick() => self.tick_once().await,
			}
		}
		self.status.set(ComponentStatus::Cancelled);
	}

	fn status(&self) -> ComponentStatus {
		self.status.get()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::memory::InMemoryMessageBus;
	use crate::plugin::registry::builtin_registry;
	use crate::repository::memory::InMemoryExportRequestRepository;
	use crate::storage::memory::InMemoryObjectStore;

	struct FixedStorageInfo(bool);
	impl StorageInfoProvider for FixedStorageInfo {
		fn has_space_to_export(&self) -> bool {
			self.0
		}
		fn has_space_to_store(&self) -> bool {
			self.0
		}
	}

	struct RecordingSender {
		status: FileExportStatus,
	}

	#[async_trait]
	impl RemoteSender for RecordingSender {
		async fn send(&self, file_path: &str, _bytes: Bytes, _request: &ExportRequest) -> FileExportResult {
			FileExportResult { file_path: file_path.to_owned(), status: self.status, message: None }
		}
	}

	fn service(
		sender_status: FileExportStatus,
		has_space: bool,
	) -> (ExportService<RecordingSender>, Arc<InMemoryExportRequestRepository>, Arc<InMemoryMessageBus>) {
		let export_repository = Arc::new(InMemoryExportRequestRepository::default());
		let object_store = Arc::new(InMemoryObjectStore::default());
		let bus = Arc::new(InMemoryMessageBus::default());
		let service = ExportService::new(
			export_repository.clone(),
			Arc::new(FixedStorageInfo(has_space)),
			object_store,
			String::from("dicom"),
			Arc::new(builtin_registry()),
			vec![String::from("passthrough")],
			bus.clone(),
			String::from("export.complete"),
			Arc::new(RecordingSender { status: sender_status }),
			4,
			vec![],
			Duration::from_millis(5),
		);
		(service, export_repository, bus)
	}

	#[tokio::test]
	async fn successful_task_publishes_a_success_event() {
		let (service, export_repository, bus) = service(FileExportStatus::Success, true);
		export_repository
			.enqueue(ExportRequest {
				export_task_id: String::from("task-1"),
				correlation_id: String::from("corr-1"),
				files: vec![String::from("f1"), String::from("f2")],
				destinations: vec![String::from("dest-1")],
			})
			.await
			.unwrap();

		service.tick_once().await;
		// run_task is spawned off the tick; give it a moment to finish.
		tokio::time::sleep(Duration::from_millis(50)).await;

		let published = bus.published();
		assert_eq!(published.len(), 1);
		let event: ExportCompleteEvent = serde_json::from_slice(&published[0].1).unwrap();
		assert!(event.success);
		assert_eq!(event.file_results.len(), 2);
	}

	#[tokio::test]
	async fn insufficient_storage_skips_the_tick() {
		let (service, export_repository, bus) = service(FileExportStatus::Success, false);
		export_repository
			.enqueue(ExportRequest {
				export_task_id: String::from("task-1"),
				correlation_id: String::from("corr-1"),
				files: vec![String::from("f1")],
				destinations: vec![],
			})
			.await
			.unwrap();

		service.tick_once().await;
		tokio::time::sleep(Duration::from_millis(20)).await;

		assert!(bus.published().is_empty());
		// The request was never taken off the queue.
		assert!(export_repository.take_next().await.unwrap().is_some());
	}

	#[tokio::test]
	async fn duplicate_export_task_id_is_dropped() {
		let (service, export_repository, bus) = service(FileExportStatus::Success, true);
		export_repository
			.enqueue(ExportRequest {
				export_task_id: String::from("task-1"),
				correlation_id: String::from("corr-1"),
				files: vec![String::from("f1")],
				destinations: vec![],
			})
			.await
			.unwrap();
		service.inner.in_flight.lock().unwrap().insert(String::from("task-1"));

		service.tick_once().await;
		tokio::time::sleep(Duration::from_millis(50)).await;

		assert!(bus.published().is_empty());
	}
}
