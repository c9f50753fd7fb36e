mod api;
mod assembler;
mod backend;
mod bus;
mod component;
mod config;
mod error;
mod export;
mod hl7;
mod ingest;
mod model;
mod plugin;
mod repository;
mod retry;
mod storage;
mod types;
mod upload;
mod utils;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

use crate::api::stow::StowState;
use crate::api::HttpServer;
use crate::assembler::PayloadAssembler;
use crate::backend::dimse::scp::StorageServiceClassProvider;
use crate::component::Orchestrator;
use crate::export::dicomweb::DicomWebSender;
use crate::export::ExportService;
use crate::hl7::Hl7Listener;
use crate::ingest::IngestPipeline;
use crate::plugin::registry::builtin_registry;
use crate::repository::memory::{
	InMemoryAeRepository, InMemoryAssociationRepository, InMemoryExportRequestRepository, InMemoryFileMetadataRepository,
	InMemoryInferenceRequestRepository, InMemoryPayloadRepository,
};
use crate::repository::InferenceRequestRepository;
use crate::storage::object_store::ObjectStore;
use crate::storage::temp::{InMemoryTemporaryStore, LocalDiskTemporaryStore, TemporaryStore};
use crate::storage::{StorageInfoProvider, SysinfoStorageInfoProvider};
use crate::upload::ObjectUploadQueue;
use tokio_util::sync::CancellationToken;

/// How often the payload assembler sweeps its buckets for expired windows.
/// Not itself one of the config-surfaced ranges.
const ASSEMBLER_TICK: Duration = Duration::from_millis(250);
const UPLOAD_TICK: Duration = Duration::from_millis(250);
const EXPORT_TICK: Duration = Duration::from_millis(250);
/// How long `main` waits for every component to drain in-flight I/O before
/// giving up.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

fn init_logger(level: &str) -> Result<(), anyhow::Error> {
	let log_level: tracing::Level = tracing::Level::from_str(level)?;

	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_file(true)
		.with_line_number(true)
		.with_target(false)
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(log_level).into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

async fn build_object_store(_config: &config::StorageConfig) -> Arc<dyn ObjectStore> {
	#[cfg(feature = "s3")]
	{
		return Arc::new(crate::storage::s3::S3ObjectStore::from_environment().await);
	}
	#[cfg(not(feature = "s3"))]
	{
		Arc::new(crate::storage::memory::InMemoryObjectStore::default())
	}
}

async fn build_message_bus(config: &config::BusConfig) -> Arc<dyn bus::MessageBus> {
	#[cfg(feature = "nats")]
	{
		match crate::bus::nats::NatsMessageBus::connect(&config.nats_url).await {
			Ok(bus) => return Arc::new(bus),
			Err(err) => {
				tracing::warn!(url = %config.nats_url, "failed to connect to NATS, falling back to an in-memory bus: {err}");
			}
		}
	}
	let _ = config;
	Arc::new(crate::bus::memory::InMemoryMessageBus::default())
}

fn build_temporary_store(config: &config::StorageConfig) -> Arc<dyn TemporaryStore> {
	match config.temporary_data_storage {
		config::TemporaryDataStorage::Disk => Arc::new(LocalDiskTemporaryStore::new(config.local_temporary_storage_path.clone())),
		config::TemporaryDataStorage::Memory => Arc::new(InMemoryTemporaryStore::default()),
	}
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
	let config = config::application_config();
	init_logger(&config.logging.level)?;
	debug!("Config: {config:?}");

	// Database engine choice is out of scope: every repository is the
	// in-memory reference implementation.
	let ae_repository = Arc::new(InMemoryAeRepository::default());
	let file_repository = Arc::new(InMemoryFileMetadataRepository::default());
	let payload_repository = Arc::new(InMemoryPayloadRepository::default());
	let inference_repository: Arc<dyn InferenceRequestRepository> = Arc::new(InMemoryInferenceRequestRepository::default());
	let association_repository = Arc::new(InMemoryAssociationRepository::default());
	let export_repository = Arc::new(InMemoryExportRequestRepository::default());

	let storage_info: Arc<dyn StorageInfoProvider> = Arc::new(SysinfoStorageInfoProvider::new(&config.storage));
	let object_store = build_object_store(&config.storage).await;
	let bus = build_message_bus(&config.bus).await;
	let temporary_store = build_temporary_store(&config.storage);
	let plugin_registry = Arc::new(builtin_registry());

	let (assembler, _completed) = PayloadAssembler::new(
		payload_repository,
		Arc::clone(&file_repository),
		Arc::clone(&bus),
		config.bus.clone(),
		config.storage.bucket_name.clone(),
		ASSEMBLER_TICK,
		config.database.retry_delays(),
	);
	let assembler = Arc::new(assembler);

	let upload_queue = Arc::new(ObjectUploadQueue::new(
		Arc::clone(&file_repository),
		Arc::clone(&temporary_store),
		Arc::clone(&object_store),
		config.storage.bucket_name.clone(),
		config.storage.concurrent_uploads,
		config.storage.retry_delays(),
		UPLOAD_TICK,
	));

	let ingest_pipeline = Arc::new(IngestPipeline::new(
		Arc::clone(&storage_info),
		Arc::clone(&plugin_registry),
		Arc::clone(&temporary_store),
		Arc::clone(&upload_queue),
		Arc::clone(&assembler),
	));

	let dicom_web_sender = Arc::new(DicomWebSender::new(Arc::clone(&inference_repository), config.dicom_web.client_timeout()));
	let export_service = Arc::new(ExportService::new(
		export_repository,
		Arc::clone(&storage_info),
		Arc::clone(&object_store),
		config.storage.bucket_name.clone(),
		Arc::clone(&plugin_registry),
		Vec::new(),
		Arc::clone(&bus),
		config.bus.export_complete_topic.clone(),
		dicom_web_sender,
		config.export.concurrency,
		config.export.retry_delays(),
		EXPORT_TICK,
	));

	let dimse_scp = Arc::new(StorageServiceClassProvider::new(
		config.dimse.clone(),
		Arc::clone(&ae_repository),
		association_repository,
		Arc::clone(&ingest_pipeline),
	));

	let hl7_listener = Arc::new(Hl7Listener::new(config.hl7.clone(), Arc::clone(&ingest_pipeline)));

	let http_server = Arc::new(HttpServer::new(config.dicom_web.clone(), StowState { ingest: ingest_pipeline, ae_repository }));

	// Dependency order
	// already live above; start the upload worker and assembler before any
	// ingestor can hand them work, then the ingestors, then the export
	// service. `Orchestrator::stop_all` tears down in the reverse order.
	let token = CancellationToken::new();
	let mut orchestrator = Orchestrator::new(token);
	orchestrator.register(upload_queue);
	orchestrator.register(assembler);
	orchestrator.register(dimse_scp);
	orchestrator.register(hl7_listener);
	orchestrator.register(http_server);
	orchestrator.register(export_service);
	orchestrator.start_all();

	wait_for_shutdown_signal().await;
	info!("shutdown signal received");
	orchestrator.stop_all(SHUTDOWN_GRACE_PERIOD).await;

	Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
	use tokio::signal::unix::{signal, SignalKind};
	let mut sigint = signal(SignalKind::interrupt()).expect("failed to install a SIGINT handler");
	let mut sigterm = signal(SignalKind::terminate()).expect("failed to install a SIGTERM handler");
	tokio::select! {
		_ = sigint.recv() => {}
		_ = sigterm.recv() => {}
	}
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}
