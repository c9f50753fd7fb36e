//! Layered application configuration.
//!
//! Loaded from an embedded `defaults.toml`, an optional `config.toml` next to
//! the binary, then `IG_`-prefixed environment variables, via the `config`
//! crate. Every configured range is checked once at load time in
//! [`ApplicationConfig::validate`] rather than scattered across call sites.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error(transparent)]
	Load(#[from] config::ConfigError),
	#[error("{field} must be in {min}..={max}, got {actual}")]
	OutOfRange {
		field: &'static str,
		min: i64,
		max: i64,
		actual: i64,
	},
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApplicationConfig {
	#[serde(default)]
	pub logging: LoggingConfig,
	pub dimse: DimseConfig,
	pub dicom_web: DicomWebConfig,
	pub hl7: Hl7Config,
	pub storage: StorageConfig,
	pub database: DatabaseConfig,
	pub bus: BusConfig,
	pub inference: InferenceConfig,
	pub export: ExportConfig,
}

impl ApplicationConfig {
	/// Loads configuration from `defaults.toml`, an optional `config.toml`,
	/// and `IG_`-prefixed environment variables, then validates ranges.
	///
	/// # Errors
	/// Returns a [`ConfigError`] if source collection fails or a configured
	/// value falls outside its valid range.
	pub fn new() -> Result<Self, ConfigError> {
		use config::{Config, Environment, File, FileFormat};
		let raw: Self = Config::builder()
			.add_source(File::from_str(
				include_str!("defaults.toml"),
				FileFormat::Toml,
			))
			.add_source(File::with_name("config.toml").required(false))
			.add_source(Environment::with_prefix("IG").separator("__"))
			.build()?
			.try_deserialize()?;
		raw.validate()?;
		Ok(raw)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		check_range("dimse.max-associations", self.dimse.max_associations as i64, 1, 1000)?;
		check_range(
			"storage.watermark-percent",
			i64::from(self.storage.watermark_percent),
			1,
			100,
		)?;
		check_range(
			"storage.reserve-space-gb",
			i64::from(self.storage.reserve_space_gb),
			1,
			999,
		)?;
		check_range(
			"storage.concurrent-uploads",
			self.storage.concurrent_uploads as i64,
			1,
			128,
		)?;
		check_range(
			"storage.payload-process-threads",
			self.storage.payload_process_threads as i64,
			1,
			128,
		)?;
		check_range(
			"dicom-web.client-timeout-seconds",
			i64::from(self.dicom_web.client_timeout_seconds),
			1,
			i64::from(u32::MAX),
		)?;
		check_range("export.concurrency", self.export.concurrency as i64, 1, 128)?;
		Ok(())
	}
}

fn check_range(field: &'static str, actual: i64, min: i64, max: i64) -> Result<(), ConfigError> {
	if (min..=max).contains(&actual) {
		Ok(())
	} else {
		Err(ConfigError::OutOfRange { field, min, max, actual })
	}
}

/// Returns the process-wide configuration, loading it on first access.
///
/// # Panics
/// Panics if configuration fails to load; this is the one place the gateway
/// treats configuration failure as fatal.
pub fn application_config() -> &'static ApplicationConfig {
	static APP_CONFIG: OnceLock<ApplicationConfig> = OnceLock::new();
	APP_CONFIG.get_or_init(|| {
		ApplicationConfig::new().unwrap_or_else(|e| panic!("failed to load ApplicationConfig: {e}"))
	})
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
	pub level: String,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self { level: String::from("info") }
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DimseConfig {
	pub interface: IpAddr,
	pub port: u16,
	pub aet: String,
	pub max_associations: usize,
	pub verification_service_disabled: bool,
	pub reject_unknown_sources: bool,
	pub uncompressed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DicomWebConfig {
	pub interface: IpAddr,
	pub port: u16,
	pub base_path: String,
	pub client_timeout_seconds: u32,
	pub max_upload_size: usize,
}

impl DicomWebConfig {
	#[must_use]
	pub fn client_timeout(&self) -> Duration {
		Duration::from_secs(u64::from(self.client_timeout_seconds))
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Hl7Config {
	pub interface: IpAddr,
	pub port: u16,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TemporaryDataStorage {
	Memory,
	Disk,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
	pub watermark_percent: u8,
	pub reserve_space_gb: u32,
	pub concurrent_uploads: usize,
	pub payload_process_threads: usize,
	pub temporary_data_storage: TemporaryDataStorage,
	pub local_temporary_storage_path: PathBuf,
	pub bucket_name: String,
	pub temporary_bucket_name: String,
	pub retry_delays_ms: Vec<u64>,
}

impl StorageConfig {
	#[must_use]
	pub fn retry_delays(&self) -> Vec<Duration> {
		self.retry_delays_ms.iter().copied().map(Duration::from_millis).collect()
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseConfig {
	pub retry_delays_ms: Vec<u64>,
}

impl DatabaseConfig {
	#[must_use]
	pub fn retry_delays(&self) -> Vec<Duration> {
		self.retry_delays_ms.iter().copied().map(Duration::from_millis).collect()
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BusConfig {
	pub workflow_request_topic: String,
	pub export_request_topic: String,
	pub export_complete_topic: String,
	pub nats_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InferenceConfig {
	pub retry_delays_ms: Vec<u64>,
}

impl InferenceConfig {
	#[must_use]
	pub fn retry_delays(&self) -> Vec<Duration> {
		self.retry_delays_ms.iter().copied().map(Duration::from_millis).collect()
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExportConfig {
	pub concurrency: usize,
	pub retry_delays_ms: Vec<u64>,
}

impl ExportConfig {
	#[must_use]
	pub fn retry_delays(&self) -> Vec<Duration> {
		self.retry_delays_ms.iter().copied().map(Duration::from_millis).collect()
	}
}
