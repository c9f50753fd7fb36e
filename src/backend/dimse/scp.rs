//! Storage Service Class Provider: accepts DICOM
//! associations, answers C-ECHO, and routes C-STORE instances into the
//! shared [`crate::ingest`] pipeline.
//!
//! Accept loop over a `TcpListener`, one `ServerAssociation` per connection,
//! reading `DicomMessage`s in a loop, with the admission policy and
//! ingestion path run per received instance. Because `ServerAssociation::new`
//! establishes in `dicom::ul`'s promiscuous mode (no PDU-level accept/reject
//! hook is exposed), calling/called-AE admission runs immediately after
//! `establish` returns rather than during PDU negotiation, aborting the
//! freshly-opened association on rejection.

use crate::backend::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use crate::backend::dimse::association::Association;
use crate::backend::dimse::cecho::{CompositeEchoResponse, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST};
use crate::backend::dimse::cstore::{CompositeStoreResponse, COMMAND_FIELD_COMPOSITE_STORE_REQUEST};
use crate::backend::dimse::{next_message_id, DicomMessageReader, DicomMessageWriter};
use crate::component::{Component, ComponentStatus, StatusCell};
use crate::config::DimseConfig;
use crate::error::{AdmissionError, DimseStatus, GatewayError};
use crate::ingest::{IngestOutcome, IngestPipeline, IngestRequest};
use crate::model::ae::{GroupingTag, MonaiApplicationEntity};
use crate::model::association::DicomAssociationInfo;
use crate::repository::{AeRepository, AssociationRepository};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// How long a connection handler waits for the next DIMSE message before
/// re-checking for shutdown. Not configurable (only an association-level
/// idle policy is named, not a concrete bound), so a generous fixed value
/// is used instead of blocking forever.
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StorageServiceClassProvider {
	config: DimseConfig,
	ae_repository: Arc<dyn AeRepository>,
	association_repository: Arc<dyn AssociationRepository>,
	ingest: Arc<IngestPipeline>,
	active_associations: Arc<AtomicUsize>,
	status: StatusCell,
}

impl StorageServiceClassProvider {
	#[must_use]
	pub fn new(
		config: DimseConfig,
		ae_repository: Arc<dyn AeRepository>,
		association_repository: Arc<dyn AssociationRepository>,
		ingest: Arc<IngestPipeline>,
	) -> Self {
		Self {
			config,
			ae_repository,
			association_repository,
			ingest,
			active_associations: Arc::new(AtomicUsize::new(0)),
			status: StatusCell::new(),
		}
	}
}

#[async_trait::async_trait]
impl Component for StorageServiceClassProvider {
	fn name(&self) -> &'static str {
		"dimse-scp"
	}

	async fn run(&self, token: CancellationToken) {
		self.status.set(ComponentStatus::Running);
		let address = std::net::SocketAddr::from((self.config.interface, self.config.port));
		let listener = match TcpListener::bind(address).await {
			Ok(listener) => listener,
			Err(err) => {
				error!(%address, "failed to bind DIMSE SCP listener: {err}");
				self.status.set(ComponentStatus::Cancelled);
				return;
			}
		};
		info!(%address, aet = self.config.aet, "DIMSE SCP listening");

		loop {
			tokio::select! {
				() = token.cancelled() => break,
				accepted = listener.accept() => {
					let Ok((stream, peer)) = accepted else {
						error!("failed to accept incoming DIMSE connection");
						continue;
					};

					// Reserve a slot before spawning, not after: checking
					// `active_associations` here and incrementing it only once the
					// task runs would let more than `max_associations` connections
					// past the check concurrently.
					let reserved = self.active_associations.fetch_add(1, Ordering::SeqCst) + 1;
					if reserved > self.config.max_associations {
						self.active_associations.fetch_sub(1, Ordering::SeqCst);
						warn!(%peer, max = self.config.max_associations, "rejecting association: at capacity");
						drop(stream);
						continue;
					}

					let this = self.clone_for_connection();
					let token = token.clone();
					tokio::spawn(async move { this.handle_connection(stream, token).await });
				}
			}
		}

		self.status.set(ComponentStatus::Cancelled);
	}

	fn status(&self) -> ComponentStatus {
		self.status.get()
	}
}

/// Per-connection handle, cheaply cloned into each spawned task.
struct ConnectionHandler {
	config: DimseConfig,
	ae_repository: Arc<dyn AeRepository>,
	association_repository: Arc<dyn AssociationRepository>,
	ingest: Arc<IngestPipeline>,
	active_associations: Arc<AtomicUsize>,
}

impl StorageServiceClassProvider {
	fn clone_for_connection(&self) -> ConnectionHandler {
		ConnectionHandler {
			config: self.config.clone(),
			ae_repository: Arc::clone(&self.ae_repository),
			association_repository: Arc::clone(&self.association_repository),
			ingest: Arc::clone(&self.ingest),
			active_associations: Arc::clone(&self.active_associations),
		}
	}
}

impl ConnectionHandler {
	#[instrument(skip_all, fields(peer = %peer))]
	async fn handle_connection(self, stream: tokio::net::TcpStream, token: CancellationToken) {
		if let Err(err) = self.drive_association(stream, token).await {
			warn!("association ended with an error: {err}");
		}
		self.active_associations.fetch_sub(1, Ordering::SeqCst);
	}

	async fn drive_association(&self, stream: tokio::net::TcpStream, token: CancellationToken) -> anyhow::Result<()> {
		let peer = stream.peer_addr()?;
		let tcp_stream = stream.into_std()?;
		tcp_stream.set_nonblocking(false)?;

		let association = ServerAssociation::new(ServerAssociationOptions {
			aet: self.config.aet.clone(),
			tcp_stream,
			uncompressed: self.config.uncompressed,
		})
		.await?;

		let calling_aet = association.calling_aet().to_owned();
		let called_aet = self.config.aet.clone();

		let mut record = DicomAssociationInfo::new(calling_aet.clone(), called_aet.clone(), peer.ip(), peer.port());

		let monai_ae = match self.check_admission(&calling_aet, &called_aet, peer.ip()).await {
			Ok(ae) => ae,
			Err(reason) => {
				record.errors.push(reason.to_string());
				record.close(SystemTime::now());
				let _ = self.association_repository.put(record).await;
				info!(calling_aet, called_aet, "rejected association: {reason}");
				return Ok(());
			}
		};

		self.association_repository.put(record.clone()).await.ok();

		loop {
			if token.is_cancelled() {
				break;
			}
			let message = match association.read_message(IDLE_READ_TIMEOUT).await {
				Ok(message) => message,
				Err(err) => {
					record.errors.push(err.to_string());
					break;
				}
			};

			let command_field = message
				.command
				.get(tags::COMMAND_FIELD)
				.map(InMemElement::to_int::<crate::types::US>)
				.and_then(Result::ok);

			match command_field {
				Some(COMMAND_FIELD_COMPOSITE_ECHO_REQUEST) => {
					if self.config.verification_service_disabled {
						record.errors.push(AdmissionError::VerificationDisabled.to_string());
						break;
					}
					let message_id = message
						.command
						.get(tags::MESSAGE_ID)
						.map(InMemElement::to_int::<crate::types::US>)
						.and_then(Result::ok)
						.unwrap_or_else(next_message_id);
					let response = CompositeEchoResponse { message_id, status: DimseStatus::Success.code() };
					if let Err(err) = association.write_message(response, message.presentation_context_id, WRITE_TIMEOUT).await {
						record.errors.push(err.to_string());
						break;
					}
				}
				Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) => {
					let outcome = self.handle_c_store(&monai_ae, &calling_aet, &called_aet, &record.correlation_id, message).await;
					match outcome {
						Ok((response, ())) => {
							record.file_count += 1;
							if let Err(err) = association.write_message(response, None, WRITE_TIMEOUT).await {
								record.errors.push(err.to_string());
								break;
							}
						}
						Err((response, message)) => {
							record.errors.push(message);
							if let Err(err) = association.write_message(response, None, WRITE_TIMEOUT).await {
								record.errors.push(err.to_string());
								break;
							}
						}
					}
				}
				other => {
					warn!(?other, "ignoring unsupported DIMSE command field");
				}
			}
		}

		record.close(SystemTime::now());
		self.association_repository.put(record).await.ok();
		Ok(())
	}

	/// Calling/called-AE admission checks (the `verificationServiceDisabled`
	/// check is evaluated per C-ECHO message instead — see the module doc
	/// comment). Returns the matched local AE
	/// so the caller does not need a second lookup: [`AeRepository`] only
	/// indexes Monai AEs by `name`, not by AE title, so finding one by
	/// `calledAet` already requires scanning [`AeRepository::list_monai_aes`].
	async fn check_admission(&self, calling_aet: &str, called_aet: &str, remote_host: IpAddr) -> Result<MonaiApplicationEntity, AdmissionError> {
		if self.config.reject_unknown_sources {
			let sources = self.ae_repository.list_source_aes().await.unwrap_or_default();
			let recognized = sources.iter().any(|source| {
				source.base.aet.as_str() == calling_aet && source.base.host_ip.map_or(true, |ip| ip == remote_host)
			});
			if !recognized {
				return Err(AdmissionError::CallingAeNotRecognized { calling_aet: calling_aet.to_owned(), remote_host: remote_host.to_string() });
			}
		}

		let monai_aes = self.ae_repository.list_monai_aes().await.unwrap_or_default();
		monai_aes
			.into_iter()
			.find(|ae| ae.base.aet.as_str() == called_aet)
			.ok_or_else(|| AdmissionError::CalledAeNotRecognized { called_aet: called_aet.to_owned() })
	}

	/// Runs the C-STORE admission-through-enqueue pipeline for one instance,
	/// returning the C-STORE-RSP to send plus `Ok(())` on success or
	/// `Err(error-message)` to log on the association record.
	async fn handle_c_store(
		&self,
		monai_ae: &MonaiApplicationEntity,
		calling_aet: &str,
		called_aet: &str,
		correlation_id: &str,
		message: crate::backend::dimse::DicomMessage,
	) -> Result<(CompositeStoreResponse, ()), (CompositeStoreResponse, String)> {
		let message_id = message
			.command
			.get(tags::MESSAGE_ID)
			.map(InMemElement::to_int::<crate::types::US>)
			.and_then(Result::ok)
			.unwrap_or_else(next_message_id);
		let sop_class_uid = message
			.command
			.get(tags::AFFECTED_SOP_CLASS_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|s| s.trim_end_matches('\0').to_owned())
			.unwrap_or_default();
		let sop_instance_uid = message
			.command
			.get(tags::AFFECTED_SOP_INSTANCE_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|s| s.trim_end_matches('\0').to_owned())
			.unwrap_or_default();

		let respond = |status: DimseStatus| CompositeStoreResponse {
			message_id,
			sop_class_uid: sop_class_uid.clone(),
			sop_instance_uid: sop_instance_uid.clone(),
			status: status.code(),
		};

		let Some(data_set) = message.data else {
			return Err((respond(DimseStatus::ProcessingFailure), String::from("C-STORE-RQ carried no data set")));
		};

		let grouping_tag = match monai_ae.grouping {
			GroupingTag::StudyInstanceUid => tags::STUDY_INSTANCE_UID,
			GroupingTag::SeriesInstanceUid => tags::SERIES_INSTANCE_UID,
		};
		let grouping_key = data_set
			.get(grouping_tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|s| s.trim_end_matches('\0').to_owned())
			.unwrap_or_else(|| sop_instance_uid.clone());

		let mut buf = Vec::new();
		if let Err(err) = data_set.write_dataset_with_ts(&mut buf, &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased()) {
			return Err((respond(DimseStatus::ProcessingFailure), err.to_string()));
		}

		let request = IngestRequest {
			identifier: sop_instance_uid.clone(),
			correlation_id: correlation_id.to_owned(),
			source: calling_aet.to_owned(),
			destination: called_aet.to_owned(),
			data_service: crate::model::file_metadata::DataService::Dimse,
			identity: crate::model::file_metadata::ObjectIdentity::Dicom {
				study_uid: if matches!(monai_ae.grouping, GroupingTag::StudyInstanceUid) { grouping_key.clone() } else { String::new() },
				series_uid: if matches!(monai_ae.grouping, GroupingTag::SeriesInstanceUid) { grouping_key.clone() } else { String::new() },
				sop_instance_uid: sop_instance_uid.clone(),
			},
			workflows: monai_ae.workflows.iter().cloned().collect(),
			grouping_key,
			timeout: Duration::from_secs(u64::from(monai_ae.timeout)),
			sop_class_uid: Some(sop_class_uid.clone()),
			sop_class_filter: monai_ae.sop_class_filter.clone(),
			plug_in_assemblies: monai_ae.plug_in_assemblies.clone(),
			content_type: String::from("application/dicom"),
			bytes: bytes::Bytes::from(buf),
			json_bytes: None,
		};

		match self.ingest.ingest(request).await {
			Ok(IngestOutcome::Stored { .. }) => Ok((respond(DimseStatus::Success), ())),
			Ok(IngestOutcome::Filtered) => Ok((respond(DimseStatus::SuccessWithWarning), ())),
			Err(GatewayError::Admission(AdmissionError::InsufficientStorage)) => {
				Err((respond(DimseStatus::OutOfResources), String::from("insufficient storage")))
			}
			Err(err) => Err((respond(DimseStatus::ProcessingFailure), err.to_string())),
		}
	}
}
