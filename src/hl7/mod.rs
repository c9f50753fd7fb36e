//! HL7 v2 MLLP listener: accepts MLLP-framed HL7 v2
//! messages, ACKs each with `MSA|AA|<controlId>`, and routes the message
//! body into the shared [`crate::ingest`] pipeline.
//!
//! Same accept-loop-over-`TcpListener` shape as the DIMSE SCP: one task per
//! connection, a loop reading frames until the peer closes or the component
//! is cancelled, here over MLLP's much simpler `VT … FS CR` block framing
//! instead of DICOM UL association framing.

use crate::component::{Component, ComponentStatus, StatusCell};
use crate::config::Hl7Config;
use crate::ingest::{IngestOutcome, IngestPipeline, IngestRequest};
use crate::model::ae::MonaiApplicationEntity;
use crate::model::file_metadata::{DataService, ObjectIdentity};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// MLLP block framing markers.
const START_BLOCK: u8 = 0x0B;
const END_BLOCK: u8 = 0x1C;
const CARRIAGE_RETURN: u8 = 0x0D;

const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Hl7Listener {
	config: Hl7Config,
	ingest: Arc<IngestPipeline>,
	status: StatusCell,
}

impl Hl7Listener {
	#[must_use]
	pub fn new(config: Hl7Config, ingest: Arc<IngestPipeline>) -> Self {
		Self { config, ingest, status: StatusCell::new() }
	}
}

#[async_trait::async_trait]
impl Component for Hl7Listener {
	fn name(&self) -> &'static str {
		"hl7-mllp"
	}

	async fn run(&self, token: CancellationToken) {
		self.status.set(ComponentStatus::Running);
		let address = std::net::SocketAddr::from((self.config.interface, self.config.port));
		let listener = match TcpListener::bind(address).await {
			Ok(listener) => listener,
			Err(err) => {
				tracing::error!(%address, "failed to bind HL7 MLLP listener: {err}");
				self.status.set(ComponentStatus::Cancelled);
				return;
			}
		};
		info!(%address, "HL7 MLLP listener listening");

		loop {
			tokio::select! {
				() = token.cancelled() => break,
				accepted = listener.accept() => {
					let Ok((stream, peer)) = accepted else {
						tracing::error!("failed to accept incoming HL7 connection");
						continue;
					};
					let ingest = Arc::clone(&self.ingest);
					let token = token.clone();
					tokio::spawn(async move { handle_connection(stream, ingest, peer, token).await });
				}
			}
		}

		self.status.set(ComponentStatus::Cancelled);
	}

	fn status(&self) -> ComponentStatus {
		self.status.get()
	}
}

#[instrument(skip_all, fields(peer = %peer))]
async fn handle_connection(stream: tokio::net::TcpStream, ingest: Arc<IngestPipeline>, peer: std::net::SocketAddr, token: CancellationToken) {
	let (read_half, mut write_half) = stream.into_split();
	let mut reader = BufReader::new(read_half);

	loop {
		if token.is_cancelled() {
			break;
		}

		let mut marker = [0u8; 1];
		match tokio::time::timeout(IDLE_READ_TIMEOUT, reader.read_exact(&mut marker)).await {
			Ok(Ok(_)) => {}
			Ok(Err(_)) => break,
			Err(_) => continue, // idle timeout elapsed, loop back round to the cancellation check
		}
		if marker[0] != START_BLOCK {
			// Not a start-of-block byte: resync by discarding it.
			continue;
		}

		let mut message = Vec::new();
		match reader.read_until(END_BLOCK, &mut message).await {
			Ok(0) => break,
			Ok(_) => {}
			Err(err) => {
				warn!("failed to read HL7 message body: {err}");
				break;
			}
		}
		message.pop(); // drop the trailing END_BLOCK byte

		let mut trailer = [0u8; 1];
		if reader.read_exact(&mut trailer).await.is_err() || trailer[0] != CARRIAGE_RETURN {
			warn!("HL7 message was not terminated with a carriage return after FS");
		}

		let control_id = message_control_id(&message).unwrap_or_else(|| Uuid::new_v4().to_string());
		if let Err(err) = ingest_message(&ingest, &control_id, Bytes::from(message)).await {
			warn!(control_id, "failed to ingest HL7 message: {err}");
		}

		let ack = build_ack(&control_id);
		if let Err(err) = write_half.write_all(&ack).await {
			warn!("failed to write HL7 ACK: {err}");
			break;
		}
	}
}

async fn ingest_message(ingest: &IngestPipeline, control_id: &str, bytes: Bytes) -> Result<IngestOutcome, crate::error::GatewayError> {
	let request = IngestRequest {
		identifier: control_id.to_owned(),
		correlation_id: Uuid::new_v4().to_string(),
		source: String::from("hl7"),
		destination: String::from("gateway"),
		data_service: DataService::Hl7,
		identity: ObjectIdentity::Hl7 { message_control_id: control_id.to_owned() },
		workflows: Vec::new(),
		grouping_key: control_id.to_owned(),
		timeout: Duration::from_secs(u64::from(MonaiApplicationEntity::DEFAULT_TIMEOUT_SECONDS)),
		sop_class_uid: None,
		sop_class_filter: crate::model::ae::SopClassFilter::None,
		plug_in_assemblies: Vec::new(),
		content_type: String::from("application/hl7-v2"),
		bytes,
		json_bytes: None,
	};
	ingest.ingest(request).await
}

/// Extracts MSH-10 (message control id) from the MSH segment, splitting
/// segments on `\r` and fields on the MSH-declared field separator (always
/// `|` in practice for the gateways this talks to).
fn message_control_id(message: &[u8]) -> Option<String> {
	let text = String::from_utf8_lossy(message);
	let segment = text.split('\r').find(|line| line.starts_with("MSH"))?;
	let fields: Vec<&str> = segment.split('|').collect();
	fields.get(9).map(|field| field.trim().to_owned()).filter(|id| !id.is_empty())
}

/// Builds an MLLP-framed minimal ACK: `MSA|AA|<controlId>`. No MSH segment
/// is fabricated for the ack, only the `MSA` segment.
fn build_ack(control_id: &str) -> Vec<u8> {
	let body = format!("MSA|AA|{control_id}\r");
	let mut framed = Vec::with_capacity(body.len() + 3);
	framed.push(START_BLOCK);
	framed.extend_from_slice(body.as_bytes());
	framed.push(END_BLOCK);
	framed.push(CARRIAGE_RETURN);
	framed
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::memory::InMemoryMessageBus;
	use crate::config::BusConfig;
	use crate::plugin::registry::builtin_registry;
	use crate::repository::memory::{InMemoryFileMetadataRepository, InMemoryPayloadRepository};
	use crate::storage::memory::InMemoryObjectStore;
	use crate::storage::temp::InMemoryTemporaryStore;
	use crate::storage::StorageInfoProvider;
	use crate::upload::ObjectUploadQueue;
	use tokio::io::AsyncWriteExt;
	use tokio::net::TcpStream;

	struct AlwaysHasSpace;
	impl StorageInfoProvider for AlwaysHasSpace {
		fn has_space_to_store(&self) -> bool {
			true
		}
	}

	#[test]
	fn message_control_id_reads_msh_10() {
		let message = b"MSH|^~\\&|SENDER|FACILITY|RECEIVER|FACILITY2|20260101120000||ADT^A01|CTRL-123|P|2.3\rPID|1||12345\r";
		assert_eq!(message_control_id(message).as_deref(), Some("CTRL-123"));
	}

	#[test]
	fn message_control_id_is_none_without_an_msh_segment() {
		assert_eq!(message_control_id(b"PID|1||12345\r"), None);
	}

	#[test]
	fn ack_is_framed_with_start_and_end_blocks() {
		let ack = build_ack("CTRL-123");
		assert_eq!(ack.first(), Some(&START_BLOCK));
		assert_eq!(ack.last(), Some(&CARRIAGE_RETURN));
		assert!(String::from_utf8_lossy(&ack).contains("MSA|AA|CTRL-123"));
	}

	#[tokio::test]
	async fn a_framed_message_is_ingested_and_acked() {
		let (assembler, _completed) = crate::assembler::PayloadAssembler::new(
			Arc::new(InMemoryPayloadRepository::default()),
			Arc::new(InMemoryFileMetadataRepository::default()),
			Arc::new(InMemoryMessageBus::default()),
			BusConfig {
				workflow_request_topic: String::from("workflowrequest"),
				export_request_topic: String::from("exportrequest"),
				export_complete_topic: String::from("exportcomplete"),
				nats_url: String::from("nats://localhost:4222"),
			},
			String::from("dicom"),
			Duration::from_millis(10),
			vec![],
		);
		let upload_queue = ObjectUploadQueue::new(
			Arc::new(InMemoryFileMetadataRepository::default()),
			Arc::new(InMemoryTemporaryStore::default()),
			Arc::new(InMemoryObjectStore::default()),
			String::from("dicom"),
			4,
			vec![],
			Duration::from_millis(10),
		);
		let ingest = Arc::new(IngestPipeline::new(
			Arc::new(AlwaysHasSpace),
			Arc::new(builtin_registry()),
			Arc::new(InMemoryTemporaryStore::default()),
			Arc::new(upload_queue),
			Arc::new(assembler),
		));

		let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let bound = tcp_listener.local_addr().unwrap();

		let token = CancellationToken::new();
		let task_token = token.clone();
		tokio::spawn(async move {
			let (stream, peer) = tcp_listener.accept().await.unwrap();
			handle_connection(stream, ingest, peer, task_token).await;
		});

		let mut client = TcpStream::connect(bound).await.unwrap();
		let mut framed = Vec::new();
		framed.push(START_BLOCK);
		framed.extend_from_slice(b"MSH|^~\\&|SENDER|FACILITY|RECEIVER|FACILITY2|20260101120000||ADT^A01|CTRL-123|P|2.3\rPID|1||12345\r");
		framed.push(END_BLOCK);
		framed.push(CARRIAGE_RETURN);
		client.write_all(&framed).await.unwrap();

		let mut response = [0u8; 256];
		let mut reader = BufReader::new(&mut client);
		reader.read_exact(&mut response[..1]).await.unwrap();
		let mut body = Vec::new();
		AsyncBufReadExt::read_until(&mut reader, END_BLOCK, &mut body).await.unwrap();
		body.pop();

		assert_eq!(response[0], START_BLOCK);
		assert!(String::from_utf8_lossy(&body).contains("MSA|AA|CTRL-123"));
		token.cancel();
	}
}
