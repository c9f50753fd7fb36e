//! HTTP surface: STOW-RS only. QIDO-RS/WADO-RS and any admin CRUD surface
//! over AE configuration are non-goals, so this does not route by `{aet}`
//! path segment at all — there is exactly one backend (this gateway) and
//! one protocol.

pub mod stow;

use crate::api::stow::StowState;
use crate::component::{Component, ComponentStatus, StatusCell};
use crate::config::DicomWebConfig;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Mounts the STOW-RS router under `base_path` (axum no longer supports
/// nesting at the root).
#[must_use]
pub fn routes(base_path: &str) -> Router<StowState> {
	let router = stow::routes();
	match base_path {
		"/" | "" => router,
		base_path => Router::new().nest(base_path, router),
	}
}

/// Wraps the STOW-RS router in a [`Component`], the HTTP-transport analogue
/// of `backend::dimse::scp::StorageServiceClassProvider` and `hl7::Hl7Listener`.
pub struct HttpServer {
	config: DicomWebConfig,
	state: StowState,
	status: StatusCell,
}

impl HttpServer {
	#[must_use]
	pub fn new(config: DicomWebConfig, state: StowState) -> Self {
		Self { config, state, status: StatusCell::new() }
	}
}

#[async_trait::async_trait]
impl Component for HttpServer {
	fn name(&self) -> &'static str {
		"stow-http"
	}

	async fn run(&self, token: CancellationToken) {
		self.status.set(ComponentStatus::Running);
		let address = std::net::SocketAddr::from((self.config.interface, self.config.port));
		let listener = match TcpListener::bind(address).await {
			Ok(listener) => listener,
			Err(err) => {
				tracing::error!(%address, "failed to bind STOW-RS HTTP listener: {err}");
				self.status.set(ComponentStatus::Cancelled);
				return;
			}
		};
		info!(%address, base_path = %self.config.base_path, "STOW-RS HTTP server listening");

		let router = routes(&self.config.base_path).with_state(self.state.clone());
		let shutdown = token.clone();
		if let Err(err) = axum::serve(listener, router)
			.with_graceful_shutdown(async move { shutdown.cancelled().await })
			.await
		{
			tracing::error!("STOW-RS HTTP server stopped with an error: {err}");
		}

		self.status.set(ComponentStatus::Cancelled);
	}

	fn status(&self) -> ComponentStatus {
		self.status.get()
	}
}
