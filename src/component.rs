//! Background-service lifecycle. Every long-running subsystem — the DIMSE SCP
//! listener, the STOW-RS HTTP server, the HL7 MLLP listener, the upload
//! worker, the payload assembler, the export service — implements
//! [`Component`] and is started/stopped by `main` in dependency order,
//! through an explicit trait instead of inline `tokio::spawn` calls
//! scattered through `main`.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
	Unknown,
	Running,
	Stopped,
	Cancelled,
}

impl ComponentStatus {
	fn from_code(code: u8) -> Self {
		match code {
			1 => Self::Running,
			2 => Self::Stopped,
			3 => Self::Cancelled,
			_ => Self::Unknown,
		}
	}

	const fn code(self) -> u8 {
		match self {
			Self::Unknown => 0,
			Self::Running => 1,
			Self::Stopped => 2,
			Self::Cancelled => 3,
		}
	}
}

/// Shared status cell a [`Component`] flips as it starts, runs and stops.
#[derive(Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
	#[must_use]
	pub fn new() -> Self {
		Self(AtomicU8::new(ComponentStatus::Unknown.code()))
	}

	pub fn set(&self, status: ComponentStatus) {
		self.0.store(status.code(), Ordering::SeqCst);
	}

	#[must_use]
	pub fn get(&self) -> ComponentStatus {
		ComponentStatus::from_code(self.0.load(Ordering::SeqCst))
	}
}

impl fmt::Debug for StatusCell {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "StatusCell({:?})", self.get())
	}
}

/// A background subsystem with an explicit start/stop lifecycle, replacing
/// exception/DI-container-driven background service base classes.
#[async_trait::async_trait]
pub trait Component: Send + Sync {
	fn name(&self) -> &'static str;

	/// Runs the component's main loop until `token` is cancelled. Must
	/// return once cancelled rather than looping forever.
	async fn run(&self, token: CancellationToken);

	fn status(&self) -> ComponentStatus;
}

/// Starts every component in order, in its own task, and stops them on
/// shutdown in the order their dependencies require: storage info ->
/// repositories -> upload queue/worker -> assembler -> ingestors -> export
/// service.
pub struct Orchestrator {
	components: Vec<Arc<dyn Component>>,
	token: CancellationToken,
	handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Orchestrator {
	#[must_use]
	pub fn new(token: CancellationToken) -> Self {
		Self { components: Vec::new(), token, handles: Vec::new() }
	}

	pub fn register(&mut self, component: Arc<dyn Component>) {
		self.components.push(component);
	}

	/// Spawns every registered component's [`Component::run`] as a Tokio
	/// task sharing the orchestrator's cancellation token.
	pub fn start_all(&mut self) {
		for component in &self.components {
			let component = Arc::clone(component);
			let token = self.token.clone();
			let name = component.name();
			self.handles.push(tokio::spawn(async move {
				tracing::info!(component = name, "starting component");
				component.run(token).await;
				tracing::info!(component = name, "component stopped");
			}));
		}
	}

	/// Cancels every component and waits up to `grace_period` for them to
	/// finish their current I/O and exit.
	pub async fn stop_all(self, grace_period: Duration) {
		self.token.cancel();
		let join_all = futures::future::join_all(self.handles);
		if tokio::time::timeout(grace_period, join_all).await.is_err() {
			tracing::warn!("one or more components did not stop within the grace period");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Noop(StatusCell);

	#[async_trait::async_trait]
	impl Component for Noop {
		fn name(&self) -> &'static str {
			"noop"
		}

		async fn run(&self, token: CancellationToken) {
			self.0.set(ComponentStatus::Running);
			token.cancelled().await;
			self.0.set(ComponentStatus::Cancelled);
		}

		fn status(&self) -> ComponentStatus {
			self.0.get()
		}
	}

	#[tokio::test]
	async fn orchestrator_cancels_every_component_on_stop() {
		let token = CancellationToken::new();
		let mut orchestrator = Orchestrator::new(token);
		let component = Arc::new(Noop(StatusCell::new()));
		orchestrator.register(component.clone());
		orchestrator.start_all();

		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(component.status(), ComponentStatus::Running);

		orchestrator.stop_all(Duration::from_secs(1)).await;
		assert_eq!(component.status(), ComponentStatus::Cancelled);
	}
}
