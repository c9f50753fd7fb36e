//! Compile-time plug-in registry: rather than resolving plug-ins from a
//! dynamically loaded library by name, `PluginRegistry` holds
//! `Arc<dyn InputPlugin>`/`Arc<dyn OutputPlugin>` values produced by factory
//! functions registered at startup.

use super::{InputPlugin, OutputPlugin};
use std::collections::HashMap;
use std::sync::Arc;

type InputFactory = fn() -> Arc<dyn InputPlugin>;
type OutputFactory = fn() -> Arc<dyn OutputPlugin>;

#[derive(Default)]
pub struct PluginRegistry {
	input_factories: HashMap<&'static str, InputFactory>,
	output_factories: HashMap<&'static str, OutputFactory>,
}

impl PluginRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_input(&mut self, identifier: &'static str, factory: InputFactory) {
		self.input_factories.insert(identifier, factory);
	}

	pub fn register_output(&mut self, identifier: &'static str, factory: OutputFactory) {
		self.output_factories.insert(identifier, factory);
	}

	#[must_use]
	pub fn resolve_input(&self, identifier: &str) -> Option<Arc<dyn InputPlugin>> {
		self.input_factories.get(identifier).map(|factory| factory())
	}

	#[must_use]
	pub fn resolve_output(&self, identifier: &str) -> Option<Arc<dyn OutputPlugin>> {
		self.output_factories.get(identifier).map(|factory| factory())
	}

	#[must_use]
	pub fn is_registered(&self, identifier: &str) -> bool {
		self.input_factories.contains_key(identifier) || self.output_factories.contains_key(identifier)
	}
}

/// Builds the registry the gateway runs with: every built-in plug-in from
/// [`super::builtin`] registered under its stable identifier.
#[must_use]
pub fn builtin_registry() -> PluginRegistry {
	let mut registry = PluginRegistry::new();
	registry.register_input("passthrough", || Arc::new(super::builtin::PassthroughInputPlugin));
	registry.register_output("passthrough", || Arc::new(super::builtin::PassthroughOutputPlugin));
	registry
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builtin_registry_resolves_the_passthrough_plugin() {
		let registry = builtin_registry();
		assert!(registry.resolve_input("passthrough").is_some());
		assert!(registry.resolve_output("passthrough").is_some());
	}

	#[test]
	fn unknown_identifier_does_not_resolve() {
		let registry = builtin_registry();
		assert!(registry.resolve_input("does-not-exist").is_none());
		assert!(!registry.is_registered("does-not-exist"));
	}
}
