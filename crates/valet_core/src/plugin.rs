#![forbid(unsafe_code)]

//! Plugin trait and host.

use std::sync::Arc;

use async_trait::async_trait;

use crate::parser::Command;
use crate::registry::{CommandRegistry, DuplicateCommandError, EndpointSpec};
use crate::room_state::Message;

/// A unit of bot behavior. Plugins expose command endpoints, and may also
/// observe every ordinary message via the passive handler.
#[async_trait]
pub trait Plugin: Send + Sync {
	fn name(&self) -> &str;

	fn description(&self) -> &str;

	/// Commands this plugin serves. Names must be unique across the bot.
	fn command_endpoints(&self) -> Vec<EndpointSpec>;

	async fn handle_command(&self, command: &Command) -> anyhow::Result<()>;

	/// Whether [`Plugin::handle_message`] should be called for ordinary chat.
	fn has_message_handler(&self) -> bool {
		false
	}

	async fn handle_message(&self, _message: &Message) -> anyhow::Result<()> {
		Ok(())
	}
}

/// Owns the registered plugins and the command registry built from them.
///
/// Built-ins register before user plugins, so a user plugin colliding with
/// a built-in name fails registration rather than shadowing it.
#[derive(Default)]
pub struct PluginHost {
	registry: CommandRegistry,
	passive: Vec<Arc<dyn Plugin>>,
}

impl PluginHost {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_builtin(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), DuplicateCommandError> {
		self.register(plugin, true)
	}

	pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), DuplicateCommandError> {
		self.register(plugin, false)
	}

	fn register(&mut self, plugin: Arc<dyn Plugin>, built_in: bool) -> Result<(), DuplicateCommandError> {
		self.registry.register(plugin.clone(), built_in)?;
		if plugin.has_message_handler() {
			self.passive.push(plugin.clone());
		}
		tracing::info!(plugin = plugin.name(), built_in, "registered plugin");
		Ok(())
	}

	pub fn registry(&self) -> &CommandRegistry {
		&self.registry
	}

	/// Plugins that asked to see ordinary messages.
	pub fn passive_plugins(&self) -> &[Arc<dyn Plugin>] {
		&self.passive
	}
}
