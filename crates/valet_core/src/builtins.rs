#![forbid(unsafe_code)]

//! Always-registered core commands.
//!
//! Built-ins register before user plugins, cannot be disabled per room,
//! and are the only commands that manage other plugins.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use valet_domain::UserId;

use crate::dispatch::Responder;
use crate::parser::Command;
use crate::plugin::Plugin;
use crate::registry::EndpointSpec;
use crate::storage::{AdminStore, BanStore, PluginState};

const ADMIN_DENIED: &str = "You must be an admin to do that.";

/// Help entry captured from the registry after registration completes.
#[derive(Debug, Clone)]
pub struct HelpEntry {
	pub name: String,
	pub help: String,
	pub owner: String,
}

/// `help [command]` — lists every registered command, or one command's
/// usage. The entry list is filled in once the full registry is known,
/// which is necessarily after this plugin itself registered.
pub struct HelpBuiltIn {
	responder: Arc<dyn Responder>,
	entries: Arc<OnceLock<Vec<HelpEntry>>>,
}

impl HelpBuiltIn {
	pub fn new(responder: Arc<dyn Responder>) -> Self {
		Self {
			responder,
			entries: Arc::new(OnceLock::new()),
		}
	}

	/// Handle for the composition root to fill after registration.
	pub fn entries_slot(&self) -> Arc<OnceLock<Vec<HelpEntry>>> {
		self.entries.clone()
	}
}

#[async_trait]
impl Plugin for HelpBuiltIn {
	fn name(&self) -> &str {
		"Help"
	}

	fn description(&self) -> &str {
		"Lists available commands"
	}

	fn command_endpoints(&self) -> Vec<EndpointSpec> {
		vec![EndpointSpec::new("help", "help [command] - list commands or show one command's usage")]
	}

	async fn handle_command(&self, command: &Command) -> anyhow::Result<()> {
		let entries = self.entries.get().map(Vec::as_slice).unwrap_or_default();
		let room = &command.message.room;
		let parent = command.message.id;

		let text = match command.args.first() {
			Some(wanted) => {
				let wanted = wanted.to_lowercase();
				match entries.iter().find(|e| e.name == wanted) {
					Some(entry) => format!("{} ({})", entry.help, entry.owner),
					None => format!("No such command: {wanted}"),
				}
			}
			None => {
				let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
				format!("Available commands: {}", names.join(", "))
			}
		};

		self.responder.reply(room, parent, &text).await?;
		Ok(())
	}
}

/// `version` — reports the running bot version.
pub struct VersionBuiltIn {
	responder: Arc<dyn Responder>,
}

impl VersionBuiltIn {
	pub fn new(responder: Arc<dyn Responder>) -> Self {
		Self { responder }
	}
}

#[async_trait]
impl Plugin for VersionBuiltIn {
	fn name(&self) -> &str {
		"Version"
	}

	fn description(&self) -> &str {
		"Reports the bot version"
	}

	fn command_endpoints(&self) -> Vec<EndpointSpec> {
		vec![EndpointSpec::new("version", "version - show the running bot version")]
	}

	async fn handle_command(&self, command: &Command) -> anyhow::Result<()> {
		let text = format!("valet v{}", env!("CARGO_PKG_VERSION"));
		self.responder.reply(&command.message.room, command.message.id, &text).await?;
		Ok(())
	}
}

/// `plugin list|enable|disable|status` — per-room plugin management.
/// Mutations are admin-gated; built-ins are not listed and cannot be
/// toggled.
pub struct PluginBuiltIn {
	responder: Arc<dyn Responder>,
	admins: Arc<dyn AdminStore>,
	state: Arc<dyn PluginState>,
	/// (name, description) of the registered user plugins, filled by the
	/// composition root after registration.
	plugins: Arc<OnceLock<Vec<(String, String)>>>,
}

impl PluginBuiltIn {
	pub fn new(responder: Arc<dyn Responder>, admins: Arc<dyn AdminStore>, state: Arc<dyn PluginState>) -> Self {
		Self {
			responder,
			admins,
			state,
			plugins: Arc::new(OnceLock::new()),
		}
	}

	pub fn plugins_slot(&self) -> Arc<OnceLock<Vec<(String, String)>>> {
		self.plugins.clone()
	}

	fn known(&self, name: &str) -> Option<String> {
		self.plugins
			.get()
			.map(Vec::as_slice)
			.unwrap_or_default()
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(n, _)| n.clone())
	}
}

#[async_trait]
impl Plugin for PluginBuiltIn {
	fn name(&self) -> &str {
		"Plugin"
	}

	fn description(&self) -> &str {
		"Manages per-room plugin enablement"
	}

	fn command_endpoints(&self) -> Vec<EndpointSpec> {
		vec![EndpointSpec::new(
			"plugin",
			"plugin list | plugin status <name> | plugin enable <name> | plugin disable <name>",
		)]
	}

	async fn handle_command(&self, command: &Command) -> anyhow::Result<()> {
		let room = &command.message.room;
		let parent = command.message.id;

		let reply = |text: String| async move { self.responder.reply(room, parent, &text).await };

		match command.args.first().map(String::as_str) {
			Some("list") => {
				let plugins = self.plugins.get().map(Vec::as_slice).unwrap_or_default();
				if plugins.is_empty() {
					reply("No plugins are registered.".to_string()).await?;
					return Ok(());
				}
				let mut lines = Vec::with_capacity(plugins.len());
				for (name, description) in plugins {
					let enabled = self.state.is_enabled(Some(room), name).await?;
					let marker = if enabled { "enabled" } else { "disabled" };
					lines.push(format!("{name} ({marker}) - {description}"));
				}
				reply(lines.join("; ")).await?;
			}
			Some("status") => {
				let Some(raw) = command.args.get(1) else {
					reply("Syntax: plugin status <name>".to_string()).await?;
					return Ok(());
				};
				match self.known(raw) {
					Some(name) => {
						let enabled = self.state.is_enabled(Some(room), &name).await?;
						let state = if enabled { "enabled" } else { "disabled" };
						reply(format!("The {name} plugin is currently {state}.")).await?;
					}
					None => reply(format!("No such plugin: {raw}")).await?,
				}
			}
			Some(action @ ("enable" | "disable")) => {
				if !self.admins.is_admin(Some(room), command.message.user).await? {
					reply(ADMIN_DENIED.to_string()).await?;
					return Ok(());
				}
				let Some(raw) = command.args.get(1) else {
					reply(format!("Syntax: plugin {action} <name>")).await?;
					return Ok(());
				};
				match self.known(raw) {
					Some(name) => {
						let enabled = action == "enable";
						self.state.set_enabled(Some(room), &name, enabled).await?;
						let state = if enabled { "enabled" } else { "disabled" };
						reply(format!("The {name} plugin is now {state}.")).await?;
					}
					None => reply(format!("No such plugin: {raw}")).await?,
				}
			}
			_ => {
				reply("Syntax: plugin list | plugin status <name> | plugin enable <name> | plugin disable <name>".to_string())
					.await?;
			}
		}

		Ok(())
	}
}

/// `admin list|add|remove` — room admin management. Mutations require the
/// caller to already be an admin.
pub struct AdminBuiltIn {
	responder: Arc<dyn Responder>,
	admins: Arc<dyn AdminStore>,
}

impl AdminBuiltIn {
	pub fn new(responder: Arc<dyn Responder>, admins: Arc<dyn AdminStore>) -> Self {
		Self { responder, admins }
	}

	fn parse_user(raw: &str) -> Option<UserId> {
		raw.trim_start_matches('@').parse().ok()
	}
}

#[async_trait]
impl Plugin for AdminBuiltIn {
	fn name(&self) -> &str {
		"Admin"
	}

	fn description(&self) -> &str {
		"Manages the room admin list"
	}

	fn command_endpoints(&self) -> Vec<EndpointSpec> {
		vec![EndpointSpec::new(
			"admin",
			"admin list | admin add <user id> | admin remove <user id>",
		)]
	}

	async fn handle_command(&self, command: &Command) -> anyhow::Result<()> {
		let room = &command.message.room;
		let parent = command.message.id;

		let reply = |text: String| async move { self.responder.reply(room, parent, &text).await };

		match command.args.first().map(String::as_str) {
			Some("list") => {
				let admins = self.admins.list(Some(room)).await?;
				if admins.is_empty() {
					reply("There are no room admins.".to_string()).await?;
				} else {
					let ids: Vec<String> = admins.iter().map(UserId::to_string).collect();
					reply(format!("Room admins: {}", ids.join(", "))).await?;
				}
			}
			Some(action @ ("add" | "remove")) => {
				if !self.admins.is_admin(Some(room), command.message.user).await? {
					reply(ADMIN_DENIED.to_string()).await?;
					return Ok(());
				}
				let Some(user) = command.args.get(1).and_then(|raw| Self::parse_user(raw)) else {
					reply(format!("Syntax: admin {action} <user id>")).await?;
					return Ok(());
				};
				if action == "add" {
					self.admins.add(Some(room), user).await?;
					reply(format!("User {user} is now a room admin.")).await?;
				} else {
					self.admins.remove(Some(room), user).await?;
					reply(format!("User {user} is no longer a room admin.")).await?;
				}
			}
			_ => {
				reply("Syntax: admin list | admin add <user id> | admin remove <user id>".to_string()).await?;
			}
		}

		Ok(())
	}
}

/// `ban list|add|remove` — controls the set of users the bot ignores.
/// Mutations are admin-gated; admins cannot be banned.
pub struct BanBuiltIn {
	responder: Arc<dyn Responder>,
	admins: Arc<dyn AdminStore>,
	bans: Arc<dyn BanStore>,
}

impl BanBuiltIn {
	pub fn new(responder: Arc<dyn Responder>, admins: Arc<dyn AdminStore>, bans: Arc<dyn BanStore>) -> Self {
		Self { responder, admins, bans }
	}

	fn parse_user(raw: &str) -> Option<UserId> {
		raw.trim_start_matches('@').parse().ok()
	}
}

#[async_trait]
impl Plugin for BanBuiltIn {
	fn name(&self) -> &str {
		"Ban"
	}

	fn description(&self) -> &str {
		"Manages the list of users the bot ignores"
	}

	fn command_endpoints(&self) -> Vec<EndpointSpec> {
		vec![EndpointSpec::new(
			"ban",
			"ban list | ban add <user id> | ban remove <user id>",
		)]
	}

	async fn handle_command(&self, command: &Command) -> anyhow::Result<()> {
		let room = &command.message.room;
		let parent = command.message.id;

		let reply = |text: String| async move { self.responder.reply(room, parent, &text).await };

		match command.args.first().map(String::as_str) {
			Some("list") => {
				let banned = self.bans.list(Some(room)).await?;
				if banned.is_empty() {
					reply("No users are banned.".to_string()).await?;
				} else {
					let ids: Vec<String> = banned.iter().map(UserId::to_string).collect();
					reply(format!("Banned users: {}", ids.join(", "))).await?;
				}
			}
			Some(action @ ("add" | "remove")) => {
				if !self.admins.is_admin(Some(room), command.message.user).await? {
					reply(ADMIN_DENIED.to_string()).await?;
					return Ok(());
				}
				let Some(user) = command.args.get(1).and_then(|raw| Self::parse_user(raw)) else {
					reply(format!("Syntax: ban {action} <user id>")).await?;
					return Ok(());
				};
				if action == "add" {
					if self.admins.is_admin(Some(room), user).await? {
						reply("Admins cannot be banned.".to_string()).await?;
						return Ok(());
					}
					self.bans.ban(Some(room), user).await?;
					reply(format!("User {user} is now banned.")).await?;
				} else {
					self.bans.unban(Some(room), user).await?;
					reply(format!("User {user} is no longer banned.")).await?;
				}
			}
			_ => {
				reply("Syntax: ban list | ban add <user id> | ban remove <user id>".to_string()).await?;
			}
		}

		Ok(())
	}
}
