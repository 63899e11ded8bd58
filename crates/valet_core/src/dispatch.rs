#![forbid(unsafe_code)]

//! Command routing.
//!
//! The dispatcher sits between the parser and the plugins. Handlers run in
//! spawned tasks, so a slow or panicking plugin never stalls the room's
//! event pipeline, and handler errors are contained to a logged warning
//! plus a generic reply.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use valet_domain::{MessageId, RoomIdent};

use crate::parser::Command;
use crate::plugin::PluginHost;
use crate::room_state::Message;
use crate::storage::{BanStore, PluginState};

/// Outbound reply surface handed to the dispatcher and to plugins.
#[async_trait]
pub trait Responder: Send + Sync {
	async fn post(&self, room: &RoomIdent, text: &str) -> anyhow::Result<()>;

	async fn reply(&self, room: &RoomIdent, parent: MessageId, text: &str) -> anyhow::Result<()>;
}

/// What to do with a trigger-prefixed message whose name matches nothing.
#[derive(Debug, Clone, Default)]
pub enum UnknownCommandPolicy {
	/// Treat it as ordinary chat.
	#[default]
	Silent,
	/// Reply with a fixed notice.
	Reply(String),
}

pub struct Dispatcher {
	host: Arc<PluginHost>,
	bans: Arc<dyn BanStore>,
	plugin_state: Arc<dyn PluginState>,
	responder: Arc<dyn Responder>,
	unknown: UnknownCommandPolicy,
}

impl Dispatcher {
	pub fn new(
		host: Arc<PluginHost>,
		bans: Arc<dyn BanStore>,
		plugin_state: Arc<dyn PluginState>,
		responder: Arc<dyn Responder>,
		unknown: UnknownCommandPolicy,
	) -> Self {
		Self {
			host,
			bans,
			plugin_state,
			responder,
			unknown,
		}
	}

	/// Route one parsed command to its plugin.
	pub async fn dispatch_command(&self, command: Command) {
		let room = command.message.room.clone();
		let room_label = room.to_string();

		match self.bans.is_banned(Some(&room), command.message.user).await {
			Ok(true) => {
				debug!(room = %room_label, user = %command.message.user, "ignoring command from banned user");
				metrics::counter!("valet_commands_banned_total", "room" => room_label).increment(1);
				return;
			}
			Ok(false) => {}
			Err(e) => {
				// Storage trouble must not open a hole in the ban list.
				warn!(room = %room_label, error = %e, "ban check failed; dropping command");
				return;
			}
		}

		let Some(entry) = self.host.registry().lookup(&command.name) else {
			metrics::counter!("valet_commands_unknown_total", "room" => room_label).increment(1);
			if let UnknownCommandPolicy::Reply(notice) = &self.unknown {
				let _ = self.responder.reply(&room, command.message.id, notice).await;
			}
			return;
		};

		if !entry.built_in {
			match self.plugin_state.is_enabled(Some(&room), &entry.owner_name).await {
				Ok(true) => {}
				Ok(false) => {
					let notice = format!("The {} plugin is currently disabled.", entry.owner_name);
					let _ = self.responder.reply(&room, command.message.id, &notice).await;
					return;
				}
				Err(e) => {
					warn!(room = %room_label, error = %e, "plugin state check failed; dropping command");
					return;
				}
			}
		}

		metrics::counter!(
			"valet_commands_dispatched_total",
			"room" => room_label.clone(),
			"command" => command.name.clone()
		)
		.increment(1);

		let plugin = entry.plugin.clone();
		let owner = entry.owner_name.clone();
		let responder = self.responder.clone();
		tokio::spawn(async move {
			let parent = command.message.id;
			if let Err(e) = plugin.handle_command(&command).await {
				warn!(room = %room_label, plugin = %owner, command = %command.name, error = ?e, "command handler failed");
				metrics::counter!("valet_commands_failed_total", "room" => room_label).increment(1);
				let _ = responder
					.reply(&room, parent, "Something went wrong while running that command.")
					.await;
			}
		});
	}

	/// Fan an ordinary message out to the passive plugins.
	pub async fn dispatch_message(&self, message: Message) {
		let room = message.room.clone();
		let room_label = room.to_string();

		match self.bans.is_banned(Some(&room), message.user).await {
			Ok(true) => return,
			Ok(false) => {}
			Err(e) => {
				warn!(room = %room_label, error = %e, "ban check failed; dropping message");
				return;
			}
		}

		for plugin in self.host.passive_plugins() {
			let enabled = match self.plugin_state.is_enabled(Some(&room), plugin.name()).await {
				Ok(enabled) => enabled,
				Err(e) => {
					warn!(room = %room_label, plugin = plugin.name(), error = %e, "plugin state check failed");
					continue;
				}
			};
			if !enabled {
				continue;
			}

			let plugin = plugin.clone();
			let message = message.clone();
			let room_label = room_label.clone();
			tokio::spawn(async move {
				if let Err(e) = plugin.handle_message(&message).await {
					warn!(room = %room_label, plugin = plugin.name(), error = ?e, "message handler failed");
				}
			});
		}
	}
}
