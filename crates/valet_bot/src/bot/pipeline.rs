#![forbid(unsafe_code)]

//! Per-room event pipeline.
//!
//! One pipeline task consumes one session's event channel. It is the single
//! mutator of that room's state; commands and passive handlers are handed
//! off to the dispatcher, which spawns them, so decoding never waits on a
//! handler.

use std::sync::Arc;

use tracing::{debug, info, warn};
use valet_chat::{RoomEvent, SelfUserCell, SessionEvent, SessionEventRx};
use valet_core::dispatch::Dispatcher;
use valet_core::parser::CommandParser;
use valet_core::room_state::{Applied, Message, RoomState};

use crate::bot::status_http::BotStatus;

pub struct RoomPipeline {
	state: RoomState,
	parser: CommandParser,
	dispatcher: Arc<Dispatcher>,
	status: BotStatus,
	/// The bot's own account, learned by the sessions at login; its messages
	/// are folded into state but never parsed or fanned out, so the bot
	/// cannot command itself.
	self_user: SelfUserCell,
}

impl RoomPipeline {
	pub fn new(
		state: RoomState,
		parser: CommandParser,
		dispatcher: Arc<Dispatcher>,
		status: BotStatus,
		self_user: SelfUserCell,
	) -> Self {
		Self {
			state,
			parser,
			dispatcher,
			status,
			self_user,
		}
	}

	pub async fn run(mut self, mut events_rx: SessionEventRx) {
		let room_label = self.state.room().to_string();
		info!(room = %room_label, "room pipeline starting");

		while let Some(event) = events_rx.recv().await {
			match event {
				SessionEvent::Status(status) => {
					if status.fatal {
						warn!(room = %room_label, detail = %status.detail, "session reported fatal status");
					} else {
						debug!(room = %room_label, connected = status.connected, detail = %status.detail, "session status");
					}
					self.status.record(&status).await;
				}
				SessionEvent::Event(env) => {
					if let Err(e) = valet_chat::validate_envelope(&env) {
						debug!(room = %room_label, error = %e, "dropping invalid envelope");
						continue;
					}

					let is_post = matches!(env.event, RoomEvent::MessagePosted { .. });
					if self.state.apply(&env) == Applied::Stale {
						debug!(room = %room_label, timestamp = env.timestamp, seq = env.seq, "stale event ignored");
						continue;
					}
					if !is_post {
						continue;
					}

					let Some(message) = Message::from_envelope(&env) else {
						continue;
					};
					if self.self_user.get().await.is_some_and(|me| me == message.user) {
						continue;
					}

					match self.parser.parse(&message) {
						Some(command) => {
							debug!(room = %room_label, command = %command.name, user = %message.user, "dispatching command");
							self.dispatcher.dispatch_command(command).await;
						}
						None => {
							self.dispatcher.dispatch_message(message).await;
						}
					}
				}
			}
		}

		info!(room = %room_label, "room pipeline stopped");
	}
}
