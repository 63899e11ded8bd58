#![forbid(unsafe_code)]

//! Per-room outbound message queue.
//!
//! Sends for a room are serialized through one consumer task so the
//! client-side pacing interval holds regardless of how many plugins post
//! concurrently. Server throttles sleep out the stated delay and retry the
//! same item; the queue stays FIFO throughout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, warn};
use valet_domain::{MessageId, RoomIdent};

use crate::SendError;
use crate::client::PostMessages;

#[derive(Debug, Clone)]
pub struct SenderConfig {
	/// Minimum spacing between consecutive posts to one room.
	pub min_interval: Duration,
	/// Attempts per item before giving up with `RetriesExhausted`.
	pub max_attempts: u32,
	/// Delay between retries for transient failures other than throttles.
	pub retry_backoff: Duration,
	pub queue_capacity: usize,
}

impl Default for SenderConfig {
	fn default() -> Self {
		Self {
			min_interval: Duration::from_secs(1),
			max_attempts: 5,
			retry_backoff: Duration::from_secs(2),
			queue_capacity: 64,
		}
	}
}

#[derive(Debug)]
enum SendKind {
	Post,
	Reply(MessageId),
}

struct QueueItem {
	kind: SendKind,
	text: String,
	resp: oneshot::Sender<Result<MessageId, SendError>>,
}

/// Clone-able handle to one room's outbound queue.
#[derive(Clone)]
pub struct OutboundSender {
	room: RoomIdent,
	tx: mpsc::Sender<QueueItem>,
}

impl OutboundSender {
	pub fn room(&self) -> &RoomIdent {
		&self.room
	}

	/// Queue a plain message; resolves with the posted message id.
	pub async fn post(&self, text: impl Into<String>) -> Result<MessageId, SendError> {
		self.enqueue(SendKind::Post, text.into()).await
	}

	/// Queue a threaded reply to `parent`.
	pub async fn reply(&self, parent: MessageId, text: impl Into<String>) -> Result<MessageId, SendError> {
		self.enqueue(SendKind::Reply(parent), text.into()).await
	}

	async fn enqueue(&self, kind: SendKind, text: String) -> Result<MessageId, SendError> {
		let (resp_tx, resp_rx) = oneshot::channel();
		self.tx
			.send(QueueItem { kind, text, resp: resp_tx })
			.await
			.map_err(|_| SendError::QueueClosed)?;
		resp_rx.await.map_err(|_| SendError::QueueClosed)?
	}
}

/// Spawn the consumer task for one room and hand back its queue handle.
/// The task exits when every handle is dropped.
pub fn spawn_room_sender(room: RoomIdent, backend: Arc<dyn PostMessages>, cfg: SenderConfig) -> OutboundSender {
	let (tx, mut rx) = mpsc::channel::<QueueItem>(cfg.queue_capacity);
	let handle = OutboundSender { room: room.clone(), tx };

	tokio::spawn(async move {
		let room_label = room.to_string();

		while let Some(item) = rx.recv().await {
			let parent = match item.kind {
				SendKind::Post => None,
				SendKind::Reply(parent) => Some(parent),
			};

			let mut attempt: u32 = 0;
			let result = loop {
				attempt += 1;
				match backend.post_message(&room, &item.text, parent).await {
					Ok(id) => {
						metrics::counter!("valet_outbound_sent_total", "room" => room_label.clone()).increment(1);
						break Ok(id);
					}
					Err(SendError::RateLimited { retry_after }) if attempt < cfg.max_attempts => {
						metrics::counter!("valet_outbound_throttled_total", "room" => room_label.clone()).increment(1);
						debug!(room = %room_label, ?retry_after, attempt, "throttled; waiting before retry");
						sleep(retry_after).await;
					}
					Err(e) if e.is_transient() && attempt < cfg.max_attempts => {
						debug!(room = %room_label, error = %e, attempt, "transient send failure; retrying");
						sleep(cfg.retry_backoff).await;
					}
					Err(e) if attempt >= cfg.max_attempts && e.is_transient() => {
						warn!(room = %room_label, error = %e, attempt, "giving up on outbound message");
						metrics::counter!("valet_outbound_failed_total", "room" => room_label.clone()).increment(1);
						break Err(SendError::RetriesExhausted { attempts: attempt });
					}
					Err(e) => {
						warn!(room = %room_label, error = %e, "outbound message rejected");
						metrics::counter!("valet_outbound_failed_total", "room" => room_label.clone()).increment(1);
						break Err(e);
					}
				}
			};

			// Caller may have gone away; pacing still applies either way.
			let _ = item.resp.send(result);
			sleep(cfg.min_interval).await;
		}

		debug!(room = %room_label, "outbound sender stopped");
	});

	handle
}

/// Routes outbound messages to the right room's queue.
#[derive(Clone, Default)]
pub struct OutboundRouter {
	by_room: HashMap<RoomIdent, OutboundSender>,
}

impl OutboundRouter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, sender: OutboundSender) {
		self.by_room.insert(sender.room().clone(), sender);
	}

	pub fn get(&self, room: &RoomIdent) -> Option<&OutboundSender> {
		self.by_room.get(room)
	}

	pub async fn post(&self, room: &RoomIdent, text: impl Into<String>) -> Result<MessageId, SendError> {
		match self.by_room.get(room) {
			Some(sender) => sender.post(text).await,
			None => Err(SendError::UnknownRoom(room.clone())),
		}
	}

	pub async fn reply(&self, room: &RoomIdent, parent: MessageId, text: impl Into<String>) -> Result<MessageId, SendError> {
		match self.by_room.get(room) {
			Some(sender) => sender.reply(parent, text).await,
			None => Err(SendError::UnknownRoom(room.clone())),
		}
	}

	pub fn rooms(&self) -> impl Iterator<Item = &RoomIdent> {
		self.by_room.keys()
	}
}
