#![forbid(unsafe_code)]

//! Wire frame decoding for the chat websocket.
//!
//! The service multiplexes every subscribed room into one socket. A frame is
//! a JSON object keyed by `"r{room_id}"`; each room slot may carry an `"e"`
//! array of raw events. Frames without any `"e"` array are heartbeats.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use valet_domain::{MessageId, RoomIdent, UserId};

use crate::RoomEvent;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
	#[error("frame is not valid JSON: {0}")]
	Json(#[from] serde_json::Error),
}

/// Raw event as it appears in the `"e"` array.
///
/// Everything beyond the type and timestamp is optional on the wire; which
/// fields are present depends on the event type, and individual events with
/// missing required fields are skipped rather than failing the frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireEvent {
	pub event_type: u32,
	pub time_stamp: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub room_id: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_id: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub message_id: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub parent_id: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub show_parent: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RoomSlot {
	#[serde(default, rename = "e", skip_serializing_if = "Option::is_none")]
	events: Option<Vec<WireEvent>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	t: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	d: Option<u64>,
}

const EV_MESSAGE_POSTED: u32 = 1;
const EV_MESSAGE_EDITED: u32 = 2;
const EV_USER_ENTERED: u32 = 3;
const EV_USER_LEFT: u32 = 4;
const EV_MESSAGE_DELETED: u32 = 10;

/// Decode a raw text frame into `(time_stamp, event)` pairs for `room`.
///
/// Events for other rooms on the same socket are dropped, as are events of
/// unknown types and events missing fields their type requires. Heartbeat
/// frames decode to an empty vec.
pub fn decode_frame(room: &RoomIdent, raw: &str) -> Result<Vec<(u64, RoomEvent)>, DecodeError> {
	let frame: BTreeMap<String, RoomSlot> = serde_json::from_str(raw)?;

	let own_slot = format!("r{}", room.id);
	let mut out = Vec::new();

	for (slot, body) in frame {
		if slot != own_slot {
			continue;
		}
		let Some(events) = body.events else { continue };
		for wire in events {
			// Multi-room sockets tag each event with its room; trust the
			// tag over the slot key when both are present.
			if wire.room_id.is_some_and(|id| id != room.id) {
				continue;
			}
			if let Some(event) = convert(&wire) {
				out.push((wire.time_stamp, event));
			} else {
				tracing::debug!(event_type = wire.event_type, "skipping undecodable event");
			}
		}
	}

	Ok(out)
}

fn convert(wire: &WireEvent) -> Option<RoomEvent> {
	match wire.event_type {
		EV_MESSAGE_POSTED => Some(RoomEvent::MessagePosted {
			message: MessageId(wire.message_id?),
			user: UserId(wire.user_id?),
			user_name: wire.user_name.clone()?,
			text: wire.content.clone()?,
			parent: wire.parent_id.map(MessageId),
		}),
		EV_MESSAGE_EDITED => Some(RoomEvent::MessageEdited {
			message: MessageId(wire.message_id?),
			user: UserId(wire.user_id?),
			user_name: wire.user_name.clone()?,
			text: wire.content.clone()?,
		}),
		EV_USER_ENTERED => Some(RoomEvent::UserEntered {
			user: UserId(wire.user_id?),
			user_name: wire.user_name.clone()?,
		}),
		EV_USER_LEFT => Some(RoomEvent::UserLeft {
			user: UserId(wire.user_id?),
			user_name: wire.user_name.clone()?,
		}),
		EV_MESSAGE_DELETED => Some(RoomEvent::MessageDeleted {
			message: MessageId(wire.message_id?),
			user: UserId(wire.user_id?),
		}),
		_ => None,
	}
}

/// Encode events into the wire frame format. Used by tests and the local
/// loopback server; the bot itself never produces frames.
pub fn encode_frame(room: &RoomIdent, events: &[WireEvent]) -> String {
	let mut frame: BTreeMap<String, RoomSlot> = BTreeMap::new();
	frame.insert(
		format!("r{}", room.id),
		RoomSlot {
			events: Some(events.to_vec()),
			t: None,
			d: None,
		},
	);
	// Serializing a map of plain structs cannot fail.
	serde_json::to_string(&frame).unwrap_or_default()
}
