#![forbid(unsafe_code)]

//! Per-room derived state.
//!
//! Each room keeps a bounded window of recent messages plus the current
//! participant set, folded from the session's event stream. Events apply in
//! `(timestamp, seq)` order; because `seq` is assigned in arrival order and
//! breaks timestamp ties, replaying the same stream always folds to the
//! same state.

use std::collections::{BTreeMap, VecDeque};

use valet_chat::{EventEnvelope, RoomEvent};
use valet_domain::{MessageId, RoomIdent, UserId};

pub const DEFAULT_WINDOW_CAP: usize = 500;

/// A chat message as the bot saw it, after event folding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub id: MessageId,
	pub room: RoomIdent,
	pub user: UserId,
	pub user_name: String,
	pub text: String,
	pub timestamp: u64,
	pub parent: Option<MessageId>,
}

impl Message {
	/// Build a message from a posted-message envelope. Other event kinds
	/// carry no message body and yield `None`.
	pub fn from_envelope(env: &EventEnvelope) -> Option<Self> {
		match &env.event {
			RoomEvent::MessagePosted {
				message,
				user,
				user_name,
				text,
				parent,
			} => Some(Self {
				id: *message,
				room: env.room.clone(),
				user: *user,
				user_name: user_name.clone(),
				text: text.clone(),
				timestamp: env.timestamp,
				parent: *parent,
			}),
			_ => None,
		}
	}
}

/// Outcome of [`RoomState::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
	/// The event advanced the room state.
	Applied,
	/// The event was at or behind the last applied position and was ignored.
	Stale,
}

#[derive(Debug)]
pub struct RoomState {
	room: RoomIdent,
	last_applied: Option<(u64, u64)>,
	participants: BTreeMap<UserId, String>,
	window: VecDeque<Message>,
	cap: usize,
}

impl RoomState {
	pub fn new(room: RoomIdent) -> Self {
		Self::with_capacity(room, DEFAULT_WINDOW_CAP)
	}

	pub fn with_capacity(room: RoomIdent, cap: usize) -> Self {
		Self {
			room,
			last_applied: None,
			participants: BTreeMap::new(),
			window: VecDeque::new(),
			cap: cap.max(1),
		}
	}

	pub fn room(&self) -> &RoomIdent {
		&self.room
	}

	/// Fold one envelope into the state.
	pub fn apply(&mut self, env: &EventEnvelope) -> Applied {
		debug_assert_eq!(env.room, self.room);

		let pos = (env.timestamp, env.seq);
		if self.last_applied.is_some_and(|last| pos <= last) {
			metrics::counter!("valet_room_state_stale_total", "room" => self.room.to_string()).increment(1);
			return Applied::Stale;
		}
		self.last_applied = Some(pos);

		match &env.event {
			RoomEvent::MessagePosted { .. } => {
				if let Some(message) = Message::from_envelope(env) {
					// A post also proves presence.
					self.participants.insert(message.user, message.user_name.clone());
					self.window.push_back(message);
					while self.window.len() > self.cap {
						self.window.pop_front();
					}
				}
			}
			RoomEvent::MessageEdited {
				message,
				user,
				user_name,
				text,
			} => {
				// Edits to messages outside the window are ignored.
				if let Some(existing) = self.window.iter_mut().find(|m| m.id == *message) {
					existing.text = text.clone();
					existing.user = *user;
					existing.user_name = user_name.clone();
				}
			}
			RoomEvent::MessageDeleted { message, .. } => {
				self.window.retain(|m| m.id != *message);
			}
			RoomEvent::UserEntered { user, user_name } => {
				self.participants.insert(*user, user_name.clone());
			}
			RoomEvent::UserLeft { user, .. } => {
				self.participants.remove(user);
			}
		}

		Applied::Applied
	}

	pub fn message(&self, id: MessageId) -> Option<&Message> {
		self.window.iter().find(|m| m.id == id)
	}

	pub fn recent_messages(&self) -> impl Iterator<Item = &Message> {
		self.window.iter()
	}

	pub fn participants(&self) -> &BTreeMap<UserId, String> {
		&self.participants
	}

	pub fn last_applied(&self) -> Option<(u64, u64)> {
		self.last_applied
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn room() -> RoomIdent {
		RoomIdent::new(11, "chat.example.com", true).expect("valid room")
	}

	fn posted(ts: u64, seq: u64, id: u64, user: u64, name: &str, text: &str) -> EventEnvelope {
		EventEnvelope::new(
			room(),
			ts,
			seq,
			RoomEvent::MessagePosted {
				message: MessageId(id),
				user: UserId(user),
				user_name: name.into(),
				text: text.into(),
				parent: None,
			},
		)
	}

	#[test]
	fn folds_posts_and_presence() {
		let mut state = RoomState::new(room());

		assert_eq!(
			state.apply(&EventEnvelope::new(
				room(),
				10,
				1,
				RoomEvent::UserEntered {
					user: UserId(1),
					user_name: "sam".into()
				}
			)),
			Applied::Applied
		);
		assert_eq!(state.apply(&posted(11, 2, 100, 1, "sam", "hello")), Applied::Applied);
		assert_eq!(
			state.apply(&EventEnvelope::new(
				room(),
				12,
				3,
				RoomEvent::UserLeft {
					user: UserId(1),
					user_name: "sam".into()
				}
			)),
			Applied::Applied
		);

		assert!(state.participants().is_empty());
		assert_eq!(state.message(MessageId(100)).map(|m| m.text.as_str()), Some("hello"));
	}

	#[test]
	fn stale_events_are_ignored() {
		let mut state = RoomState::new(room());
		assert_eq!(state.apply(&posted(20, 5, 100, 1, "sam", "current")), Applied::Applied);

		// Older timestamp, and equal position, both stale.
		assert_eq!(state.apply(&posted(19, 6, 101, 1, "sam", "late")), Applied::Stale);
		assert_eq!(state.apply(&posted(20, 5, 102, 1, "sam", "replay")), Applied::Stale);

		// Same timestamp with a later seq advances.
		assert_eq!(state.apply(&posted(20, 6, 103, 1, "sam", "tie-break")), Applied::Applied);
		assert_eq!(state.last_applied(), Some((20, 6)));
		assert!(state.message(MessageId(101)).is_none());
	}

	#[test]
	fn edits_rewrite_in_place_and_unknown_ids_are_ignored() {
		let mut state = RoomState::new(room());
		state.apply(&posted(10, 1, 100, 1, "sam", "tpyo"));

		let edit = EventEnvelope::new(
			room(),
			11,
			2,
			RoomEvent::MessageEdited {
				message: MessageId(100),
				user: UserId(1),
				user_name: "sam".into(),
				text: "typo".into(),
			},
		);
		assert_eq!(state.apply(&edit), Applied::Applied);
		assert_eq!(state.message(MessageId(100)).map(|m| m.text.as_str()), Some("typo"));

		let ghost_edit = EventEnvelope::new(
			room(),
			12,
			3,
			RoomEvent::MessageEdited {
				message: MessageId(999),
				user: UserId(1),
				user_name: "sam".into(),
				text: "never seen".into(),
			},
		);
		assert_eq!(state.apply(&ghost_edit), Applied::Applied);
		assert!(state.message(MessageId(999)).is_none());
	}

	#[test]
	fn deletes_drop_from_window() {
		let mut state = RoomState::new(room());
		state.apply(&posted(10, 1, 100, 1, "sam", "going away"));

		let delete = EventEnvelope::new(
			room(),
			11,
			2,
			RoomEvent::MessageDeleted {
				message: MessageId(100),
				user: UserId(1),
			},
		);
		assert_eq!(state.apply(&delete), Applied::Applied);
		assert!(state.message(MessageId(100)).is_none());
	}

	#[test]
	fn window_is_bounded() {
		let mut state = RoomState::with_capacity(room(), 3);
		for i in 0..10u64 {
			state.apply(&posted(10 + i, 1 + i, 100 + i, 1, "sam", "msg"));
		}
		assert_eq!(state.recent_messages().count(), 3);
		assert!(state.message(MessageId(100)).is_none());
		assert!(state.message(MessageId(109)).is_some());
	}

	#[test]
	fn same_events_fold_to_same_state() {
		// Two replicas receiving the identical arrival order agree.
		let events = vec![
			posted(10, 1, 100, 1, "sam", "a"),
			posted(10, 2, 101, 2, "robin", "b"),
			posted(10, 3, 102, 1, "sam", "c"),
		];

		let mut a = RoomState::new(room());
		let mut b = RoomState::new(room());
		for env in &events {
			a.apply(env);
			b.apply(env);
		}

		let texts = |s: &RoomState| s.recent_messages().map(|m| m.text.clone()).collect::<Vec<_>>();
		assert_eq!(texts(&a), texts(&b));
		assert_eq!(a.participants(), b.participants());
		assert_eq!(a.last_applied(), b.last_applied());
	}
}
