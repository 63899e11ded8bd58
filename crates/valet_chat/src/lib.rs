#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod frames;
pub mod sender;
#[cfg(test)]
mod sender_tests;
pub mod session;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::anyhow;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;
use valet_domain::{MessageId, RoomIdent, UserId};

/// Supervisor → session control message.
#[derive(Debug)]
pub enum SessionControl {
	/// Close the connection and stop the session task.
	Shutdown,
}

/// Session → pipeline event message.
#[derive(Debug, Clone)]
pub enum SessionEvent {
	/// A decoded chat event for the session's room.
	Event(Box<EventEnvelope>),

	/// Session status update (connect/disconnect/fatal).
	Status(SessionStatus),
}

/// Typed chat events decoded from transport frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
	MessagePosted {
		message: MessageId,
		user: UserId,
		user_name: String,
		text: String,
		parent: Option<MessageId>,
	},
	MessageEdited {
		message: MessageId,
		user: UserId,
		user_name: String,
		text: String,
	},
	MessageDeleted {
		message: MessageId,
		user: UserId,
	},
	UserEntered {
		user: UserId,
		user_name: String,
	},
	UserLeft {
		user: UserId,
		user_name: String,
	},
}

impl RoomEvent {
	/// The user this event is attributed to.
	pub fn user(&self) -> UserId {
		match self {
			Self::MessagePosted { user, .. }
			| Self::MessageEdited { user, .. }
			| Self::MessageDeleted { user, .. }
			| Self::UserEntered { user, .. }
			| Self::UserLeft { user, .. } => *user,
		}
	}
}

/// Envelope carrying a decoded event through the pipeline.
///
/// `seq` is assigned by the session task in arrival order and is monotonic
/// for the lifetime of the session (it does not reset on reconnect), so
/// `(timestamp, seq)` gives a total, deterministic per-room order.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
	pub room: RoomIdent,

	/// Event timestamp (epoch seconds, service-assigned).
	pub timestamp: u64,

	/// Per-session arrival sequence.
	pub seq: u64,

	/// Connection identifier the event arrived on.
	pub session_id: Option<String>,

	/// Local receipt time (not used for ordering).
	pub received: SystemTime,

	pub event: RoomEvent,
}

impl EventEnvelope {
	pub fn new(room: RoomIdent, timestamp: u64, seq: u64, event: RoomEvent) -> Self {
		Self {
			room,
			timestamp,
			seq,
			session_id: None,
			received: SystemTime::now(),
			event,
		}
	}
}

/// Session status event.
#[derive(Debug, Clone)]
pub struct SessionStatus {
	pub room: RoomIdent,
	pub connected: bool,
	pub detail: String,
	pub last_error: Option<String>,
	/// Fatal statuses mean the session task is exiting and will not retry.
	pub fatal: bool,
	pub time: SystemTime,
}

/// Build a status event.
pub fn status(room: RoomIdent, connected: bool, detail: impl Into<String>) -> SessionEvent {
	SessionEvent::Status(SessionStatus {
		room,
		connected,
		detail: detail.into(),
		last_error: None,
		fatal: false,
		time: SystemTime::now(),
	})
}

/// Build a non-fatal error status event.
pub fn status_error(room: RoomIdent, detail: impl Into<String>, err: impl fmt::Display) -> SessionEvent {
	SessionEvent::Status(SessionStatus {
		room,
		connected: false,
		detail: detail.into(),
		last_error: Some(err.to_string()),
		fatal: false,
		time: SystemTime::now(),
	})
}

/// Build a fatal status event; the session will not reconnect after this.
pub fn status_fatal(room: RoomIdent, detail: impl Into<String>, err: impl fmt::Display) -> SessionEvent {
	SessionEvent::Status(SessionStatus {
		room,
		connected: false,
		detail: detail.into(),
		last_error: Some(err.to_string()),
		fatal: true,
		time: SystemTime::now(),
	})
}

/// Errors produced when posting to a room.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
	#[error("not authenticated for room (no fkey yet)")]
	NotAuthenticated,

	#[error("rate limited; retry after {retry_after:?}")]
	RateLimited { retry_after: Duration },

	#[error("send rejected: {0}")]
	Rejected(String),

	#[error("malformed send response: {0}")]
	MalformedResponse(String),

	#[error("send retries exhausted after {attempts} attempts")]
	RetriesExhausted { attempts: u32 },

	#[error("outbound queue closed")]
	QueueClosed,

	#[error("no outbound sender for room {0}")]
	UnknownRoom(RoomIdent),

	#[error(transparent)]
	Http(#[from] reqwest::Error),
}

impl SendError {
	/// Whether a retry can reasonably succeed.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			Self::RateLimited { .. } | Self::Http(_) | Self::NotAuthenticated
		)
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Per-room auth token (fkey) shared between the session task (writer on
/// each reconnect) and the outbound sender (reader).
#[derive(Debug, Clone, Default)]
pub struct FkeyCell {
	inner: Arc<RwLock<Option<String>>>,
}

impl FkeyCell {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn set(&self, fkey: impl Into<String>) {
		*self.inner.write().await = Some(fkey.into());
	}

	pub async fn get(&self) -> Option<String> {
		self.inner.read().await.clone()
	}

	pub async fn clear(&self) {
		*self.inner.write().await = None;
	}
}

/// The bot's own account id, shared between the sessions (writers on each
/// successful login) and the pipelines (readers, for self-echo filtering).
/// Never cleared on disconnect: the account does not change at runtime.
#[derive(Debug, Clone, Default)]
pub struct SelfUserCell {
	inner: Arc<RwLock<Option<UserId>>>,
}

impl SelfUserCell {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn set(&self, user: UserId) {
		*self.inner.write().await = Some(user);
	}

	pub async fn get(&self) -> Option<UserId> {
		*self.inner.read().await
	}
}

/// Helper types for wiring sessions.
pub type SessionControlTx = mpsc::Sender<SessionControl>;
pub type SessionControlRx = mpsc::Receiver<SessionControl>;
pub type SessionEventTx = mpsc::Sender<SessionEvent>;
pub type SessionEventRx = mpsc::Receiver<SessionEvent>;

/// Build a standard bounded channel pair for one session.
pub fn bounded_session_channels(
	control_capacity: usize,
	events_capacity: usize,
) -> (SessionControlTx, SessionControlRx, SessionEventTx, SessionEventRx) {
	let (control_tx, control_rx) = mpsc::channel(control_capacity);
	let (events_tx, events_rx) = mpsc::channel(events_capacity);
	(control_tx, control_rx, events_tx, events_rx)
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Validate basic envelope invariants.
pub fn validate_envelope(env: &EventEnvelope) -> anyhow::Result<()> {
	if env.room.host.trim().is_empty() {
		return Err(anyhow!("envelope room host must be non-empty"));
	}

	match &env.event {
		RoomEvent::MessagePosted { text, user_name, .. } | RoomEvent::MessageEdited { text, user_name, .. } => {
			if text.trim().is_empty() {
				return Err(anyhow!("message text must be non-empty"));
			}
			if user_name.trim().is_empty() {
				return Err(anyhow!("message user_name must be non-empty"));
			}
		}
		RoomEvent::UserEntered { user_name, .. } | RoomEvent::UserLeft { user_name, .. } => {
			if user_name.trim().is_empty() {
				return Err(anyhow!("presence user_name must be non-empty"));
			}
		}
		RoomEvent::MessageDeleted { .. } => {}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn room() -> RoomIdent {
		RoomIdent::new(11, "chat.example.com", true).expect("valid room")
	}

	#[test]
	fn secret_string_redacts() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.to_string(), "<redacted>");
		assert_eq!(s.expose(), "hunter2");
	}

	#[test]
	fn validate_envelope_rejects_blank_text() {
		let env = EventEnvelope::new(
			room(),
			100,
			1,
			RoomEvent::MessagePosted {
				message: MessageId(1),
				user: UserId(2),
				user_name: "sam".into(),
				text: "   ".into(),
				parent: None,
			},
		);
		assert!(validate_envelope(&env).is_err());
	}

	#[test]
	fn validate_envelope_accepts_delete_without_text() {
		let env = EventEnvelope::new(
			room(),
			100,
			1,
			RoomEvent::MessageDeleted {
				message: MessageId(1),
				user: UserId(2),
			},
		);
		assert!(validate_envelope(&env).is_ok());
	}

	#[tokio::test]
	async fn fkey_cell_read_your_writes() {
		let cell = FkeyCell::new();
		assert!(cell.get().await.is_none());
		cell.set("abc123").await;
		assert_eq!(cell.get().await.as_deref(), Some("abc123"));
		cell.clear().await;
		assert!(cell.get().await.is_none());
	}
}
