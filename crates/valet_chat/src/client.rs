#![forbid(unsafe_code)]

//! HTTP client for posting messages to chat rooms.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use valet_domain::{MessageId, RoomIdent};

use crate::{FkeyCell, SendError};

/// Fallback delay when a throttle response does not state one.
const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct PostResponse {
	id: u64,
}

/// Thin client over the chat host's message endpoints. Stateless; the
/// per-room fkey is passed in by the caller.
#[derive(Debug, Clone)]
pub struct ChatClient {
	http: reqwest::Client,
}

impl ChatClient {
	pub fn new(http: reqwest::Client) -> Self {
		Self { http }
	}

	/// Post `text` to `room`. `parent` turns the message into a threaded
	/// reply by prefixing the `:{id}` marker the service expects.
	pub async fn post_message(
		&self,
		room: &RoomIdent,
		fkey: &str,
		text: &str,
		parent: Option<MessageId>,
	) -> Result<MessageId, SendError> {
		let url = format!("{}/chats/{}/messages/new", room.http_base(), room.id);
		let body = match parent {
			Some(parent) => format!(":{parent} {text}"),
			None => text.to_string(),
		};

		let response = self
			.http
			.post(&url)
			.form(&[("text", body.as_str()), ("fkey", fkey)])
			.send()
			.await?;

		let status = response.status();
		if status == reqwest::StatusCode::CONFLICT {
			let body = response.text().await.unwrap_or_default();
			return Err(SendError::RateLimited {
				retry_after: parse_retry_after(&body).unwrap_or(DEFAULT_RATE_LIMIT_DELAY),
			});
		}
		if status.is_client_error() {
			let body = response.text().await.unwrap_or_default();
			return Err(SendError::Rejected(if body.is_empty() {
				format!("post returned {status}")
			} else {
				body
			}));
		}
		let response = response.error_for_status()?;

		let body: PostResponse = response
			.json()
			.await
			.map_err(|e| SendError::MalformedResponse(e.to_string()))?;

		Ok(MessageId(body.id))
	}
}

/// Pull the delay out of a throttle body shaped like
/// "you can perform this action again in 12 seconds".
fn parse_retry_after(body: &str) -> Option<Duration> {
	let marker = "again in ";
	let rest = &body[body.find(marker)? + marker.len()..];
	let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
	let seconds: u64 = digits.parse().ok()?;
	Some(Duration::from_secs(seconds))
}

/// Seam between the outbound queue and the wire. The runtime uses
/// [`FkeyedClient`]; sender tests substitute a fake.
#[async_trait]
pub trait PostMessages: Send + Sync {
	async fn post_message(
		&self,
		room: &RoomIdent,
		text: &str,
		parent: Option<MessageId>,
	) -> Result<MessageId, SendError>;
}

/// [`PostMessages`] that reads the current fkey from the shared cell the
/// session task refreshes on each reconnect.
#[derive(Debug, Clone)]
pub struct FkeyedClient {
	client: Arc<ChatClient>,
	fkey: FkeyCell,
}

impl FkeyedClient {
	pub fn new(client: Arc<ChatClient>, fkey: FkeyCell) -> Self {
		Self { client, fkey }
	}
}

#[async_trait]
impl PostMessages for FkeyedClient {
	async fn post_message(
		&self,
		room: &RoomIdent,
		text: &str,
		parent: Option<MessageId>,
	) -> Result<MessageId, SendError> {
		let Some(fkey) = self.fkey.get().await else {
			return Err(SendError::NotAuthenticated);
		};
		self.client.post_message(room, &fkey, text, parent).await
	}
}
