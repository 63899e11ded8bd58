#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use valet_domain::{MessageId, RoomIdent};

use crate::SendError;
use crate::client::PostMessages;
use crate::sender::{OutboundRouter, SenderConfig, spawn_room_sender};

fn room() -> RoomIdent {
	RoomIdent::new(11, "chat.example.com", true).expect("valid room")
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordedPost {
	text: String,
	parent: Option<MessageId>,
}

/// Scripted backend: pops canned responses, then defaults to success
/// with incrementing ids.
struct FakeBackend {
	calls: Mutex<Vec<RecordedPost>>,
	script: Mutex<VecDeque<Result<MessageId, SendError>>>,
}

impl FakeBackend {
	fn new(script: Vec<Result<MessageId, SendError>>) -> Arc<Self> {
		Arc::new(Self {
			calls: Mutex::new(Vec::new()),
			script: Mutex::new(script.into()),
		})
	}

	async fn calls(&self) -> Vec<RecordedPost> {
		self.calls.lock().await.clone()
	}
}

#[async_trait]
impl PostMessages for FakeBackend {
	async fn post_message(
		&self,
		_room: &RoomIdent,
		text: &str,
		parent: Option<MessageId>,
	) -> Result<MessageId, SendError> {
		let mut calls = self.calls.lock().await;
		calls.push(RecordedPost {
			text: text.to_string(),
			parent,
		});
		let n = calls.len() as u64;
		drop(calls);

		match self.script.lock().await.pop_front() {
			Some(result) => result,
			None => Ok(MessageId(n)),
		}
	}
}

fn fast_config() -> SenderConfig {
	SenderConfig {
		min_interval: Duration::from_millis(100),
		max_attempts: 3,
		retry_backoff: Duration::from_millis(50),
		queue_capacity: 16,
	}
}

#[tokio::test(start_paused = true)]
async fn posts_resolve_in_fifo_order() {
	let backend = FakeBackend::new(Vec::new());
	let sender = spawn_room_sender(room(), backend.clone(), fast_config());

	let first = sender.post("one").await.expect("first post");
	let second = sender.post("two").await.expect("second post");
	let third = sender.post("three").await.expect("third post");

	assert_eq!((first, second, third), (MessageId(1), MessageId(2), MessageId(3)));

	let texts: Vec<String> = backend.calls().await.into_iter().map(|c| c.text).collect();
	assert_eq!(texts, vec!["one", "two", "three"]);
}

#[tokio::test(start_paused = true)]
async fn throttle_retries_the_same_item() {
	let backend = FakeBackend::new(vec![
		Err(SendError::RateLimited {
			retry_after: Duration::from_secs(3),
		}),
		Ok(MessageId(77)),
	]);
	let sender = spawn_room_sender(room(), backend.clone(), fast_config());

	let id = sender.post("patience").await.expect("post after throttle");
	assert_eq!(id, MessageId(77));

	let calls = backend.calls().await;
	assert_eq!(calls.len(), 2);
	assert_eq!(calls[0].text, "patience");
	assert_eq!(calls[1].text, "patience");
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
	let throttle = || {
		Err(SendError::RateLimited {
			retry_after: Duration::from_secs(1),
		})
	};
	let backend = FakeBackend::new(vec![throttle(), throttle(), throttle(), throttle()]);
	let sender = spawn_room_sender(room(), backend.clone(), fast_config());

	let err = sender.post("doomed").await.expect_err("should exhaust retries");
	assert!(matches!(err, SendError::RetriesExhausted { attempts: 3 }), "got {err:?}");
	assert_eq!(backend.calls().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_item_does_not_block_the_queue() {
	let backend = FakeBackend::new(vec![Err(SendError::Rejected("nope".into()))]);
	let sender = spawn_room_sender(room(), backend.clone(), fast_config());

	let err = sender.post("rejected").await.expect_err("rejected post");
	assert!(matches!(err, SendError::Rejected(_)), "got {err:?}");

	let id = sender.post("next").await.expect("queue keeps moving");
	assert_eq!(id, MessageId(2));
}

#[tokio::test(start_paused = true)]
async fn reply_carries_parent_id() {
	let backend = FakeBackend::new(Vec::new());
	let sender = spawn_room_sender(room(), backend.clone(), fast_config());

	sender.reply(MessageId(500), "threaded").await.expect("reply");

	let calls = backend.calls().await;
	assert_eq!(calls[0].parent, Some(MessageId(500)));
}

#[tokio::test(start_paused = true)]
async fn router_rejects_unknown_room() {
	let backend = FakeBackend::new(Vec::new());
	let mut router = OutboundRouter::new();
	router.insert(spawn_room_sender(room(), backend, fast_config()));

	let other = RoomIdent::new(99, "chat.example.com", true).expect("valid room");
	let err = router.post(&other, "lost").await.expect_err("no sender for room");
	assert!(matches!(err, SendError::UnknownRoom(_)), "got {err:?}");

	router.post(&room(), "found").await.expect("known room");
}
