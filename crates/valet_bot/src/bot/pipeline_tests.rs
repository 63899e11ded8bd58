#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use valet_chat::{EventEnvelope, RoomEvent, SelfUserCell, SessionEvent, bounded_session_channels, status};
use valet_core::dispatch::{Dispatcher, Responder, UnknownCommandPolicy};
use valet_core::parser::{CommandParser, ParserConfig};
use valet_core::plugin::{Plugin, PluginHost};
use valet_core::registry::EndpointSpec;
use valet_core::room_state::RoomState;
use valet_core::storage::{AdminStore, BanStore, KeyValue, PluginState, StorageError};
use valet_domain::{MessageId, RoomIdent, UserId};

use crate::bot::pipeline::RoomPipeline;
use crate::bot::status_http::BotStatus;
use crate::plugins::dad::DadPlugin;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

const BOT_USER: UserId = UserId(9000);
const ADMIN_USER: u64 = 42;
const PLAIN_USER: u64 = 7;

fn room(id: u64) -> RoomIdent {
	RoomIdent::new(id, "chat.example.com", true).expect("valid room")
}

fn posted(room_id: u64, seq: u64, message_id: u64, user: u64, text: &str) -> SessionEvent {
	SessionEvent::Event(Box::new(EventEnvelope::new(
		room(room_id),
		1_700_000_000 + seq,
		seq,
		RoomEvent::MessagePosted {
			message: MessageId(message_id),
			user: UserId(user),
			user_name: "sam".into(),
			text: text.into(),
			parent: None,
		},
	)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
	Post { room: RoomIdent, text: String },
	Reply { room: RoomIdent, text: String },
}

struct ChannelResponder {
	tx: mpsc::UnboundedSender<Sent>,
}

#[async_trait]
impl Responder for ChannelResponder {
	async fn post(&self, room: &RoomIdent, text: &str) -> anyhow::Result<()> {
		let _ = self.tx.send(Sent::Post {
			room: room.clone(),
			text: text.into(),
		});
		Ok(())
	}

	async fn reply(&self, room: &RoomIdent, _parent: MessageId, text: &str) -> anyhow::Result<()> {
		let _ = self.tx.send(Sent::Reply {
			room: room.clone(),
			text: text.into(),
		});
		Ok(())
	}
}

#[derive(Default)]
struct MemoryAdmins {
	admins: Mutex<Vec<UserId>>,
}

#[async_trait]
impl AdminStore for MemoryAdmins {
	async fn is_admin(&self, _room: Option<&RoomIdent>, user: UserId) -> Result<bool, StorageError> {
		Ok(self.admins.lock().await.contains(&user))
	}

	async fn add(&self, _room: Option<&RoomIdent>, user: UserId) -> Result<(), StorageError> {
		self.admins.lock().await.push(user);
		Ok(())
	}

	async fn remove(&self, _room: Option<&RoomIdent>, _user: UserId) -> Result<(), StorageError> {
		Ok(())
	}

	async fn list(&self, _room: Option<&RoomIdent>) -> Result<Vec<UserId>, StorageError> {
		Ok(self.admins.lock().await.clone())
	}
}

#[derive(Default)]
struct NoBans;

#[async_trait]
impl BanStore for NoBans {
	async fn is_banned(&self, _room: Option<&RoomIdent>, _user: UserId) -> Result<bool, StorageError> {
		Ok(false)
	}

	async fn ban(&self, _room: Option<&RoomIdent>, _user: UserId) -> Result<(), StorageError> {
		Ok(())
	}

	async fn unban(&self, _room: Option<&RoomIdent>, _user: UserId) -> Result<(), StorageError> {
		Ok(())
	}

	async fn list(&self, _room: Option<&RoomIdent>) -> Result<Vec<UserId>, StorageError> {
		Ok(Vec::new())
	}
}

#[derive(Default)]
struct AllEnabled;

#[async_trait]
impl PluginState for AllEnabled {
	async fn is_enabled(&self, _room: Option<&RoomIdent>, _plugin: &str) -> Result<bool, StorageError> {
		Ok(true)
	}

	async fn set_enabled(&self, _room: Option<&RoomIdent>, _plugin: &str, _enabled: bool) -> Result<(), StorageError> {
		Ok(())
	}
}

#[derive(Default)]
struct MemoryKv {
	values: Mutex<HashMap<String, serde_json::Value>>,
}

fn kv_key(room: Option<&RoomIdent>, key: &str) -> String {
	match room {
		Some(room) => format!("{}:{key}", room.storage_key()),
		None => format!("global:{key}"),
	}
}

#[async_trait]
impl KeyValue for MemoryKv {
	async fn exists(&self, room: Option<&RoomIdent>, key: &str) -> Result<bool, StorageError> {
		Ok(self.values.lock().await.contains_key(&kv_key(room, key)))
	}

	async fn get(&self, room: Option<&RoomIdent>, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
		Ok(self.values.lock().await.get(&kv_key(room, key)).cloned())
	}

	async fn set(&self, room: Option<&RoomIdent>, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
		self.values.lock().await.insert(kv_key(room, key), value);
		Ok(())
	}
}

/// Plugin whose handler always fails; used to prove containment.
struct ExplodingPlugin;

#[async_trait]
impl Plugin for ExplodingPlugin {
	fn name(&self) -> &str {
		"Exploding"
	}

	fn description(&self) -> &str {
		"always fails"
	}

	fn command_endpoints(&self) -> Vec<EndpointSpec> {
		vec![EndpointSpec::new("explode", "explode - always fails")]
	}

	async fn handle_command(&self, _command: &valet_core::parser::Command) -> anyhow::Result<()> {
		anyhow::bail!("boom")
	}
}

struct Fixture {
	sent: mpsc::UnboundedReceiver<Sent>,
	kv: Arc<MemoryKv>,
	dispatcher: Arc<Dispatcher>,
	parser: CommandParser,
	status: BotStatus,
}

async fn fixture() -> Fixture {
	let (tx, sent) = mpsc::unbounded_channel();
	let responder: Arc<dyn Responder> = Arc::new(ChannelResponder { tx });

	let admins = Arc::new(MemoryAdmins::default());
	let kv = Arc::new(MemoryKv::default());
	admins.add(None, UserId(ADMIN_USER)).await.expect("seed admin");

	let dad = DadPlugin::new(
		responder.clone(),
		admins,
		kv.clone(),
		reqwest::Client::new(),
		"Valet",
		None,
	)
	.expect("plugin");

	let mut host = PluginHost::new();
	host.register_plugin(Arc::new(dad)).expect("register dad");
	host.register_plugin(Arc::new(ExplodingPlugin)).expect("register exploding");

	let dispatcher = Arc::new(Dispatcher::new(
		Arc::new(host),
		Arc::new(NoBans),
		Arc::new(AllEnabled),
		responder,
		UnknownCommandPolicy::Silent,
	));

	Fixture {
		sent,
		kv,
		dispatcher,
		parser: CommandParser::new(ParserConfig::default()),
		status: BotStatus::new(),
	}
}

fn spawn_pipeline_with(fx: &Fixture, room_id: u64, self_user: SelfUserCell) -> valet_chat::SessionEventTx {
	let (_, _, events_tx, events_rx) = bounded_session_channels(8, 64);
	let pipeline = RoomPipeline::new(
		RoomState::new(room(room_id)),
		fx.parser.clone(),
		fx.dispatcher.clone(),
		fx.status.clone(),
		self_user,
	);
	tokio::spawn(pipeline.run(events_rx));
	events_tx
}

async fn spawn_pipeline(fx: &Fixture, room_id: u64) -> valet_chat::SessionEventTx {
	let self_user = SelfUserCell::new();
	self_user.set(BOT_USER).await;
	spawn_pipeline_with(fx, room_id, self_user)
}

async fn recv_sent(rx: &mut mpsc::UnboundedReceiver<Sent>) -> Sent {
	timeout(RECV_TIMEOUT, rx.recv())
		.await
		.expect("timed out waiting for outbound message")
		.expect("responder channel closed")
}

#[tokio::test]
async fn admin_dad_on_updates_storage_and_announces() {
	let mut fx = fixture().await;
	let events = spawn_pipeline(&fx, 1).await;

	events.send(posted(1, 1, 100, ADMIN_USER, "!!dad on 50")).await.expect("send");

	assert_eq!(
		recv_sent(&mut fx.sent).await,
		Sent::Post {
			room: room(1),
			text: "Dad greeting is now enabled with a frequency of 50".into()
		}
	);
	assert_eq!(
		fx.kv.get(Some(&room(1)), "dadgreet_frequency").await.expect("get"),
		Some(json!(50))
	);
	assert_eq!(fx.kv.get(Some(&room(1)), "dadgreet").await.expect("get"), Some(json!(true)));
}

#[tokio::test]
async fn non_admin_dad_on_is_refused_without_mutation() {
	let mut fx = fixture().await;
	let events = spawn_pipeline(&fx, 1).await;

	events.send(posted(1, 1, 100, PLAIN_USER, "!!dad on 50")).await.expect("send");

	assert_eq!(
		recv_sent(&mut fx.sent).await,
		Sent::Reply {
			room: room(1),
			text: "I'm sorry Dave, I'm afraid I can't do that".into()
		}
	);
	assert_eq!(fx.kv.get(Some(&room(1)), "dadgreet").await.expect("get"), None);
	assert_eq!(fx.kv.get(Some(&room(1)), "dadgreet_frequency").await.expect("get"), None);
}

#[tokio::test]
async fn bots_own_messages_are_never_dispatched() {
	let mut fx = fixture().await;
	let events = spawn_pipeline(&fx, 1).await;

	events
		.send(posted(1, 1, 100, BOT_USER.0, "!!dad on 50"))
		.await
		.expect("send");
	// A later command from a human proves the pipeline is still alive and
	// that the bot's own command produced nothing.
	events
		.send(posted(1, 2, 101, ADMIN_USER, "!!dadgreet status"))
		.await
		.expect("send");

	assert_eq!(
		recv_sent(&mut fx.sent).await,
		Sent::Post {
			room: room(1),
			text: "Dad greeting is currently enabled with a frequency of 1000".into()
		}
	);
}

#[tokio::test]
async fn self_echo_filter_engages_when_a_session_logs_in() {
	let mut fx = fixture().await;

	// A transient startup login failure leaves the cell empty; the first
	// session login fills it before any events flow.
	let self_user = SelfUserCell::new();
	let events = spawn_pipeline_with(&fx, 1, self_user.clone());
	self_user.set(BOT_USER).await;

	events
		.send(posted(1, 1, 100, BOT_USER.0, "!!dad on 50"))
		.await
		.expect("send");
	events
		.send(posted(1, 2, 101, ADMIN_USER, "!!dadgreet status"))
		.await
		.expect("send");

	// The bot's own command produced nothing; only the human's did.
	assert_eq!(
		recv_sent(&mut fx.sent).await,
		Sent::Post {
			room: room(1),
			text: "Dad greeting is currently enabled with a frequency of 1000".into()
		}
	);
}

#[tokio::test]
async fn stale_events_are_not_dispatched() {
	let mut fx = fixture().await;
	let events = spawn_pipeline(&fx, 1).await;

	events
		.send(posted(1, 5, 100, ADMIN_USER, "!!dadgreet status"))
		.await
		.expect("send");
	assert_eq!(
		recv_sent(&mut fx.sent).await,
		Sent::Post {
			room: room(1),
			text: "Dad greeting is currently enabled with a frequency of 1000".into()
		}
	);

	// Replay of the same position must not re-run the command.
	events
		.send(posted(1, 5, 100, ADMIN_USER, "!!dadgreet status"))
		.await
		.expect("send");
	events
		.send(posted(1, 6, 101, ADMIN_USER, "!!dadgreet off"))
		.await
		.expect("send");

	assert_eq!(
		recv_sent(&mut fx.sent).await,
		Sent::Post {
			room: room(1),
			text: "Dad greeting is now disabled".into()
		}
	);
}

#[tokio::test]
async fn failing_handler_is_contained_and_next_command_runs() {
	let mut fx = fixture().await;
	let events = spawn_pipeline(&fx, 1).await;

	events.send(posted(1, 1, 100, ADMIN_USER, "!!explode")).await.expect("send");
	assert_eq!(
		recv_sent(&mut fx.sent).await,
		Sent::Reply {
			room: room(1),
			text: "Something went wrong while running that command.".into()
		}
	);

	events
		.send(posted(1, 2, 101, ADMIN_USER, "!!dadgreet status"))
		.await
		.expect("send");
	assert_eq!(
		recv_sent(&mut fx.sent).await,
		Sent::Post {
			room: room(1),
			text: "Dad greeting is currently enabled with a frequency of 1000".into()
		}
	);
}

#[tokio::test]
async fn rooms_are_isolated() {
	let mut fx = fixture().await;
	let events_a = spawn_pipeline(&fx, 1).await;
	let events_b = spawn_pipeline(&fx, 2).await;

	events_a.send(posted(1, 1, 100, ADMIN_USER, "!!dad on 50")).await.expect("send");
	assert_eq!(
		recv_sent(&mut fx.sent).await,
		Sent::Post {
			room: room(1),
			text: "Dad greeting is now enabled with a frequency of 50".into()
		}
	);

	// Room B still answers while (and after) room A's pipeline worked, and
	// room A's frequency did not leak into room B.
	events_b
		.send(posted(2, 1, 200, ADMIN_USER, "!!dadgreet status"))
		.await
		.expect("send");
	assert_eq!(
		recv_sent(&mut fx.sent).await,
		Sent::Post {
			room: room(2),
			text: "Dad greeting is currently enabled with a frequency of 1000".into()
		}
	);
}

#[tokio::test]
async fn session_status_is_recorded() {
	let fx = fixture().await;
	let events = spawn_pipeline(&fx, 1).await;

	events.send(status(room(1), true, "connected")).await.expect("send");
	drop(events);

	// The pipeline exits once the channel closes, having folded the status.
	let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
	loop {
		let rooms = fx.status.rooms().await;
		if let Some(health) = rooms.get(&room(1).to_string()) {
			assert!(health.connected);
			assert_eq!(health.detail, "connected");
			break;
		}
		if tokio::time::Instant::now() > deadline {
			panic!("status never recorded");
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}
