#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use valet_chat::auth::{AuthError, Authenticator, Credentials, Fkey, SessionToken};
use valet_chat::frames::{WireEvent, encode_frame};
use valet_chat::session::{RoomSession, SessionConfig};
use valet_chat::{FkeyCell, RoomEvent, SecretString, SelfUserCell, SessionControl, SessionEvent, bounded_session_channels};
use valet_domain::{RoomIdent, UserId};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn room(id: u64) -> RoomIdent {
	RoomIdent::new(id, "127.0.0.1", false).expect("valid room")
}

fn posted(room_id: u64, message_id: u64, text: &str) -> WireEvent {
	WireEvent {
		event_type: 1,
		time_stamp: 1_700_000_000 + message_id,
		room_id: Some(room_id),
		user_id: Some(42),
		user_name: Some("sam".into()),
		message_id: Some(message_id),
		content: Some(text.into()),
		..WireEvent::default()
	}
}

fn credentials() -> Credentials {
	Credentials {
		email: "bot@example.com".into(),
		password: SecretString::new("hunter2"),
	}
}

/// Authenticator that skips HTTP and points the socket at a local server.
struct LocalAuth {
	ws_url: String,
	logins: AtomicU32,
}

impl LocalAuth {
	fn new(ws_url: String) -> Arc<Self> {
		Arc::new(Self {
			ws_url,
			logins: AtomicU32::new(0),
		})
	}
}

#[async_trait]
impl Authenticator for LocalAuth {
	async fn login(&self, _room: &RoomIdent, _credentials: &Credentials) -> Result<SessionToken, AuthError> {
		let n = self.logins.fetch_add(1, Ordering::SeqCst);
		Ok(SessionToken {
			secret: SecretString::new(format!("token-{n}")),
			user: UserId(9000),
		})
	}

	async fn room_fkey(&self, room: &RoomIdent, _token: &SessionToken) -> Result<Fkey, AuthError> {
		Ok(Fkey(format!("fkey-{}", room.id)))
	}

	async fn ws_url(&self, _room: &RoomIdent, _token: &SessionToken, _fkey: &Fkey) -> Result<String, AuthError> {
		Ok(self.ws_url.clone())
	}
}

/// Authenticator whose login always fails with a rejection.
struct RejectingAuth;

#[async_trait]
impl Authenticator for RejectingAuth {
	async fn login(&self, _room: &RoomIdent, _credentials: &Credentials) -> Result<SessionToken, AuthError> {
		Err(AuthError::Rejected("bad password".into()))
	}

	async fn room_fkey(&self, _room: &RoomIdent, _token: &SessionToken) -> Result<Fkey, AuthError> {
		unreachable!("login never succeeds")
	}

	async fn ws_url(&self, _room: &RoomIdent, _token: &SessionToken, _fkey: &Fkey) -> Result<String, AuthError> {
		unreachable!("login never succeeds")
	}
}

fn fast_session_config() -> SessionConfig {
	let mut cfg = SessionConfig::new(credentials());
	cfg.reconnect_min_delay = Duration::from_millis(20);
	cfg.reconnect_max_delay = Duration::from_millis(100);
	cfg.keepalive_timeout = Duration::from_secs(30);
	cfg
}

async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<SessionEvent>) -> SessionEvent {
	timeout(RECV_TIMEOUT, rx.recv())
		.await
		.expect("timed out waiting for session event")
		.expect("session channel closed")
}

/// Drain status updates until the next decoded event arrives.
async fn next_envelope(rx: &mut tokio::sync::mpsc::Receiver<SessionEvent>) -> valet_chat::EventEnvelope {
	loop {
		match next_event(rx).await {
			SessionEvent::Event(env) => return *env,
			SessionEvent::Status(_) => {}
		}
	}
}

#[tokio::test]
async fn delivers_events_in_arrival_order() {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");

	let server = tokio::spawn(async move {
		let (stream, _) = listener.accept().await.expect("accept");
		let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws handshake");
		let frame = encode_frame(&room(7), &[posted(7, 100, "first"), posted(7, 101, "second")]);
		ws.send(WsMessage::Text(frame.into())).await.expect("send frame");
		// Hold the socket open until the client goes away.
		while ws.next().await.is_some() {}
	});

	let auth = LocalAuth::new(format!("ws://{addr}"));
	let fkey = FkeyCell::new();
	let self_user = SelfUserCell::new();
	let (control_tx, control_rx, events_tx, mut events_rx) = bounded_session_channels(8, 64);
	let session = RoomSession::new(room(7), fast_session_config(), auth, fkey.clone(), self_user.clone());
	let handle = tokio::spawn(session.run(control_rx, events_tx));

	let first = next_envelope(&mut events_rx).await;
	let second = next_envelope(&mut events_rx).await;

	assert!(matches!(&first.event, RoomEvent::MessagePosted { text, .. } if text == "first"));
	assert!(matches!(&second.event, RoomEvent::MessagePosted { text, .. } if text == "second"));
	assert!(first.seq < second.seq);
	assert!(first.session_id.is_some());
	assert_eq!(first.session_id, second.session_id);

	// Login refreshed the room's write token and published the account id.
	assert_eq!(fkey.get().await.as_deref(), Some("fkey-7"));
	assert_eq!(self_user.get().await, Some(UserId(9000)));

	control_tx.send(SessionControl::Shutdown).await.expect("shutdown");
	timeout(RECV_TIMEOUT, handle)
		.await
		.expect("session did not stop")
		.expect("session task panicked")
		.expect("session returned error");
	server.abort();
}

#[tokio::test]
async fn reconnects_after_server_close_with_fresh_login() {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");

	let server = tokio::spawn(async move {
		// First connection: one event, then drop.
		let (stream, _) = listener.accept().await.expect("accept #1");
		let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws handshake #1");
		let frame = encode_frame(&room(7), &[posted(7, 100, "before drop")]);
		ws.send(WsMessage::Text(frame.into())).await.expect("send frame #1");
		drop(ws);

		// Second connection after the client backs off and retries.
		let (stream, _) = listener.accept().await.expect("accept #2");
		let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws handshake #2");
		let frame = encode_frame(&room(7), &[posted(7, 101, "after reconnect")]);
		ws.send(WsMessage::Text(frame.into())).await.expect("send frame #2");
		while ws.next().await.is_some() {}
	});

	let auth = LocalAuth::new(format!("ws://{addr}"));
	let self_user = SelfUserCell::new();
	let (control_tx, control_rx, events_tx, mut events_rx) = bounded_session_channels(8, 64);
	let session = RoomSession::new(room(7), fast_session_config(), auth.clone(), FkeyCell::new(), self_user.clone());
	let handle = tokio::spawn(session.run(control_rx, events_tx));

	let first = next_envelope(&mut events_rx).await;
	let second = next_envelope(&mut events_rx).await;

	// The session, not a startup probe, fills in the account id.
	assert_eq!(self_user.get().await, Some(UserId(9000)));

	assert!(matches!(&first.event, RoomEvent::MessagePosted { text, .. } if text == "before drop"));
	assert!(matches!(&second.event, RoomEvent::MessagePosted { text, .. } if text == "after reconnect"));

	// seq keeps climbing across the reconnect; the connection id changes.
	assert!(first.seq < second.seq);
	assert_ne!(first.session_id, second.session_id);
	assert!(auth.logins.load(Ordering::SeqCst) >= 2, "expected a login per connection");

	control_tx.send(SessionControl::Shutdown).await.expect("shutdown");
	timeout(RECV_TIMEOUT, handle)
		.await
		.expect("session did not stop")
		.expect("session task panicked")
		.expect("session returned error");
	server.abort();
}

#[tokio::test]
async fn rejected_credentials_stop_the_session() {
	let (_control_tx, control_rx, events_tx, mut events_rx) = bounded_session_channels(8, 64);
	let session = RoomSession::new(
		room(7),
		fast_session_config(),
		Arc::new(RejectingAuth),
		FkeyCell::new(),
		SelfUserCell::new(),
	);
	let handle = tokio::spawn(session.run(control_rx, events_tx));

	let fatal = loop {
		match next_event(&mut events_rx).await {
			SessionEvent::Status(status) if status.fatal => break status,
			_ => {}
		}
	};
	assert!(fatal.last_error.as_deref().is_some_and(|e| e.contains("bad password")));

	let result = timeout(RECV_TIMEOUT, handle)
		.await
		.expect("session did not stop")
		.expect("session task panicked");
	assert!(result.is_err(), "fatal auth failure must surface as an error");
}

#[tokio::test]
async fn two_rooms_run_independently() {
	let listener_a = TcpListener::bind("127.0.0.1:0").await.expect("bind a");
	let listener_b = TcpListener::bind("127.0.0.1:0").await.expect("bind b");
	let addr_a = listener_a.local_addr().expect("local addr a");
	let addr_b = listener_b.local_addr().expect("local addr b");

	let serve = |listener: TcpListener, room_id: u64, text: &'static str| {
		tokio::spawn(async move {
			let (stream, _) = listener.accept().await.expect("accept");
			let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws handshake");
			let frame = encode_frame(&room(room_id), &[posted(room_id, 100, text)]);
			ws.send(WsMessage::Text(frame.into())).await.expect("send frame");
			while ws.next().await.is_some() {}
		})
	};
	let server_a = serve(listener_a, 1, "room one");
	let server_b = serve(listener_b, 2, "room two");

	let (control_tx_a, control_rx_a, events_tx_a, mut events_rx_a) = bounded_session_channels(8, 64);
	let (control_tx_b, control_rx_b, events_tx_b, mut events_rx_b) = bounded_session_channels(8, 64);

	let session_a = RoomSession::new(
		room(1),
		fast_session_config(),
		LocalAuth::new(format!("ws://{addr_a}")),
		FkeyCell::new(),
		SelfUserCell::new(),
	);
	let session_b = RoomSession::new(
		room(2),
		fast_session_config(),
		LocalAuth::new(format!("ws://{addr_b}")),
		FkeyCell::new(),
		SelfUserCell::new(),
	);
	let handle_a = tokio::spawn(session_a.run(control_rx_a, events_tx_a));
	let handle_b = tokio::spawn(session_b.run(control_rx_b, events_tx_b));

	let env_a = next_envelope(&mut events_rx_a).await;
	let env_b = next_envelope(&mut events_rx_b).await;

	assert_eq!(env_a.room, room(1));
	assert_eq!(env_b.room, room(2));
	assert!(matches!(&env_a.event, RoomEvent::MessagePosted { text, .. } if text == "room one"));
	assert!(matches!(&env_b.event, RoomEvent::MessagePosted { text, .. } if text == "room two"));

	control_tx_a.send(SessionControl::Shutdown).await.expect("shutdown a");
	control_tx_b.send(SessionControl::Shutdown).await.expect("shutdown b");
	let _ = timeout(RECV_TIMEOUT, handle_a).await.expect("session a did not stop");
	let _ = timeout(RECV_TIMEOUT, handle_b).await.expect("session b did not stop");
	server_a.abort();
	server_b.abort();
}
