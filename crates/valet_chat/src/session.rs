#![forbid(unsafe_code)]

//! Persistent per-room streaming session.
//!
//! One task per room owns the websocket for that room's lifetime. The outer
//! loop authenticates, connects, and pumps frames; any transport failure
//! falls back to the outer loop, which reconnects with jittered exponential
//! backoff. Decoded events are delivered to the pipeline in arrival order
//! over a bounded channel (`send().await`, never `try_send`, so ordering
//! survives backpressure). Status updates are best-effort.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;
use valet_domain::{RoomIdent, UserId};

use crate::auth::{AuthError, Authenticator, Credentials};
use crate::frames::decode_frame;
use crate::{
	EventEnvelope, FkeyCell, SelfUserCell, SessionControl, SessionControlRx, SessionEvent, SessionEventTx,
	new_session_id, status, status_error, status_fatal,
};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type RoomWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<RoomWs>> + Send + Sync>;

#[derive(Clone)]
pub struct SessionConfig {
	pub credentials: Credentials,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// Reconnect if no frame (heartbeats included) arrives within this window.
	pub keepalive_timeout: Duration,
	/// Test seam; `None` uses a plain `connect_async`.
	pub ws_connector: Option<WsConnector>,
}

impl SessionConfig {
	pub fn new(credentials: Credentials) -> Self {
		Self {
			credentials,
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			keepalive_timeout: Duration::from_secs(60),
			ws_connector: None,
		}
	}
}

pub struct RoomSession {
	room: RoomIdent,
	cfg: SessionConfig,
	auth: Arc<dyn Authenticator>,
	fkey: FkeyCell,
	self_user: SelfUserCell,
}

impl RoomSession {
	pub fn new(
		room: RoomIdent,
		cfg: SessionConfig,
		auth: Arc<dyn Authenticator>,
		fkey: FkeyCell,
		self_user: SelfUserCell,
	) -> Self {
		Self {
			room,
			cfg,
			auth,
			fkey,
			self_user,
		}
	}

	fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
		let pow = attempt.min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		let base = d.min(max).max(min);

		// Spread reconnect storms out with +-10% jitter.
		let base_ms = base.as_millis() as u64;
		let jitter_span = (base_ms / 10).max(1);
		let jittered = base_ms.saturating_sub(jitter_span / 2) + rand::rng().random_range(0..=jitter_span);
		Duration::from_millis(jittered)
	}

	async fn connect_plain(url: Url) -> anyhow::Result<RoomWs> {
		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.context("connect_async to chat ws")?;
		Ok(ws)
	}

	fn ws_connector(&self) -> WsConnector {
		if let Some(c) = &self.cfg.ws_connector {
			return c.clone();
		}
		Arc::new(|url: Url| Box::pin(Self::connect_plain(url)) as BoxFuture<'static, anyhow::Result<RoomWs>>)
	}

	/// Login, fetch the room fkey, and resolve the socket URL.
	///
	/// Runs once per connection attempt so every reconnect gets fresh
	/// tokens. The fkey cell is refreshed as a side effect so in-flight
	/// sends pick up the new write token.
	async fn authenticate(&self) -> Result<(UserId, Url), AuthError> {
		let token = self.auth.login(&self.room, &self.cfg.credentials).await?;
		let fkey = self.auth.room_fkey(&self.room, &token).await?;
		let ws_url = self.auth.ws_url(&self.room, &token, &fkey).await?;

		self.fkey.set(fkey.0).await;

		let url = Url::parse(&ws_url).map_err(|e| AuthError::MalformedResponse(format!("ws url: {e}")))?;
		Ok((token.user, url))
	}

	pub async fn run(self, mut control_rx: SessionControlRx, events_tx: SessionEventTx) -> anyhow::Result<()> {
		let room = self.room.clone();
		let room_label = room.to_string();
		let connector = self.ws_connector();

		let _ = events_tx.try_send(status(room.clone(), false, "session starting"));

		let mut reconnect_attempt: u32 = 0;
		// Monotonic across reconnects so (timestamp, seq) stays a total order.
		let mut seq: u64 = 0;

		'outer: loop {
			if reconnect_attempt > 0 {
				let delay = Self::backoff_delay(reconnect_attempt, self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay);
				let _ = events_tx.try_send(status(
					room.clone(),
					false,
					format!("reconnecting in {delay:?} (attempt={reconnect_attempt})"),
				));
				metrics::counter!("valet_session_reconnects_total", "room" => room_label.clone()).increment(1);

				tokio::select! {
					_ = sleep(delay) => {}
					cmd = control_rx.recv() => {
						match cmd {
							Some(SessionControl::Shutdown) | None => break 'outer,
						}
					}
				}
			}

			let (user, ws_url) = match self.authenticate().await {
				Ok(ok) => ok,
				Err(e @ AuthError::Rejected(_)) => {
					// Bad credentials never heal on retry.
					warn!(room = %room_label, error = %e, "credentials rejected; session stopping");
					let _ = events_tx.try_send(status_fatal(room.clone(), "credentials rejected", &e));
					return Err(e.into());
				}
				Err(e) => {
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					let _ = events_tx.try_send(status_error(room.clone(), "authentication failed", e));
					continue;
				}
			};
			// Every successful login republishes the account id, so the
			// pipeline's self-echo filter works even if the startup probe
			// failed.
			self.self_user.set(user).await;

			let mut ws: RoomWs = match connector(ws_url).await {
				Ok(ws) => ws,
				Err(e) => {
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					let _ = events_tx.try_send(status_error(room.clone(), "failed to connect chat ws", e));
					continue;
				}
			};

			reconnect_attempt = 0;
			let session_id = new_session_id();
			info!(room = %room_label, session_id, "chat ws connected");
			let _ = events_tx.try_send(status(room.clone(), true, format!("connected (session_id={session_id})")));
			metrics::counter!("valet_session_connects_total", "room" => room_label.clone()).increment(1);

			let mut last_activity = Instant::now();

			loop {
				tokio::select! {
					cmd = control_rx.recv() => {
						match cmd {
							Some(SessionControl::Shutdown) | None => {
								info!(room = %room_label, "session received shutdown");
								let _ = ws.close(None).await;
								break 'outer;
							}
						}
					}

					frame = ws.next() => {
						match frame {
							Some(Ok(WsMessage::Text(text))) => {
								last_activity = Instant::now();
								match decode_frame(&room, &text) {
									Ok(events) => {
										for (timestamp, event) in events {
											seq += 1;
											let mut env = EventEnvelope::new(room.clone(), timestamp, seq, event);
											env.session_id = Some(session_id.clone());
											metrics::counter!("valet_session_events_total", "room" => room_label.clone())
												.increment(1);
											if events_tx.send(SessionEvent::Event(Box::new(env))).await.is_err() {
												// Pipeline gone; nothing left to serve.
												break 'outer;
											}
										}
									}
									Err(e) => {
										metrics::counter!("valet_session_decode_errors_total", "room" => room_label.clone())
											.increment(1);
										debug!(room = %room_label, error = %e, "undecodable frame");
									}
								}
							}
							Some(Ok(WsMessage::Ping(payload))) => {
								last_activity = Instant::now();
								let _ = ws.send(WsMessage::Pong(payload)).await;
							}
							Some(Ok(WsMessage::Pong(_))) => {
								last_activity = Instant::now();
							}
							Some(Ok(WsMessage::Close(frame))) => {
								let _ = events_tx.try_send(status(
									room.clone(),
									false,
									format!("server closed connection: {frame:?}"),
								));
								reconnect_attempt = 1;
								break;
							}
							Some(Ok(_)) => {
								last_activity = Instant::now();
							}
							Some(Err(e)) => {
								let _ = events_tx.try_send(status_error(room.clone(), "chat ws error", e));
								reconnect_attempt = 1;
								break;
							}
							None => {
								let _ = events_tx.try_send(status(room.clone(), false, "chat ws stream ended"));
								reconnect_attempt = 1;
								break;
							}
						}
					}

					_ = sleep(self.cfg.keepalive_timeout) => {
						if last_activity.elapsed() >= self.cfg.keepalive_timeout {
							let _ = events_tx.try_send(status(
								room.clone(),
								false,
								"keepalive watchdog triggered; reconnecting",
							));
							let _ = ws.close(None).await;
							reconnect_attempt = 1;
							break;
						}
					}
				}
			}

			self.fkey.clear().await;
		}

		self.fkey.clear().await;
		let _ = events_tx.try_send(status(room, false, "session stopped"));
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_grows_and_caps() {
		let min = Duration::from_millis(500);
		let max = Duration::from_secs(30);

		let first = RoomSession::backoff_delay(1, min, max);
		assert!(first >= Duration::from_millis(900), "got {first:?}");
		assert!(first <= Duration::from_millis(1100), "got {first:?}");

		let capped = RoomSession::backoff_delay(30, min, max);
		assert!(capped >= Duration::from_secs(27), "got {capped:?}");
		assert!(capped <= Duration::from_secs(33), "got {capped:?}");
	}
}
