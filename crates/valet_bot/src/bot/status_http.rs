#![forbid(unsafe_code)]

//! Liveness, readiness, and per-room status endpoints.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::warn;
use valet_chat::SessionStatus;

/// Last known connectivity for one room, as reported by its session.
#[derive(Debug, Clone, Serialize)]
pub struct RoomHealth {
	pub connected: bool,
	pub detail: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_error: Option<String>,
	pub fatal: bool,
}

#[derive(Clone, Default)]
pub struct BotStatus {
	ready: Arc<AtomicBool>,
	rooms: Arc<RwLock<BTreeMap<String, RoomHealth>>>,
}

impl BotStatus {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	/// Fold a session status event into the per-room view.
	pub async fn record(&self, status: &SessionStatus) {
		let mut rooms = self.rooms.write().await;
		rooms.insert(
			status.room.to_string(),
			RoomHealth {
				connected: status.connected,
				detail: status.detail.clone(),
				last_error: status.last_error.clone(),
				fatal: status.fatal,
			},
		);
	}

	pub async fn rooms(&self) -> BTreeMap<String, RoomHealth> {
		self.rooms.read().await.clone()
	}
}

pub fn spawn_status_server(bind: SocketAddr, status: BotStatus) {
	tokio::spawn(async move {
		if let Err(err) = run_status_server(bind, status).await {
			warn!(error = %err, "status server stopped");
		}
	});
}

async fn run_status_server(bind: SocketAddr, status: BotStatus) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let status = status.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_status(req, status.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "status connection error");
			}
		});
	}
}

fn plain(code: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	let mut response = Response::new(Full::new(Bytes::from_static(body)));
	*response.status_mut() = code;
	response
}

async fn handle_status(req: Request<Incoming>, status: BotStatus) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, b""));
	}

	match req.uri().path() {
		"/healthz" => Ok(plain(StatusCode::OK, b"ok")),
		"/readyz" => {
			if status.is_ready() {
				Ok(plain(StatusCode::OK, b"ready"))
			} else {
				Ok(plain(StatusCode::SERVICE_UNAVAILABLE, b"not-ready"))
			}
		}
		"/statusz" => {
			let rooms = status.rooms().await;
			let body = serde_json::to_vec(&rooms).unwrap_or_else(|_| b"{}".to_vec());
			let mut response = Response::new(Full::new(Bytes::from(body)));
			response
				.headers_mut()
				.insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
			Ok(response)
		}
		_ => Ok(plain(StatusCode::NOT_FOUND, b"")),
	}
}
