#![forbid(unsafe_code)]

//! Login and per-room websocket authentication.
//!
//! Connecting to a room takes three round-trips against the chat host:
//! a credential login that yields an account token, an fkey fetch for the
//! target room, and a ws-auth exchange that returns the socket URL. The
//! fkey doubles as the write token for posting messages.

use async_trait::async_trait;
use serde::Deserialize;
use valet_domain::{RoomIdent, UserId};

use crate::SecretString;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
	#[error("credentials rejected: {0}")]
	Rejected(String),

	#[error("malformed auth response: {0}")]
	MalformedResponse(String),

	#[error(transparent)]
	Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct Credentials {
	pub email: String,
	pub password: SecretString,
}

/// Account-level token returned by login.
#[derive(Debug, Clone)]
pub struct SessionToken {
	pub secret: SecretString,
	pub user: UserId,
}

/// Room-scoped token used for both ws-auth and message posting.
#[derive(Debug, Clone)]
pub struct Fkey(pub String);

#[async_trait]
pub trait Authenticator: Send + Sync {
	async fn login(&self, room: &RoomIdent, credentials: &Credentials) -> Result<SessionToken, AuthError>;

	async fn room_fkey(&self, room: &RoomIdent, token: &SessionToken) -> Result<Fkey, AuthError>;

	async fn ws_url(&self, room: &RoomIdent, token: &SessionToken, fkey: &Fkey) -> Result<String, AuthError>;
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
	token: String,
	user_id: u64,
}

#[derive(Debug, Deserialize)]
struct FkeyResponse {
	fkey: String,
}

#[derive(Debug, Deserialize)]
struct WsAuthResponse {
	url: String,
}

/// [`Authenticator`] backed by the chat host's HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpAuthenticator {
	http: reqwest::Client,
}

impl HttpAuthenticator {
	pub fn new(http: reqwest::Client) -> Self {
		Self { http }
	}
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
	async fn login(&self, room: &RoomIdent, credentials: &Credentials) -> Result<SessionToken, AuthError> {
		let url = format!("{}/users/login", room.http_base());
		let response = self
			.http
			.post(&url)
			.form(&[
				("email", credentials.email.as_str()),
				("password", credentials.password.expose()),
			])
			.send()
			.await?;

		let status = response.status();
		if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
			let body = response.text().await.unwrap_or_default();
			return Err(AuthError::Rejected(if body.is_empty() {
				format!("login returned {status}")
			} else {
				body
			}));
		}
		let response = response.error_for_status()?;

		let body: LoginResponse = response
			.json()
			.await
			.map_err(|e| AuthError::MalformedResponse(e.to_string()))?;
		if body.token.is_empty() {
			return Err(AuthError::MalformedResponse("login returned an empty token".into()));
		}

		Ok(SessionToken {
			secret: SecretString::new(body.token),
			user: UserId(body.user_id),
		})
	}

	async fn room_fkey(&self, room: &RoomIdent, token: &SessionToken) -> Result<Fkey, AuthError> {
		let url = format!("{}/rooms/{}/fkey", room.http_base(), room.id);
		let response = self
			.http
			.get(&url)
			.bearer_auth(token.secret.expose())
			.send()
			.await?;

		let status = response.status();
		if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
			return Err(AuthError::Rejected(format!("fkey fetch returned {status}")));
		}
		let response = response.error_for_status()?;

		let body: FkeyResponse = response
			.json()
			.await
			.map_err(|e| AuthError::MalformedResponse(e.to_string()))?;
		if body.fkey.is_empty() {
			return Err(AuthError::MalformedResponse("fkey response was empty".into()));
		}

		Ok(Fkey(body.fkey))
	}

	async fn ws_url(&self, room: &RoomIdent, token: &SessionToken, fkey: &Fkey) -> Result<String, AuthError> {
		let url = format!("{}/ws-auth", room.http_base());
		let response = self
			.http
			.post(&url)
			.bearer_auth(token.secret.expose())
			.form(&[("roomid", room.id.to_string().as_str()), ("fkey", fkey.0.as_str())])
			.send()
			.await?;

		let status = response.status();
		if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
			return Err(AuthError::Rejected(format!("ws-auth returned {status}")));
		}
		let response = response.error_for_status()?;

		let body: WsAuthResponse = response
			.json()
			.await
			.map_err(|e| AuthError::MalformedResponse(e.to_string()))?;
		if body.url.is_empty() {
			return Err(AuthError::MalformedResponse("ws-auth returned an empty url".into()));
		}

		Ok(body.url)
	}
}
