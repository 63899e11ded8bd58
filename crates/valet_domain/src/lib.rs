#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("invalid numeric id: {0}")]
	InvalidNumber(String),
}

/// Identifies one chat room on one host.
///
/// Used as a map key throughout the bot; two rooms with the same numeric id
/// on different hosts are distinct rooms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomIdent {
	pub id: u64,
	pub host: String,
	pub secure: bool,
}

impl RoomIdent {
	/// Create a room identifier with a non-empty host.
	pub fn new(id: u64, host: impl Into<String>, secure: bool) -> Result<Self, ParseIdError> {
		let host = host.into();
		if host.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self { id, host, secure })
	}

	/// Parse a `host/id` string; the result is always `secure`.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (host, id_s) = s
			.rsplit_once('/')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected host/id".into()))?;

		let id = id_s
			.parse::<u64>()
			.map_err(|_| ParseIdError::InvalidNumber(id_s.to_string()))?;

		Self::new(id, host.to_string(), true)
	}

	/// HTTP base URL for this room's host (`https://host` or `http://host`).
	pub fn http_base(&self) -> String {
		let scheme = if self.secure { "https" } else { "http" };
		format!("{scheme}://{}", self.host)
	}

	/// Stable `host/id` key used for storage partitions.
	pub fn storage_key(&self) -> String {
		format!("{}/{}", self.host, self.id)
	}
}

impl fmt::Display for RoomIdent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.host, self.id)
	}
}

impl FromStr for RoomIdent {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomIdent::parse(s)
	}
}

/// Numeric user identifier assigned by the chat service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<u64>()
			.map(UserId)
			.map_err(|_| ParseIdError::InvalidNumber(s.to_string()))
	}
}

/// Numeric message identifier assigned by the chat service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<u64>()
			.map(MessageId)
			.map_err(|_| ParseIdError::InvalidNumber(s.to_string()))
	}
}
