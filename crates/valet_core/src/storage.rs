#![forbid(unsafe_code)]

//! Durable bot state.
//!
//! Three small stores back the bot: per-plugin key/value data, the admin
//! and ban lists, and the per-room plugin enablement flags. Every store is
//! partitioned by room, with a shared global partition, so the same plugin
//! can hold different state in different rooms.
//!
//! The file implementations keep one JSON document per store under the
//! bot's data directory and rewrite it atomically via a temp file rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use valet_domain::{RoomIdent, UserId};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
	#[error("storage io: {0}")]
	Io(#[from] std::io::Error),

	#[error("storage file is not valid JSON: {0}")]
	Json(#[from] serde_json::Error),
}

/// Partition key: the global section or one room's section.
fn partition(room: Option<&RoomIdent>) -> String {
	match room {
		Some(room) => format!("room:{}", room.storage_key()),
		None => "global".to_string(),
	}
}

/// Free-form JSON storage scoped to one owner (usually a plugin).
#[async_trait]
pub trait KeyValue: Send + Sync {
	async fn exists(&self, room: Option<&RoomIdent>, key: &str) -> Result<bool, StorageError>;

	async fn get(&self, room: Option<&RoomIdent>, key: &str) -> Result<Option<Value>, StorageError>;

	async fn set(&self, room: Option<&RoomIdent>, key: &str, value: Value) -> Result<(), StorageError>;
}

/// Hands each plugin its own isolated [`KeyValue`] store.
pub trait KeyValueFactory: Send + Sync {
	fn for_owner(&self, owner: &str) -> std::sync::Arc<dyn KeyValue>;
}

/// Users allowed to run privileged commands. Global admins are admins in
/// every room.
#[async_trait]
pub trait AdminStore: Send + Sync {
	async fn is_admin(&self, room: Option<&RoomIdent>, user: UserId) -> Result<bool, StorageError>;

	async fn add(&self, room: Option<&RoomIdent>, user: UserId) -> Result<(), StorageError>;

	async fn remove(&self, room: Option<&RoomIdent>, user: UserId) -> Result<(), StorageError>;

	async fn list(&self, room: Option<&RoomIdent>) -> Result<Vec<UserId>, StorageError>;
}

/// Users the bot ignores entirely.
#[async_trait]
pub trait BanStore: Send + Sync {
	async fn is_banned(&self, room: Option<&RoomIdent>, user: UserId) -> Result<bool, StorageError>;

	async fn ban(&self, room: Option<&RoomIdent>, user: UserId) -> Result<(), StorageError>;

	async fn unban(&self, room: Option<&RoomIdent>, user: UserId) -> Result<(), StorageError>;

	async fn list(&self, room: Option<&RoomIdent>) -> Result<Vec<UserId>, StorageError>;
}

/// Per-room plugin on/off switches. Absent means enabled.
#[async_trait]
pub trait PluginState: Send + Sync {
	async fn is_enabled(&self, room: Option<&RoomIdent>, plugin: &str) -> Result<bool, StorageError>;

	async fn set_enabled(&self, room: Option<&RoomIdent>, plugin: &str, enabled: bool) -> Result<(), StorageError>;
}

type Document = BTreeMap<String, BTreeMap<String, Value>>;

/// Shared JSON-file document with load-modify-store under one lock.
#[derive(Debug)]
struct JsonFile {
	path: PathBuf,
	lock: Mutex<()>,
}

impl JsonFile {
	fn new(path: PathBuf) -> Self {
		Self {
			path,
			lock: Mutex::new(()),
		}
	}

	async fn load(&self) -> Result<Document, StorageError> {
		match tokio::fs::read(&self.path).await {
			Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::new()),
			Err(e) => Err(e.into()),
		}
	}

	async fn store(&self, doc: &Document) -> Result<(), StorageError> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let tmp = self.path.with_extension("json.tmp");
		let bytes = serde_json::to_vec_pretty(doc)?;
		tokio::fs::write(&tmp, bytes).await?;
		tokio::fs::rename(&tmp, &self.path).await?;
		Ok(())
	}

	async fn read_key(&self, section: &str, key: &str) -> Result<Option<Value>, StorageError> {
		let _guard = self.lock.lock().await;
		let doc = self.load().await?;
		Ok(doc.get(section).and_then(|s| s.get(key)).cloned())
	}

	async fn write_key(&self, section: &str, key: &str, value: Value) -> Result<(), StorageError> {
		let _guard = self.lock.lock().await;
		let mut doc = self.load().await?;
		doc.entry(section.to_string()).or_default().insert(key.to_string(), value);
		self.store(&doc).await
	}

	async fn remove_key(&self, section: &str, key: &str) -> Result<(), StorageError> {
		let _guard = self.lock.lock().await;
		let mut doc = self.load().await?;
		if let Some(s) = doc.get_mut(section) {
			s.remove(key);
			if s.is_empty() {
				doc.remove(section);
			}
		}
		self.store(&doc).await
	}

	async fn section_keys(&self, section: &str) -> Result<Vec<String>, StorageError> {
		let _guard = self.lock.lock().await;
		let doc = self.load().await?;
		Ok(doc.get(section).map(|s| s.keys().cloned().collect()).unwrap_or_default())
	}
}

/// [`KeyValue`] backed by `kv.{owner}.json` in the data directory.
#[derive(Debug)]
pub struct FileKeyValue {
	file: JsonFile,
}

impl FileKeyValue {
	pub fn new(data_dir: &Path, owner: &str) -> Self {
		let safe_owner: String = owner
			.chars()
			.map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
			.collect();
		Self {
			file: JsonFile::new(data_dir.join(format!("kv.{safe_owner}.json"))),
		}
	}
}

#[async_trait]
impl KeyValue for FileKeyValue {
	async fn exists(&self, room: Option<&RoomIdent>, key: &str) -> Result<bool, StorageError> {
		Ok(self.file.read_key(&partition(room), key).await?.is_some())
	}

	async fn get(&self, room: Option<&RoomIdent>, key: &str) -> Result<Option<Value>, StorageError> {
		self.file.read_key(&partition(room), key).await
	}

	async fn set(&self, room: Option<&RoomIdent>, key: &str, value: Value) -> Result<(), StorageError> {
		self.file.write_key(&partition(room), key, value).await
	}
}

/// Creates one [`FileKeyValue`] per owner under a shared data directory.
#[derive(Debug, Clone)]
pub struct FileKeyValueFactory {
	data_dir: PathBuf,
}

impl FileKeyValueFactory {
	pub fn new(data_dir: impl Into<PathBuf>) -> Self {
		Self {
			data_dir: data_dir.into(),
		}
	}
}

impl KeyValueFactory for FileKeyValueFactory {
	fn for_owner(&self, owner: &str) -> std::sync::Arc<dyn KeyValue> {
		std::sync::Arc::new(FileKeyValue::new(&self.data_dir, owner))
	}
}

/// User-id set stored as section keys in one JSON document. Shared shape
/// of the admin and ban stores.
#[derive(Debug)]
struct UserSetFile {
	file: JsonFile,
}

impl UserSetFile {
	fn new(path: PathBuf) -> Self {
		Self {
			file: JsonFile::new(path),
		}
	}

	async fn contains(&self, room: Option<&RoomIdent>, user: UserId) -> Result<bool, StorageError> {
		// Global entries apply everywhere.
		if self.file.read_key("global", &user.to_string()).await?.is_some() {
			return Ok(true);
		}
		if room.is_some() {
			return Ok(self.file.read_key(&partition(room), &user.to_string()).await?.is_some());
		}
		Ok(false)
	}

	async fn insert(&self, room: Option<&RoomIdent>, user: UserId) -> Result<(), StorageError> {
		self.file
			.write_key(&partition(room), &user.to_string(), Value::Bool(true))
			.await
	}

	async fn remove(&self, room: Option<&RoomIdent>, user: UserId) -> Result<(), StorageError> {
		self.file.remove_key(&partition(room), &user.to_string()).await
	}

	async fn list(&self, room: Option<&RoomIdent>) -> Result<Vec<UserId>, StorageError> {
		let keys = self.file.section_keys(&partition(room)).await?;
		let mut users: Vec<UserId> = keys.iter().filter_map(|k| k.parse().ok()).collect();
		users.sort();
		Ok(users)
	}
}

/// [`AdminStore`] backed by `admins.json`.
#[derive(Debug)]
pub struct FileAdminStore {
	set: UserSetFile,
}

impl FileAdminStore {
	pub fn new(data_dir: &Path) -> Self {
		Self {
			set: UserSetFile::new(data_dir.join("admins.json")),
		}
	}
}

#[async_trait]
impl AdminStore for FileAdminStore {
	async fn is_admin(&self, room: Option<&RoomIdent>, user: UserId) -> Result<bool, StorageError> {
		self.set.contains(room, user).await
	}

	async fn add(&self, room: Option<&RoomIdent>, user: UserId) -> Result<(), StorageError> {
		self.set.insert(room, user).await
	}

	async fn remove(&self, room: Option<&RoomIdent>, user: UserId) -> Result<(), StorageError> {
		self.set.remove(room, user).await
	}

	async fn list(&self, room: Option<&RoomIdent>) -> Result<Vec<UserId>, StorageError> {
		self.set.list(room).await
	}
}

/// [`BanStore`] backed by `bans.json`.
#[derive(Debug)]
pub struct FileBanStore {
	set: UserSetFile,
}

impl FileBanStore {
	pub fn new(data_dir: &Path) -> Self {
		Self {
			set: UserSetFile::new(data_dir.join("bans.json")),
		}
	}
}

#[async_trait]
impl BanStore for FileBanStore {
	async fn is_banned(&self, room: Option<&RoomIdent>, user: UserId) -> Result<bool, StorageError> {
		self.set.contains(room, user).await
	}

	async fn ban(&self, room: Option<&RoomIdent>, user: UserId) -> Result<(), StorageError> {
		self.set.insert(room, user).await
	}

	async fn unban(&self, room: Option<&RoomIdent>, user: UserId) -> Result<(), StorageError> {
		self.set.remove(room, user).await
	}

	async fn list(&self, room: Option<&RoomIdent>) -> Result<Vec<UserId>, StorageError> {
		self.set.list(room).await
	}
}

/// [`PluginState`] backed by `plugins.json`.
#[derive(Debug)]
pub struct FilePluginState {
	file: JsonFile,
}

impl FilePluginState {
	pub fn new(data_dir: &Path) -> Self {
		Self {
			file: JsonFile::new(data_dir.join("plugins.json")),
		}
	}
}

#[async_trait]
impl PluginState for FilePluginState {
	async fn is_enabled(&self, room: Option<&RoomIdent>, plugin: &str) -> Result<bool, StorageError> {
		match self.file.read_key(&partition(room), plugin).await? {
			Some(Value::Bool(enabled)) => Ok(enabled),
			_ => Ok(true),
		}
	}

	async fn set_enabled(&self, room: Option<&RoomIdent>, plugin: &str, enabled: bool) -> Result<(), StorageError> {
		self.file.write_key(&partition(room), plugin, Value::Bool(enabled)).await
	}
}
