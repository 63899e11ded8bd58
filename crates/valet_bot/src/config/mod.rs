#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};
use valet_chat::SecretString;
use valet_domain::RoomIdent;

/// Default config path: `~/.valet/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".valet").join("config.toml"))
}

/// Load the bot config from TOML and env overrides.
pub fn load_bot_config_from_path(path: &Path) -> anyhow::Result<BotConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = BotConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);
	normalize(&mut cfg);

	Ok(cfg)
}

/// Bot config (v1).
#[derive(Debug, Clone)]
pub struct BotConfig {
	/// Rooms the bot joins at startup.
	pub rooms: Vec<RoomIdent>,
	pub auth: AuthSettings,
	pub bot: BotSettings,
	pub session: SessionSettings,
	pub outbound: OutboundSettings,
	pub observability: ObservabilitySettings,
	pub plugins: PluginSettings,
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	pub email: Option<String>,
	pub password: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct BotSettings {
	/// Display name used in plugin greetings.
	pub display_name: String,
	/// Trigger prefixes; longest match wins.
	pub trigger_prefixes: Vec<String>,
	pub case_insensitive_prefix: bool,
	/// Reply sent for an unknown command; `None` means stay silent.
	pub unknown_command_reply: Option<String>,
	/// Directory holding the JSON state files.
	pub data_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub keepalive_timeout: Duration,
	pub events_channel_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct OutboundSettings {
	pub min_interval: Duration,
	pub max_attempts: u32,
	pub retry_backoff: Duration,
	pub queue_capacity: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ObservabilitySettings {
	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/status HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PluginSettings {
	pub dad_greet: bool,
	/// Source of the dad joke data set.
	pub dad_jokes_url: Option<String>,
}

impl Default for BotSettings {
	fn default() -> Self {
		Self {
			display_name: "Valet".to_string(),
			trigger_prefixes: vec!["!!".to_string()],
			case_insensitive_prefix: false,
			unknown_command_reply: None,
			data_dir: PathBuf::from(".valet-data"),
		}
	}
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			keepalive_timeout: Duration::from_secs(60),
			events_channel_capacity: 256,
		}
	}
}

impl Default for OutboundSettings {
	fn default() -> Self {
		Self {
			min_interval: Duration::from_secs(1),
			max_attempts: 5,
			retry_backoff: Duration::from_secs(2),
			queue_capacity: 64,
		}
	}
}

impl Default for PluginSettings {
	fn default() -> Self {
		Self {
			dad_greet: true,
			dad_jokes_url: None,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	rooms: Vec<String>,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	bot: FileBotSettings,

	#[serde(default)]
	session: FileSessionSettings,

	#[serde(default)]
	outbound: FileOutboundSettings,

	#[serde(default)]
	observability: FileObservabilitySettings,

	#[serde(default)]
	plugins: FilePluginSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	email: Option<String>,
	password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBotSettings {
	display_name: Option<String>,
	trigger_prefixes: Option<Vec<String>>,
	case_insensitive_prefix: Option<bool>,
	unknown_command_reply: Option<String>,
	data_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	keepalive_timeout_secs: Option<u64>,
	events_channel_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileOutboundSettings {
	min_interval_ms: Option<u64>,
	max_attempts: Option<u32>,
	retry_backoff_ms: Option<u64>,
	queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileObservabilitySettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePluginSettings {
	dad_greet: Option<bool>,
	dad_jokes_url: Option<String>,
}

impl BotConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let mut rooms = Vec::with_capacity(file.rooms.len());
		for raw in &file.rooms {
			let room: RoomIdent = raw.parse().with_context(|| format!("parse room '{raw}'"))?;
			rooms.push(room);
		}

		let defaults_bot = BotSettings::default();
		let defaults_session = SessionSettings::default();
		let defaults_outbound = OutboundSettings::default();
		let defaults_plugins = PluginSettings::default();

		Ok(Self {
			rooms,
			auth: AuthSettings {
				email: file.auth.email.filter(|s| !s.trim().is_empty()),
				password: file.auth.password.filter(|s| !s.trim().is_empty()).map(SecretString::new),
			},
			bot: BotSettings {
				display_name: file
					.bot
					.display_name
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults_bot.display_name),
				trigger_prefixes: file
					.bot
					.trigger_prefixes
					.filter(|p| !p.is_empty())
					.unwrap_or(defaults_bot.trigger_prefixes),
				case_insensitive_prefix: file
					.bot
					.case_insensitive_prefix
					.unwrap_or(defaults_bot.case_insensitive_prefix),
				unknown_command_reply: file.bot.unknown_command_reply.filter(|s| !s.trim().is_empty()),
				data_dir: file
					.bot
					.data_dir
					.filter(|s| !s.trim().is_empty())
					.map(PathBuf::from)
					.unwrap_or(defaults_bot.data_dir),
			},
			session: SessionSettings {
				reconnect_min_delay: file
					.session
					.reconnect_min_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults_session.reconnect_min_delay),
				reconnect_max_delay: file
					.session
					.reconnect_max_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults_session.reconnect_max_delay),
				keepalive_timeout: file
					.session
					.keepalive_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults_session.keepalive_timeout),
				events_channel_capacity: file
					.session
					.events_channel_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults_session.events_channel_capacity),
			},
			outbound: OutboundSettings {
				min_interval: file
					.outbound
					.min_interval_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults_outbound.min_interval),
				max_attempts: file
					.outbound
					.max_attempts
					.filter(|v| *v > 0)
					.unwrap_or(defaults_outbound.max_attempts),
				retry_backoff: file
					.outbound
					.retry_backoff_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults_outbound.retry_backoff),
				queue_capacity: file
					.outbound
					.queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults_outbound.queue_capacity),
			},
			observability: ObservabilitySettings {
				metrics_bind: file.observability.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.observability.health_bind.filter(|s| !s.trim().is_empty()),
			},
			plugins: PluginSettings {
				dad_greet: file.plugins.dad_greet.unwrap_or(defaults_plugins.dad_greet),
				dad_jokes_url: file.plugins.dad_jokes_url.filter(|s| !s.trim().is_empty()),
			},
		})
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut BotConfig) {
	if let Ok(v) = std::env::var("VALET_AUTH_EMAIL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.email = Some(v);
			info!("bot auth: email overridden by env");
		}
	}

	if let Ok(v) = std::env::var("VALET_AUTH_PASSWORD") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.password = Some(SecretString::new(v));
			info!("bot auth: password overridden by env");
		}
	}

	if let Ok(v) = std::env::var("VALET_ROOMS") {
		let rooms: Vec<RoomIdent> = v
			.split(',')
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.filter_map(|s| match s.parse() {
				Ok(room) => Some(room),
				Err(e) => {
					warn!(room = s, error = %e, "bot config: ignoring invalid room in VALET_ROOMS");
					None
				}
			})
			.collect();
		if !rooms.is_empty() {
			cfg.rooms = rooms;
			info!(count = cfg.rooms.len(), "bot config: rooms overridden by env");
		}
	}

	if let Ok(v) = std::env::var("VALET_DATA_DIR") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bot.data_dir = PathBuf::from(v);
			info!("bot config: data_dir overridden by env");
		}
	}

	if let Ok(v) = std::env::var("VALET_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.observability.metrics_bind = Some(v);
			info!("bot config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("VALET_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.observability.health_bind = Some(v);
			info!("bot config: health_bind overridden by env");
		}
	}
}

fn normalize(cfg: &mut BotConfig) {
	if cfg.session.reconnect_min_delay > cfg.session.reconnect_max_delay {
		warn!(
			min = ?cfg.session.reconnect_min_delay,
			max = ?cfg.session.reconnect_max_delay,
			"bot config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		std::mem::swap(&mut cfg.session.reconnect_min_delay, &mut cfg.session.reconnect_max_delay);
	}
}
