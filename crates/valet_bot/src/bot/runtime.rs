#![forbid(unsafe_code)]

//! Composition root: wires config, storage, plugins, and the per-room
//! session/sender/pipeline trio, then supervises until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{info, warn};
use valet_chat::auth::{Authenticator, Credentials, HttpAuthenticator};
use valet_chat::client::{ChatClient, FkeyedClient};
use valet_chat::sender::{OutboundRouter, SenderConfig, spawn_room_sender};
use valet_chat::session::{RoomSession, SessionConfig};
use valet_chat::{FkeyCell, SelfUserCell, SessionControl, bounded_session_channels};
use valet_core::builtins::{AdminBuiltIn, BanBuiltIn, HelpBuiltIn, HelpEntry, PluginBuiltIn, VersionBuiltIn};
use valet_core::dispatch::{Dispatcher, Responder, UnknownCommandPolicy};
use valet_core::parser::{CommandParser, ParserConfig};
use valet_core::plugin::{Plugin, PluginHost};
use valet_core::room_state::RoomState;
use valet_core::storage::{FileAdminStore, FileBanStore, FileKeyValueFactory, FilePluginState, KeyValueFactory};
use valet_domain::RoomIdent;

use crate::bot::pipeline::RoomPipeline;
use crate::bot::status_http::BotStatus;
use crate::config::BotConfig;
use crate::plugins::dad::DadPlugin;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// [`Responder`] that feeds the per-room outbound queues.
struct RouterResponder {
	router: OutboundRouter,
}

#[async_trait]
impl Responder for RouterResponder {
	async fn post(&self, room: &RoomIdent, text: &str) -> anyhow::Result<()> {
		self.router.post(room, text).await?;
		Ok(())
	}

	async fn reply(&self, room: &RoomIdent, parent: valet_domain::MessageId, text: &str) -> anyhow::Result<()> {
		self.router.reply(room, parent, text).await?;
		Ok(())
	}
}

pub async fn run(cfg: BotConfig, status: BotStatus) -> anyhow::Result<()> {
	if cfg.rooms.is_empty() {
		return Err(anyhow!("no rooms configured; set rooms in config or VALET_ROOMS"));
	}

	let credentials = Credentials {
		email: cfg.auth.email.clone().ok_or_else(|| anyhow!("auth.email is not configured"))?,
		password: cfg
			.auth
			.password
			.clone()
			.ok_or_else(|| anyhow!("auth.password is not configured"))?,
	};

	let http = reqwest::Client::builder()
		.user_agent(concat!("valet_bot/", env!("CARGO_PKG_VERSION")))
		.build()
		.context("build http client")?;
	let auth: Arc<dyn Authenticator> = Arc::new(HttpAuthenticator::new(http.clone()));
	let chat_client = Arc::new(ChatClient::new(http.clone()));

	// One login up front pins the bot's own account id so the pipelines can
	// ignore the bot's echoes. Bad credentials stop the bot here instead of
	// in every session's retry loop; a transient failure leaves the cell to
	// be filled by the first session that logs in.
	let self_user = SelfUserCell::new();
	match auth.login(&cfg.rooms[0], &credentials).await {
		Ok(token) => {
			info!(user = %token.user, "authenticated as bot account");
			self_user.set(token.user).await;
		}
		Err(e @ valet_chat::auth::AuthError::Rejected(_)) => {
			return Err(anyhow::Error::from(e).context("startup login rejected"));
		}
		Err(e) => {
			warn!(error = %e, "startup login failed; sessions will retry");
		}
	}

	tokio::fs::create_dir_all(&cfg.bot.data_dir)
		.await
		.with_context(|| format!("create data dir {}", cfg.bot.data_dir.display()))?;
	let admins = Arc::new(FileAdminStore::new(&cfg.bot.data_dir));
	let bans = Arc::new(FileBanStore::new(&cfg.bot.data_dir));
	let plugin_state = Arc::new(FilePluginState::new(&cfg.bot.data_dir));
	let kv_factory = FileKeyValueFactory::new(&cfg.bot.data_dir);

	// Outbound queues, one per room.
	let sender_cfg = SenderConfig {
		min_interval: cfg.outbound.min_interval,
		max_attempts: cfg.outbound.max_attempts,
		retry_backoff: cfg.outbound.retry_backoff,
		queue_capacity: cfg.outbound.queue_capacity,
	};
	let mut router = OutboundRouter::new();
	let mut fkeys: Vec<(RoomIdent, FkeyCell)> = Vec::with_capacity(cfg.rooms.len());
	for room in &cfg.rooms {
		let fkey = FkeyCell::new();
		let backend = Arc::new(FkeyedClient::new(chat_client.clone(), fkey.clone()));
		router.insert(spawn_room_sender(room.clone(), backend, sender_cfg.clone()));
		fkeys.push((room.clone(), fkey));
	}
	let responder: Arc<dyn Responder> = Arc::new(RouterResponder { router });

	// Plugins. Built-ins first, so nothing can shadow them.
	let mut host = PluginHost::new();

	let help = HelpBuiltIn::new(responder.clone());
	let help_entries = help.entries_slot();
	host.register_builtin(Arc::new(help)).context("register help")?;
	host.register_builtin(Arc::new(VersionBuiltIn::new(responder.clone())))
		.context("register version")?;
	let plugin_builtin = PluginBuiltIn::new(responder.clone(), admins.clone(), plugin_state.clone());
	let plugins_slot = plugin_builtin.plugins_slot();
	host.register_builtin(Arc::new(plugin_builtin)).context("register plugin")?;
	host.register_builtin(Arc::new(AdminBuiltIn::new(responder.clone(), admins.clone())))
		.context("register admin")?;
	host.register_builtin(Arc::new(BanBuiltIn::new(responder.clone(), admins.clone(), bans.clone())))
		.context("register ban")?;

	let mut user_plugins: Vec<(String, String)> = Vec::new();
	if cfg.plugins.dad_greet {
		let dad = DadPlugin::new(
			responder.clone(),
			admins.clone(),
			kv_factory.for_owner("DadGreet"),
			http.clone(),
			cfg.bot.display_name.clone(),
			cfg.plugins.dad_jokes_url.clone(),
		)
		.context("build dad plugin")?;
		user_plugins.push((dad.name().to_string(), dad.description().to_string()));
		host.register_plugin(Arc::new(dad)).context("register dad plugin")?;
	}

	let entries: Vec<HelpEntry> = host
		.registry()
		.endpoints()
		.into_iter()
		.map(|e| HelpEntry {
			name: e.spec.name.clone(),
			help: e.spec.help.clone(),
			owner: e.owner_name.clone(),
		})
		.collect();
	let _ = help_entries.set(entries);
	let _ = plugins_slot.set(user_plugins);

	let unknown = match &cfg.bot.unknown_command_reply {
		Some(reply) => UnknownCommandPolicy::Reply(reply.clone()),
		None => UnknownCommandPolicy::Silent,
	};
	let dispatcher = Arc::new(Dispatcher::new(
		Arc::new(host),
		bans.clone(),
		plugin_state.clone(),
		responder.clone(),
		unknown,
	));

	let parser = CommandParser::new(ParserConfig {
		prefixes: cfg.bot.trigger_prefixes.clone(),
		case_insensitive_prefix: cfg.bot.case_insensitive_prefix,
	});

	// One session + pipeline per room.
	let mut sessions = JoinSet::new();
	let mut pipelines = JoinSet::new();
	let mut controls = Vec::with_capacity(cfg.rooms.len());
	for (room, fkey) in fkeys {
		let (control_tx, control_rx, events_tx, events_rx) =
			bounded_session_channels(8, cfg.session.events_channel_capacity);
		controls.push(control_tx);

		let session_cfg = SessionConfig {
			credentials: credentials.clone(),
			reconnect_min_delay: cfg.session.reconnect_min_delay,
			reconnect_max_delay: cfg.session.reconnect_max_delay,
			keepalive_timeout: cfg.session.keepalive_timeout,
			ws_connector: None,
		};
		let session = RoomSession::new(room.clone(), session_cfg, auth.clone(), fkey, self_user.clone());
		sessions.spawn(session.run(control_rx, events_tx));

		let pipeline = RoomPipeline::new(
			RoomState::new(room.clone()),
			parser.clone(),
			dispatcher.clone(),
			status.clone(),
			self_user.clone(),
		);
		pipelines.spawn(pipeline.run(events_rx));

		info!(room = %room, "room wired");
	}

	status.mark_ready();
	info!(rooms = cfg.rooms.len(), "bot running");

	let mut fatal: Option<anyhow::Error> = None;
	tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown signal received");
		}
		Some(result) = sessions.join_next() => {
			match result {
				Ok(Ok(())) => warn!("a session stopped unexpectedly; shutting down"),
				Ok(Err(e)) => {
					warn!(error = %e, "a session failed fatally; shutting down");
					fatal = Some(e);
				}
				Err(e) => {
					warn!(error = %e, "a session task panicked; shutting down");
					fatal = Some(e.into());
				}
			}
		}
	}

	for control in &controls {
		let _ = control.try_send(SessionControl::Shutdown);
	}
	let drain = async {
		while sessions.join_next().await.is_some() {}
		while pipelines.join_next().await.is_some() {}
	};
	if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
		warn!("shutdown grace period elapsed; aborting remaining tasks");
		sessions.abort_all();
		pipelines.abort_all();
	}

	match fatal {
		Some(e) => Err(e),
		None => Ok(()),
	}
}
