#![forbid(unsafe_code)]

//! Dad jokes and the dad greeting.
//!
//! The passive handler watches for "I'm X" messages and occasionally
//! replies with the classic dad greeting; the odds are one in the room's
//! configured frequency. `dad` tells a joke from an external data set
//! cached in storage for a day; `dad on|off|status` and `dadgreet` manage
//! the greeting per room.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use valet_core::dispatch::Responder;
use valet_core::parser::Command;
use valet_core::plugin::Plugin;
use valet_core::registry::EndpointSpec;
use valet_core::room_state::Message;
use valet_core::storage::{AdminStore, KeyValue};
use valet_domain::RoomIdent;

const DEFAULT_GREET_FREQUENCY: u64 = 1000;
const JOKE_CACHE_TTL: Duration = Duration::from_secs(86_400);
const DEFAULT_JOKES_URL: &str = "https://niceonedad.example.com/jokes.json";
const ADMIN_DENIED: &str = "I'm sorry Dave, I'm afraid I can't do that";

#[derive(Debug, Clone, Deserialize)]
struct Joke {
	setup: String,
	punchline: String,
}

pub struct DadPlugin {
	responder: Arc<dyn Responder>,
	admins: Arc<dyn AdminStore>,
	kv: Arc<dyn KeyValue>,
	http: reqwest::Client,
	bot_name: String,
	jokes_url: String,
	greet_re: Regex,
	first_word_re: Regex,
}

impl DadPlugin {
	pub fn new(
		responder: Arc<dyn Responder>,
		admins: Arc<dyn AdminStore>,
		kv: Arc<dyn KeyValue>,
		http: reqwest::Client,
		bot_name: impl Into<String>,
		jokes_url: Option<String>,
	) -> anyhow::Result<Self> {
		Ok(Self {
			responder,
			admins,
			kv,
			http,
			bot_name: bot_name.into(),
			jokes_url: jokes_url.unwrap_or_else(|| DEFAULT_JOKES_URL.to_string()),
			greet_re: Regex::new(r#"(?i)(?:^|\s)(?:i'm|i am)\s+(.+?)\s*(?:[.,!]|$)"#)?,
			first_word_re: Regex::new(r"^(\S+)\s+\S")?,
		})
	}

	async fn greet_enabled(&self, room: &RoomIdent) -> anyhow::Result<bool> {
		match self.kv.get(Some(room), "dadgreet").await? {
			Some(value) => Ok(value.as_bool().unwrap_or(true)),
			None => Ok(true),
		}
	}

	async fn greet_frequency(&self, room: &RoomIdent) -> anyhow::Result<u64> {
		match self.kv.get(Some(room), "dadgreet_frequency").await? {
			Some(value) => Ok(value.as_u64().unwrap_or(DEFAULT_GREET_FREQUENCY)),
			None => Ok(DEFAULT_GREET_FREQUENCY),
		}
	}

	/// Pull out the self-introduced name, capitalized like the original.
	fn extract_name(&self, text: &str) -> Option<String> {
		let raw = self.greet_re.captures(text)?.get(1)?.as_str();
		let mut chars = raw.chars();
		let first = chars.next()?;
		Some(first.to_uppercase().collect::<String>() + chars.as_str())
	}

	fn greeting(&self, full_name: &str) -> String {
		let mut reply = format!("Hello {full_name}. I am {}.", self.bot_name);
		if let Some(caps) = self.first_word_re.captures(full_name)
			&& let Some(first) = caps.get(1)
		{
			reply.push_str(&format!(" Do you mind if I just call you {}?", first.as_str()));
		}
		reply
	}

	fn now_epoch() -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or_default()
	}

	/// Refetch the joke data set when the cached copy is stale.
	async fn refresh_jokes(&self) -> anyhow::Result<()> {
		let refresh_at = self
			.kv
			.get(None, "refreshtime")
			.await?
			.and_then(|v| v.as_u64())
			.unwrap_or(0);
		let have_jokes = self.kv.exists(None, "jokes").await?;
		if have_jokes && refresh_at > Self::now_epoch() {
			return Ok(());
		}

		let jokes: Vec<Joke> = self
			.http
			.get(&self.jokes_url)
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		if jokes.is_empty() {
			anyhow::bail!("joke source returned an empty data set");
		}

		self.kv.set(None, "jokes", serde_json::to_value(&jokes_to_values(&jokes))?).await?;
		self.kv
			.set(None, "refreshtime", json!(Self::now_epoch() + JOKE_CACHE_TTL.as_secs()))
			.await?;
		debug!(count = jokes.len(), "refreshed joke cache");
		Ok(())
	}

	async fn tell_joke(&self, command: &Command) -> anyhow::Result<()> {
		self.refresh_jokes().await?;

		let jokes: Vec<Joke> = self
			.kv
			.get(None, "jokes")
			.await?
			.map(serde_json::from_value)
			.transpose()?
			.unwrap_or_default();
		let Some(joke) = jokes.get(rand::rng().random_range(0..jokes.len().max(1))) else {
			anyhow::bail!("no jokes available");
		};

		let text = format!("{} *{}*", joke.setup, joke.punchline);
		self.responder.post(&command.message.room, &text).await?;
		Ok(())
	}

	async fn greet_control(&self, command: &Command, syntax: &str) -> anyhow::Result<()> {
		let room = &command.message.room;
		let parent = command.message.id;

		match command.args.first().map(|a| a.to_lowercase()).as_deref() {
			Some("on") => {
				if !self.admins.is_admin(Some(room), command.message.user).await? {
					self.responder.reply(room, parent, ADMIN_DENIED).await?;
					return Ok(());
				}

				if let Some(raw) = command.args.get(1)
					&& raw.chars().any(|c| c.is_ascii_digit())
				{
					let frequency: i64 = raw.parse().unwrap_or(0);
					if frequency < 1 {
						self.responder.reply(room, parent, "Frequency cannot be less than 1").await?;
						return Ok(());
					}
					self.kv.set(Some(room), "dadgreet_frequency", json!(frequency)).await?;
				}

				self.kv.set(Some(room), "dadgreet", json!(true)).await?;
				let frequency = self.greet_frequency(room).await?;
				self.responder
					.post(room, &format!("Dad greeting is now enabled with a frequency of {frequency}"))
					.await?;
			}
			Some("off") => {
				if !self.admins.is_admin(Some(room), command.message.user).await? {
					self.responder.reply(room, parent, ADMIN_DENIED).await?;
					return Ok(());
				}

				self.kv.set(Some(room), "dadgreet", json!(false)).await?;
				self.responder.post(room, "Dad greeting is now disabled").await?;
			}
			Some("status") => {
				let state = if self.greet_enabled(room).await? {
					format!("enabled with a frequency of {}", self.greet_frequency(room).await?)
				} else {
					"disabled".to_string()
				};
				self.responder.post(room, &format!("Dad greeting is currently {state}")).await?;
			}
			_ => {
				self.responder.reply(room, parent, syntax).await?;
			}
		}

		Ok(())
	}
}

fn jokes_to_values(jokes: &[Joke]) -> Vec<serde_json::Value> {
	jokes
		.iter()
		.map(|j| json!({ "setup": j.setup, "punchline": j.punchline }))
		.collect()
}

#[async_trait]
impl Plugin for DadPlugin {
	fn name(&self) -> &str {
		"DadGreet"
	}

	fn description(&self) -> &str {
		"Jokes, fresh from the mind of the bot's dad"
	}

	fn command_endpoints(&self) -> Vec<EndpointSpec> {
		vec![
			EndpointSpec::new("dad", "dad - get a random dad joke; dad on|off|status [frequency] - manage the greeting"),
			EndpointSpec::new("dadgreet", "dadgreet on|off|status [frequency] - turn the dad greeting on or off"),
		]
	}

	async fn handle_command(&self, command: &Command) -> anyhow::Result<()> {
		match command.name.as_str() {
			"dadgreet" => self.greet_control(command, "Syntax: dadgreet on|off|status [frequency]").await,
			_ => match command.args.first().map(String::as_str) {
				Some("on" | "off" | "status") => {
					self.greet_control(command, "Syntax: dad on|off|status [frequency]").await
				}
				_ => self.tell_joke(command).await,
			},
		}
	}

	fn has_message_handler(&self) -> bool {
		true
	}

	async fn handle_message(&self, message: &Message) -> anyhow::Result<()> {
		let room = &message.room;
		if !self.greet_enabled(room).await? {
			return Ok(());
		}

		let Some(full_name) = self.extract_name(&message.text) else {
			return Ok(());
		};

		let frequency = self.greet_frequency(room).await?.max(1);
		if rand::rng().random_range(1..=frequency) != 1 {
			return Ok(());
		}

		let reply = self.greeting(&full_name);
		if let Err(e) = self.responder.reply(room, message.id, &reply).await {
			warn!(room = %room, error = %e, "failed to post dad greeting");
		}
		Ok(())
	}
}
