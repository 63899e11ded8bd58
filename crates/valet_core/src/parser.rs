#![forbid(unsafe_code)]

//! Trigger-prefix command parsing.

use crate::room_state::Message;

/// An invocation parsed out of a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
	/// Lowercased command name.
	pub name: String,
	pub args: Vec<String>,
	/// The message the command came from (reply target, sender, room).
	pub message: Message,
}

#[derive(Debug, Clone)]
pub struct ParserConfig {
	/// Trigger prefixes, longest match wins (e.g. `!!` before `!`).
	pub prefixes: Vec<String>,
	pub case_insensitive_prefix: bool,
}

impl Default for ParserConfig {
	fn default() -> Self {
		Self {
			prefixes: vec!["!!".to_string()],
			case_insensitive_prefix: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct CommandParser {
	prefixes: Vec<String>,
	case_insensitive_prefix: bool,
}

impl CommandParser {
	pub fn new(cfg: ParserConfig) -> Self {
		let mut prefixes: Vec<String> = cfg.prefixes.into_iter().filter(|p| !p.is_empty()).collect();
		// Longest first so "!!" is never shadowed by "!".
		prefixes.sort_by_key(|p| std::cmp::Reverse(p.len()));
		Self {
			prefixes,
			case_insensitive_prefix: cfg.case_insensitive_prefix,
		}
	}

	/// Parse a message into a command. `None` means the message is ordinary
	/// chat: no trigger prefix, or a bare prefix with nothing after it.
	pub fn parse(&self, message: &Message) -> Option<Command> {
		let text = message.text.trim_start();
		let rest = self.strip_prefix(text)?;

		let mut tokens = tokenize(rest);
		if tokens.is_empty() {
			return None;
		}
		let name = tokens.remove(0).to_lowercase();
		if name.is_empty() {
			return None;
		}

		Some(Command {
			name,
			args: tokens,
			message: message.clone(),
		})
	}

	fn strip_prefix<'a>(&self, text: &'a str) -> Option<&'a str> {
		for prefix in &self.prefixes {
			if text.starts_with(prefix.as_str()) {
				return Some(&text[prefix.len()..]);
			}
			if self.case_insensitive_prefix
				&& let Some(head) = text.get(..prefix.len())
				&& head.eq_ignore_ascii_case(prefix)
			{
				return Some(&text[prefix.len()..]);
			}
		}
		None
	}
}

/// Split on whitespace, honoring double quotes. A quoted span is one token
/// with the quotes removed; an unterminated quote swallows the rest of the
/// line as a single token.
fn tokenize(input: &str) -> Vec<String> {
	let mut tokens = Vec::new();
	let mut current = String::new();
	let mut in_quotes = false;

	for ch in input.chars() {
		match ch {
			'"' => {
				if in_quotes {
					tokens.push(std::mem::take(&mut current));
					in_quotes = false;
				} else {
					in_quotes = true;
				}
			}
			c if c.is_whitespace() && !in_quotes => {
				if !current.is_empty() {
					tokens.push(std::mem::take(&mut current));
				}
			}
			c => current.push(c),
		}
	}

	if !current.is_empty() || in_quotes {
		tokens.push(current);
	}

	tokens.retain(|t| !t.is_empty());
	tokens
}
