#![forbid(unsafe_code)]

//! Command name registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::plugin::Plugin;

/// One command a plugin serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
	/// Command name as typed after the trigger. Stored lowercased.
	pub name: String,
	/// One-line usage string shown by the help command.
	pub help: String,
}

impl EndpointSpec {
	pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
		Self {
			name: name.into().to_lowercase(),
			help: help.into(),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("command '{name}' is already registered by the {existing_owner} plugin")]
pub struct DuplicateCommandError {
	pub name: String,
	pub existing_owner: String,
}

#[derive(Clone)]
pub struct EndpointEntry {
	pub spec: EndpointSpec,
	pub owner_name: String,
	pub built_in: bool,
	pub plugin: Arc<dyn Plugin>,
}

/// Maps command names to the plugin that serves them. Registration is
/// atomic per plugin; a collision leaves the registry untouched.
#[derive(Default)]
pub struct CommandRegistry {
	by_name: HashMap<String, EndpointEntry>,
}

impl CommandRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, plugin: Arc<dyn Plugin>, built_in: bool) -> Result<(), DuplicateCommandError> {
		let owner_name = plugin.name().to_string();
		let specs = plugin.command_endpoints();

		for spec in &specs {
			if let Some(existing) = self.by_name.get(&spec.name) {
				return Err(DuplicateCommandError {
					name: spec.name.clone(),
					existing_owner: existing.owner_name.clone(),
				});
			}
		}

		for spec in specs {
			self.by_name.insert(
				spec.name.clone(),
				EndpointEntry {
					spec,
					owner_name: owner_name.clone(),
					built_in,
					plugin: plugin.clone(),
				},
			);
		}

		Ok(())
	}

	pub fn lookup(&self, name: &str) -> Option<&EndpointEntry> {
		self.by_name.get(&name.to_lowercase())
	}

	/// All endpoints, sorted by name.
	pub fn endpoints(&self) -> Vec<&EndpointEntry> {
		let mut entries: Vec<&EndpointEntry> = self.by_name.values().collect();
		entries.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
		entries
	}

	pub fn len(&self) -> usize {
		self.by_name.len()
	}

	pub fn is_empty(&self) -> bool {
		self.by_name.is_empty()
	}
}
