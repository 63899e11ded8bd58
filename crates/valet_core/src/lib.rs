#![forbid(unsafe_code)]

pub mod builtins;
pub mod dispatch;
pub mod parser;
pub mod plugin;
pub mod registry;
pub mod room_state;
pub mod storage;

pub use dispatch::{Dispatcher, UnknownCommandPolicy};
pub use parser::{Command, CommandParser, ParserConfig};
pub use plugin::{Plugin, PluginHost};
pub use registry::{CommandRegistry, DuplicateCommandError, EndpointSpec};
pub use room_state::{Applied, Message, RoomState};
