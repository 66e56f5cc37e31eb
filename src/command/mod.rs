//! Voice command parsing and dispatch

mod context;
mod dispatch;
mod help;
pub mod intent;

pub use context::{Reply, ReplyKind, VoiceReplyContext};
pub use dispatch::{CommandContext, CommandDispatcher, CommandHandler};
pub use help::{HelpHandler, UnhandledChat};
pub use intent::{CommandName, Intent, parse};
