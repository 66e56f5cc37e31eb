//! Intent dispatch to registered handlers

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use super::help::HelpHandler;
use super::intent::{CommandName, Intent};
use crate::voice::ChannelRef;
use crate::{Error, Result};

/// What a handler can do with the voice user who issued the command
#[async_trait]
pub trait CommandContext: Send + Sync {
    /// Channel the command was spoken in
    fn channel(&self) -> &ChannelRef;

    /// Speaker who issued the command
    fn user_id(&self) -> &str;

    /// Reply right away
    ///
    /// # Errors
    ///
    /// Returns error if the reply cannot be delivered
    async fn reply(&self, text: &str) -> Result<()>;

    /// Acknowledge now and reply later with [`Self::follow_up`]
    ///
    /// # Errors
    ///
    /// Returns error if the acknowledgement cannot be delivered
    async fn defer(&self) -> Result<()>;

    /// Reply after a [`Self::defer`]
    ///
    /// # Errors
    ///
    /// Returns error if the reply cannot be delivered
    async fn follow_up(&self, text: &str) -> Result<()>;
}

/// A command implementation
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// One-line description for help output
    fn description(&self) -> &str {
        ""
    }

    /// Run the command and return the reply text
    ///
    /// # Errors
    ///
    /// Returns error if the command fails
    async fn handle(&self, ctx: &dyn CommandContext, params: &[String]) -> Result<String>;
}

/// Maps command names to handlers, with a `chat` fallback
pub struct CommandDispatcher {
    handlers: HashMap<CommandName, Arc<dyn CommandHandler>>,
    chat: Arc<dyn CommandHandler>,
}

impl CommandDispatcher {
    /// Create a dispatcher whose unhandled intents go to `chat`
    #[must_use]
    pub fn new(chat: Arc<dyn CommandHandler>) -> Self {
        Self {
            handlers: HashMap::new(),
            chat,
        }
    }

    /// Register a handler. Registering `chat` replaces the fallback.
    #[must_use]
    pub fn register(mut self, name: CommandName, handler: Arc<dyn CommandHandler>) -> Self {
        if name == CommandName::Chat {
            self.chat = handler;
        } else {
            self.handlers.insert(name, handler);
        }
        self
    }

    /// Register a `help` handler listing everything registered so far
    #[must_use]
    pub fn with_help(self) -> Self {
        let mut entries: Vec<(CommandName, String)> = self
            .handlers
            .iter()
            .map(|(name, handler)| (*name, handler.description().to_string()))
            .collect();
        entries.sort_by_key(|(name, _)| CommandName::ALL.iter().position(|n| n == name));

        self.register(CommandName::Help, Arc::new(HelpHandler::new(entries)))
    }

    /// Whether a handler is registered for `name`
    #[must_use]
    pub fn handles(&self, name: CommandName) -> bool {
        name == CommandName::Chat || self.handlers.contains_key(&name)
    }

    /// Dispatch an intent.
    ///
    /// Commands without a handler are routed to the chat fallback with the
    /// transcript as their only parameter.
    ///
    /// # Errors
    ///
    /// Returns `Error::Dispatch` if the handler fails or panics
    pub async fn dispatch(&self, intent: &Intent, ctx: &dyn CommandContext) -> Result<String> {
        let (name, handler, params) = match self.handlers.get(&intent.command) {
            Some(handler) => (intent.command, handler, intent.parameters.clone()),
            None if intent.command == CommandName::Chat => {
                (CommandName::Chat, &self.chat, intent.parameters.clone())
            }
            None => {
                tracing::debug!(command = %intent.command, "no handler registered, routing to chat");
                let text = intent.transcript.trim();
                let params = if text.is_empty() {
                    Vec::new()
                } else {
                    vec![text.to_string()]
                };
                (CommandName::Chat, &self.chat, params)
            }
        };

        tracing::debug!(command = %name, speaker = ctx.user_id(), "dispatching");

        let outcome = AssertUnwindSafe(handler.handle(ctx, &params))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                tracing::warn!(command = %name, error = %e, "command handler failed");
                Err(Error::Dispatch(format!("{name}: {e}")))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!(command = %name, panic = %message, "command handler panicked");
                Err(Error::Dispatch(format!("{name} handler panicked: {message}")))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
