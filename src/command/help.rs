//! Built-in handlers

use async_trait::async_trait;

use super::dispatch::{CommandContext, CommandHandler};
use super::intent::CommandName;
use crate::Result;

/// Lists the registered commands
pub struct HelpHandler {
    entries: Vec<(CommandName, String)>,
}

impl HelpHandler {
    /// Create a help handler over `(command, description)` entries
    #[must_use]
    pub const fn new(entries: Vec<(CommandName, String)>) -> Self {
        Self { entries }
    }

    fn render(&self) -> String {
        let mut lines = vec!["You can say:".to_string()];
        for (name, description) in &self.entries {
            if description.is_empty() {
                lines.push(format!("- {name}"));
            } else {
                lines.push(format!("- {name}: {description}"));
            }
        }
        lines.push("- help: list these commands".to_string());
        lines.join("\n")
    }
}

#[async_trait]
impl CommandHandler for HelpHandler {
    fn description(&self) -> &str {
        "list these commands"
    }

    async fn handle(&self, ctx: &dyn CommandContext, _params: &[String]) -> Result<String> {
        let text = self.render();
        ctx.reply(&text).await?;
        Ok(text)
    }
}

/// Chat fallback used when no conversational backend is wired in
#[derive(Debug, Default, Clone, Copy)]
pub struct UnhandledChat;

#[async_trait]
impl CommandHandler for UnhandledChat {
    async fn handle(&self, ctx: &dyn CommandContext, params: &[String]) -> Result<String> {
        let heard = params.join(" ");
        let text = if heard.is_empty() {
            "Sorry, I didn't catch that.".to_string()
        } else {
            format!("Sorry, I can't help with \"{heard}\" yet.")
        };
        ctx.reply(&text).await?;
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::command::VoiceReplyContext;
    use crate::voice::ChannelRef;

    #[tokio::test]
    async fn test_help_lists_entries_and_replies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = VoiceReplyContext::new(ChannelRef::new("g", "c"), "alice", tx);
        let help = HelpHandler::new(vec![
            (CommandName::Play, "play a track".to_string()),
            (CommandName::Stop, String::new()),
        ]);

        let text = help.handle(&ctx, &[]).await.unwrap();
        assert!(text.contains("- play: play a track"));
        assert!(text.contains("- stop\n"));
        assert_eq!(rx.recv().await.unwrap().text, text);
    }
}
