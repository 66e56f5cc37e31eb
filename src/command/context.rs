//! Reply context for voice-issued commands

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::dispatch::CommandContext;
use crate::voice::ChannelRef;
use crate::{Error, Result};

/// How a reply relates to the command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    /// Immediate reply
    Reply,
    /// Acknowledgement that a follow-up is coming
    Deferred,
    /// Reply after a deferral
    FollowUp,
}

/// A reply produced by a handler, for whatever front-end speaks or posts it
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    /// Guild/group identifier
    pub guild_id: String,

    /// Voice channel identifier
    pub channel_id: String,

    /// Speaker the reply is addressed to
    pub speaker: String,

    /// Reply kind
    pub kind: ReplyKind,

    /// Reply text (empty for deferrals)
    pub text: String,
}

/// Context handed to handlers for one voice command
pub struct VoiceReplyContext {
    channel: ChannelRef,
    speaker: String,
    replies: Option<mpsc::UnboundedSender<Reply>>,
    deferred: AtomicBool,
}

impl VoiceReplyContext {
    /// Create a context whose replies go to `replies`
    #[must_use]
    pub fn new(
        channel: ChannelRef,
        speaker: impl Into<String>,
        replies: mpsc::UnboundedSender<Reply>,
    ) -> Self {
        Self {
            channel,
            speaker: speaker.into(),
            replies: Some(replies),
            deferred: AtomicBool::new(false),
        }
    }

    /// Create a context with no front-end; replies are only logged
    #[must_use]
    pub fn logging(channel: ChannelRef, speaker: impl Into<String>) -> Self {
        Self {
            channel,
            speaker: speaker.into(),
            replies: None,
            deferred: AtomicBool::new(false),
        }
    }

    /// Whether the handler deferred its reply
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::Acquire)
    }

    fn deliver(&self, kind: ReplyKind, text: &str) -> Result<()> {
        let Some(replies) = &self.replies else {
            tracing::info!(channel = %self.channel, speaker = %self.speaker, ?kind, text, "reply");
            return Ok(());
        };

        replies
            .send(Reply {
                guild_id: self.channel.guild_id.clone(),
                channel_id: self.channel.channel_id.clone(),
                speaker: self.speaker.clone(),
                kind,
                text: text.to_string(),
            })
            .map_err(|_| Error::Dispatch("reply channel closed".to_string()))
    }
}

#[async_trait]
impl CommandContext for VoiceReplyContext {
    fn channel(&self) -> &ChannelRef {
        &self.channel
    }

    fn user_id(&self) -> &str {
        &self.speaker
    }

    async fn reply(&self, text: &str) -> Result<()> {
        self.deliver(ReplyKind::Reply, text)
    }

    async fn defer(&self) -> Result<()> {
        if self.deferred.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.deliver(ReplyKind::Deferred, "")
    }

    async fn follow_up(&self, text: &str) -> Result<()> {
        if !self.is_deferred() {
            return self.deliver(ReplyKind::Reply, text);
        }
        self.deliver(ReplyKind::FollowUp, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defer_then_follow_up() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = VoiceReplyContext::new(ChannelRef::new("g", "c"), "alice", tx);

        ctx.defer().await.unwrap();
        ctx.defer().await.unwrap();
        ctx.follow_up("done").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind, ReplyKind::Deferred);
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, ReplyKind::FollowUp);
        assert_eq!(reply.text, "done");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_is_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let ctx = VoiceReplyContext::new(ChannelRef::new("g", "c"), "alice", tx);

        assert!(ctx.reply("hi").await.is_err());
    }
}
