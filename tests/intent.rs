//! Transcript parsing and dispatch tests

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use beacon_listen::command::{
    CommandContext, CommandDispatcher, CommandHandler, ReplyKind, UnhandledChat,
    VoiceReplyContext, parse,
};
use beacon_listen::voice::ChannelRef;
use beacon_listen::{CommandName, Result};

fn params(text: &str) -> Vec<String> {
    parse(text).parameters
}

#[test]
fn test_voice_scenarios() {
    let play = parse("play lofi hip hop beats");
    assert_eq!(play.command, CommandName::Play);
    assert_eq!(play.parameters, ["lofi hip hop beats"]);

    let stop = parse("stop");
    assert_eq!(stop.command, CommandName::Stop);
    assert!(stop.parameters.is_empty());

    let help = parse("what can you do");
    assert_eq!(help.command, CommandName::Help);
    assert!(help.parameters.is_empty());

    let chat = parse("tell me a joke");
    assert_eq!(chat.command, CommandName::Chat);
    assert_eq!(chat.parameters, ["tell me a joke"]);
}

#[test]
fn test_synonyms() {
    let table = [
        ("halt", CommandName::Stop),
        ("stop the music", CommandName::Stop),
        ("Please stop.", CommandName::Stop),
        ("next", CommandName::Skip),
        ("skip this track", CommandName::Skip),
        ("pause the music", CommandName::Pause),
        ("hold on", CommandName::Pause),
        ("continue playing", CommandName::Resume),
        ("unpause", CommandName::Resume),
        ("show me the queue", CommandName::Queue),
        ("what's next", CommandName::Queue),
        ("weather", CommandName::Weather),
        ("help", CommandName::Help),
        ("list the commands", CommandName::Help),
    ];

    for (text, expected) in table {
        assert_eq!(parse(text).command, expected, "{text}");
    }
}

#[test]
fn test_weather_location_captured() {
    assert_eq!(params("How's the weather in Paris?"), ["paris"]);
    assert_eq!(params("what's the weather like in tokyo today"), ["tokyo"]);
    assert!(params("what is the weather").is_empty());
}

#[test]
fn test_chat_keeps_original_text() {
    let intent = parse("  Who won the game last night?  ");
    assert_eq!(intent.command, CommandName::Chat);
    assert_eq!(intent.parameters, ["Who won the game last night?"]);
    assert_eq!(intent.transcript, "  Who won the game last night?  ");
}

#[test]
fn test_parse_is_deterministic() {
    for text in ["play something", "skip", "what can you do", "sing a song", ""] {
        assert_eq!(parse(text), parse(text), "{text}");
    }
}

/// Play handler that defers and then follows up
struct SlowPlay;

#[async_trait]
impl CommandHandler for SlowPlay {
    fn description(&self) -> &str {
        "play a track"
    }

    async fn handle(&self, ctx: &dyn CommandContext, params: &[String]) -> Result<String> {
        ctx.defer().await?;
        let text = format!("Now playing {}", params.join(" "));
        ctx.follow_up(&text).await?;
        Ok(text)
    }
}

fn dispatcher() -> CommandDispatcher {
    CommandDispatcher::new(Arc::new(UnhandledChat))
        .register(CommandName::Play, Arc::new(SlowPlay))
        .with_help()
}

#[tokio::test]
async fn test_deferred_reply_flow() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = VoiceReplyContext::new(ChannelRef::new("guild", "voice"), "alice", tx);

    let reply = dispatcher()
        .dispatch(&parse("play lofi hip hop beats"), &ctx)
        .await
        .unwrap();
    assert_eq!(reply, "Now playing lofi hip hop beats");
    assert!(ctx.is_deferred());

    let deferred = rx.recv().await.unwrap();
    assert_eq!(deferred.kind, ReplyKind::Deferred);
    assert_eq!(deferred.speaker, "alice");

    let follow_up = rx.recv().await.unwrap();
    assert_eq!(follow_up.kind, ReplyKind::FollowUp);
    assert_eq!(follow_up.text, reply);
    assert_eq!(follow_up.channel_id, "voice");
}

#[tokio::test]
async fn test_help_lists_registered_commands() {
    let ctx = VoiceReplyContext::logging(ChannelRef::new("guild", "voice"), "alice");
    let dispatcher = dispatcher();
    assert!(dispatcher.handles(CommandName::Help));
    assert!(!dispatcher.handles(CommandName::Weather));

    let text = dispatcher
        .dispatch(&parse("what can you do"), &ctx)
        .await
        .unwrap();
    assert!(text.contains("- play: play a track"));
    assert!(!text.contains("weather"));
}

#[tokio::test]
async fn test_unregistered_command_falls_back_to_chat() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = VoiceReplyContext::new(ChannelRef::new("guild", "voice"), "bob", tx);

    let text = dispatcher().dispatch(&parse("skip"), &ctx).await.unwrap();
    assert_eq!(text, "Sorry, I can't help with \"skip\" yet.");
    assert_eq!(rx.recv().await.unwrap().kind, ReplyKind::Reply);
}
