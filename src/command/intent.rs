//! Transcript to intent parsing

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Commands a transcript can map to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    /// Play something
    Play,
    /// Stop playback
    Stop,
    /// Skip the current item
    Skip,
    /// Pause playback
    Pause,
    /// Resume playback
    Resume,
    /// Inspect the queue
    Queue,
    /// Weather report, optionally for a location
    Weather,
    /// List what the assistant can do
    Help,
    /// Free-form fallback
    Chat,
}

impl CommandName {
    /// Every command, in matching order
    pub const ALL: [Self; 9] = [
        Self::Play,
        Self::Stop,
        Self::Skip,
        Self::Pause,
        Self::Resume,
        Self::Queue,
        Self::Weather,
        Self::Help,
        Self::Chat,
    ];

    /// Wire name of the command
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Stop => "stop",
            Self::Skip => "skip",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Queue => "queue",
            Self::Weather => "weather",
            Self::Help => "help",
            Self::Chat => "chat",
        }
    }
}

impl std::fmt::Display for CommandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed voice command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Intent {
    /// Matched command
    pub command: CommandName,

    /// Captured parameters, trimmed and non-empty
    pub parameters: Vec<String>,

    /// Transcript the intent was parsed from
    pub transcript: String,
}

static PATTERNS: LazyLock<Vec<(CommandName, Regex)>> = LazyLock::new(|| {
    [
        (CommandName::Play, r"^(?:please\s+)?play\s+(.+)$"),
        (
            CommandName::Stop,
            r"^(?:please\s+)?(?:stop|halt|cease|end)(?:\s+(?:it|that|the music|music|playing|playback))?$",
        ),
        (
            CommandName::Skip,
            r"^(?:please\s+)?(?:skip|next)(?:\s+(?:it|this|that|song|track|this song|this track|the song|the track))?$",
        ),
        (
            CommandName::Pause,
            r"^(?:please\s+)?(?:pause|hold|wait)(?:\s+(?:it|on|that|the music|music|playback))?$",
        ),
        (
            CommandName::Resume,
            r"^(?:please\s+)?(?:resume|continue|unpause)(?:\s+(?:it|that|playing|playback|the music|music))?$",
        ),
        (
            CommandName::Queue,
            r"^(?:(?:show|list)(?: me)?(?: the)? queue|(?:what's|what is) (?:in |on )?the queue|(?:what's|what is) (?:playing )?next|queue)$",
        ),
        (
            CommandName::Weather,
            r"^(?:(?:what's|what is|how's|how is) the )?weather(?: like)?(?:\s+(?:in|for|at)\s+(.+?))?(?:\s+today)?$",
        ),
        (
            CommandName::Help,
            r"^(?:help(?: me)?|what can you do|what can i say|(?:what are )?(?:the |your )?commands|(?:list|show)(?: me)?(?: the)? commands)$",
        ),
    ]
    .into_iter()
    .map(|(command, pattern)| (command, Regex::new(pattern).expect("valid regex")))
    .collect()
});

/// Lower-case, trim, drop trailing punctuation and collapse whitespace
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .trim()
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | '!' | '?' | ';' | ':'))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a transcript into an intent.
///
/// Patterns are tried in order and the first match wins. Anything else is
/// a `chat` intent carrying the original text.
#[must_use]
pub fn parse(transcript: &str) -> Intent {
    let normalized = normalize(transcript);

    for (command, pattern) in PATTERNS.iter() {
        if let Some(caps) = pattern.captures(&normalized) {
            let parameters = caps
                .iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str().trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();

            return Intent {
                command: *command,
                parameters,
                transcript: transcript.to_string(),
            };
        }
    }

    let original = transcript.trim();
    Intent {
        command: CommandName::Chat,
        parameters: if original.is_empty() {
            Vec::new()
        } else {
            vec![original.to_string()]
        },
        transcript: transcript.to_string(),
    }
}
