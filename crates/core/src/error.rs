use std::path::PathBuf;

use crate::{channel::Channel, player::PlayerState};

/// Result alias that carries the custom [`PlayerError`] type.
pub type Result<T> = std::result::Result<T, PlayerError>;

/// Reasons a motion timeline could not be turned into a [`crate::Timeline`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The document is not JSON at all.
    #[error("timeline is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// None of the accepted shapes matched. Each attempt records why it was
    /// rejected so that the caller can tell which shape was closest.
    #[error("unsupported timeline schema ({})", .attempts.join("; "))]
    UnsupportedSchema { attempts: Vec<String> },
    /// A shape matched structurally but one of its keyframes is unusable.
    #[error("malformed keyframe at {location}: {reason}")]
    MalformedKeyframe { location: String, reason: String },
}

impl ParseError {
    pub(crate) fn malformed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedKeyframe {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// The audio track of a session could not be opened for playback.
#[derive(Debug, thiserror::Error)]
#[error("cannot open audio `{}`: {reason}", .path.display())]
pub struct AudioOpenError {
    pub path: PathBuf,
    pub reason: String,
}

impl AudioOpenError {
    pub fn new(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// A bus write kept failing after the bounded retry.
#[derive(Debug, thiserror::Error)]
#[error("{channel} write failed after {attempts} attempts: {source}")]
pub struct HardwareWriteError {
    pub channel: Channel,
    pub attempts: u32,
    #[source]
    pub source: std::io::Error,
}

/// Command names used when reporting rejected transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Play,
    Pause,
    Resume,
    Stop,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    AudioOpen(#[from] AudioOpenError),
    #[error(transparent)]
    Hardware(#[from] HardwareWriteError),
    /// The command is not valid in the current state. Nothing changed.
    #[error("cannot {command} while {from:?}")]
    InvalidStateTransition {
        from: PlayerState,
        command: CommandKind,
    },
    #[error("session `{0}` not found")]
    SessionNotFound(String),
    #[error("calibration store: {0}")]
    Calibration(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The control-loop worker is no longer running.
    #[error("player worker has shut down")]
    WorkerGone,
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl PlayerError {
    /// Returns true when the error rejected a command without side effects.
    pub fn is_rejected_transition(&self) -> bool {
        matches!(self, Self::InvalidStateTransition { .. })
    }
}
