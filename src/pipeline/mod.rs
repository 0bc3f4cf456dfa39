//! Conversation orchestrators exposed to the UI layer.
//!
//! Each orchestrator is an actor task owning its channel and state. Callers
//! talk to it through a cloneable handle (commands in), a `watch` status
//! snapshot and a `broadcast` event stream (results out), so any number of
//! consumers can observe a conversation without reaching into its internals.

pub mod audio_chat;
pub mod text_chat;

use crate::error::ConciergeError;

/// Broadcast capacity per orchestrator.
pub(crate) const EVENT_CHANNEL_SIZE: usize = 128;

/// Category of a caller-visible failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Microphone denied or unavailable.
    Permission,
    /// Channel failed to open or dropped.
    Transport,
    /// The peer reported an `error` envelope.
    Protocol,
    /// A command needed a connected channel.
    NotConnected,
    /// Capturing the utterance failed.
    Capture,
    /// Response audio could not be decoded or played.
    Playback,
    /// A payload could not be encoded or decoded.
    Codec,
    /// The caller passed something unusable.
    InvalidInput,
    /// Invalid configuration.
    Config,
    /// Task plumbing or local I/O failed.
    Internal,
}

impl ErrorKind {
    /// Classify a crate error for notification.
    #[must_use]
    pub fn of(err: &ConciergeError) -> Self {
        match err {
            ConciergeError::Permission(_) => Self::Permission,
            ConciergeError::Transport(_) => Self::Transport,
            ConciergeError::Protocol(_) => Self::Protocol,
            ConciergeError::NotConnected => Self::NotConnected,
            ConciergeError::Audio(_) => Self::Capture,
            ConciergeError::Playback(_) => Self::Playback,
            ConciergeError::Codec(_) => Self::Codec,
            ConciergeError::InvalidInput(_) => Self::InvalidInput,
            ConciergeError::Config(_) => Self::Config,
            ConciergeError::Channel(_) | ConciergeError::Io(_) => Self::Internal,
        }
    }
}
