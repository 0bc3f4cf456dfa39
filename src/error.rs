//! Error types for the concierge voice client.

/// Top-level error type for the voice and text channel client.
#[derive(Debug, thiserror::Error)]
pub enum ConciergeError {
    /// Microphone access denied or no usable input device.
    #[error("microphone unavailable: {0}")]
    Permission(String),

    /// Duplex channel failed to open or dropped unexpectedly.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote peer reported a processing error.
    #[error("remote error: {0}")]
    Protocol(String),

    /// Response audio could not be decoded or played.
    #[error("playback error: {0}")]
    Playback(String),

    /// `send` was attempted on a channel that is not connected.
    #[error("channel is not connected")]
    NotConnected,

    /// Audio device or stream error outside of permission handling.
    #[error("audio error: {0}")]
    Audio(String),

    /// Caller-supplied input rejected before reaching the channel.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Payload encoding/decoding error (base64, JSON, WAV).
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Internal task channel closed or full.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ConciergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_message_is_stable() {
        assert_eq!(
            ConciergeError::NotConnected.to_string(),
            "channel is not connected"
        );
    }

    #[test]
    fn io_errors_convert() {
        let err: ConciergeError = std::io::Error::other("disk gone").into();
        assert!(matches!(err, ConciergeError::Io(_)));
    }
}
