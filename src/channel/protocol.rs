//! JSON envelopes exchanged with the concierge service.
//!
//! Every envelope is an object tagged by its `type` field. Each channel has
//! its own closed set of types; unknown types decode to an `Unknown` variant
//! and are ignored by the channel.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tracing::{debug, warn};

/// Message set of one duplex channel.
pub trait Protocol: Send + Sync + 'static {
    type Outbound: Serialize + Debug + Send + Sync + 'static;
    type Inbound: DeserializeOwned + Debug + Send + 'static;

    /// Channel name used in logs.
    const NAME: &'static str;

    /// First envelope sent on every new connection.
    fn init(session_id: String, token: Option<String>) -> Self::Outbound;

    /// Keep-alive envelope.
    fn ping() -> Self::Outbound;

    /// Handshake acknowledgement from the peer.
    fn is_connected(message: &Self::Inbound) -> bool;

    /// Keep-alive reply from the peer.
    fn is_pong(message: &Self::Inbound) -> bool;

    /// Envelope with a type outside this channel's set.
    fn is_unknown(message: &Self::Inbound) -> bool;
}

/// Voice channel envelopes sent to the peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioOutbound {
    Init {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    AudioStart,
    /// One complete utterance, base64 encoded.
    AudioEnd { audio: String, mime_type: String },
    Ping,
}

/// Voice channel envelopes received from the peer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioInbound {
    Connected {
        #[serde(default)]
        session_id: Option<String>,
    },
    Transcription {
        #[serde(default)]
        text: String,
    },
    ResponseText {
        #[serde(default)]
        text: String,
    },
    AudioStart,
    /// One base64 fragment of the response audio.
    AudioChunk { audio: String },
    AudioComplete,
    TripPlan {
        #[serde(default)]
        data: serde_json::Value,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

/// Text channel envelopes sent to the peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextOutbound {
    Init {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Message { content: String },
    Ping,
}

/// Text channel envelopes received from the peer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextInbound {
    Connected {
        #[serde(default)]
        session_id: Option<String>,
    },
    Typing {
        #[serde(default)]
        status: bool,
    },
    /// Incremental response text.
    Chunk {
        #[serde(default)]
        content: String,
    },
    /// Terminal payload of a turn.
    Response {
        #[serde(default)]
        content: String,
    },
    TripPlan {
        #[serde(default)]
        data: serde_json::Value,
    },
    Suggestion {
        #[serde(default)]
        data: serde_json::Value,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

/// Voice channel message set.
#[derive(Debug, Clone, Copy)]
pub struct AudioProtocol;

impl Protocol for AudioProtocol {
    type Outbound = AudioOutbound;
    type Inbound = AudioInbound;

    const NAME: &'static str = "audio";

    fn init(session_id: String, token: Option<String>) -> AudioOutbound {
        AudioOutbound::Init { session_id, token }
    }

    fn ping() -> AudioOutbound {
        AudioOutbound::Ping
    }

    fn is_connected(message: &AudioInbound) -> bool {
        matches!(message, AudioInbound::Connected { .. })
    }

    fn is_pong(message: &AudioInbound) -> bool {
        matches!(message, AudioInbound::Pong)
    }

    fn is_unknown(message: &AudioInbound) -> bool {
        matches!(message, AudioInbound::Unknown)
    }
}

/// Text chat message set.
#[derive(Debug, Clone, Copy)]
pub struct TextProtocol;

impl Protocol for TextProtocol {
    type Outbound = TextOutbound;
    type Inbound = TextInbound;

    const NAME: &'static str = "text";

    fn init(session_id: String, token: Option<String>) -> TextOutbound {
        TextOutbound::Init { session_id, token }
    }

    fn ping() -> TextOutbound {
        TextOutbound::Ping
    }

    fn is_connected(message: &TextInbound) -> bool {
        matches!(message, TextInbound::Connected { .. })
    }

    fn is_pong(message: &TextInbound) -> bool {
        matches!(message, TextInbound::Pong)
    }

    fn is_unknown(message: &TextInbound) -> bool {
        matches!(message, TextInbound::Unknown)
    }
}

/// Decode one text frame. Malformed and unknown envelopes yield `None`.
pub fn decode_inbound<P: Protocol>(raw: &str) -> Option<P::Inbound> {
    match serde_json::from_str::<P::Inbound>(raw) {
        Ok(message) if P::is_unknown(&message) => {
            debug!("{} channel: ignoring unknown envelope", P::NAME);
            None
        }
        Ok(message) => Some(message),
        Err(e) => {
            warn!("{} channel: dropping malformed envelope: {e}", P::NAME);
            None
        }
    }
}
