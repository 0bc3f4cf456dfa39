//! Concierge: client-side voice and text conversation pipeline.
//!
//! This crate drives a conversation with a remote concierge service:
//! Microphone → VAD → utterance upload → streamed response → Speaker
//!
//! # Architecture
//!
//! The pipeline is built from independent stages connected by async channels:
//! - **Audio capture**: Records from the microphone via `cpal`
//! - **VAD**: Adaptive energy threshold with calibration and stop rules
//! - **Duplex channel**: Persistent WebSocket with keep-alive and backoff
//! - **Assembler**: Concatenates streamed response audio in arrival order
//! - **Audio playback**: Decodes with `symphonia`, plays via `cpal`
//! - **Orchestrators**: Actor tasks composing the above for voice and text

pub mod assembler;
pub mod audio;
pub mod channel;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod vad;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::ConciergeConfig;
pub use error::{ConciergeError, Result};
pub use pipeline::audio_chat::{AudioChatEvent, AudioChatHandle, AudioChatOrchestrator};
pub use pipeline::text_chat::{TextChatEvent, TextChatHandle, TextChatOrchestrator};
