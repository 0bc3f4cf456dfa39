//! Microphone capture and response playback via cpal.

pub mod capture;
pub mod playback;
