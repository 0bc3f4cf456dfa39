//! Reassembly of streamed response audio.
//!
//! The peer sends `audio_start`, any number of base64 `audio_chunk`
//! fragments and then `audio_complete`. Fragments are kept in arrival order
//! and concatenated byte-for-byte on completion.

use crate::error::{ConciergeError, Result};
use base64::Engine;
use bytes::{Bytes, BytesMut};
use tracing::debug;

/// Buffers response fragments for one turn.
#[derive(Debug, Default)]
pub struct ResponseAudioAssembler {
    fragments: Vec<Bytes>,
    len: usize,
}

impl ResponseAudioAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new response; drops anything left from a previous one.
    pub fn begin(&mut self) {
        if !self.fragments.is_empty() {
            debug!(
                "discarding {} unfinished response fragments",
                self.fragments.len()
            );
        }
        self.clear();
    }

    /// Decode and append one base64 fragment.
    ///
    /// # Errors
    ///
    /// Returns [`ConciergeError::Codec`] if the fragment is not valid base64;
    /// the buffer is left unchanged.
    pub fn push_base64(&mut self, fragment: &str) -> Result<()> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(fragment.trim())
            .map_err(|e| ConciergeError::Codec(format!("bad audio fragment: {e}")))?;
        self.push(Bytes::from(bytes));
        Ok(())
    }

    /// Append one raw fragment.
    pub fn push(&mut self, fragment: Bytes) {
        self.len += fragment.len();
        self.fragments.push(fragment);
    }

    /// Concatenate all fragments and reset. `None` when nothing was buffered.
    pub fn complete(&mut self) -> Option<Bytes> {
        if self.fragments.is_empty() {
            return None;
        }
        let mut out = BytesMut::with_capacity(self.len);
        for fragment in self.fragments.drain(..) {
            out.extend_from_slice(&fragment);
        }
        self.len = 0;
        Some(out.freeze())
    }

    /// Drop all buffered fragments.
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.len = 0;
    }

    /// Number of buffered fragments.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn fragments_concatenate_in_arrival_order() {
        let mut assembler = ResponseAudioAssembler::new();
        assembler.begin();
        assembler.push_base64(&b64(b"ID3")).unwrap();
        assembler.push_base64(&b64(&[0, 1, 2, 3])).unwrap();
        assembler.push_base64(&b64(b"tail")).unwrap();

        let audio = assembler.complete().unwrap();
        assert_eq!(&audio[..], b"ID3\x00\x01\x02\x03tail");
        assert_eq!(assembler.fragment_count(), 0);
    }

    #[test]
    fn empty_completion_yields_nothing() {
        let mut assembler = ResponseAudioAssembler::new();
        assembler.begin();
        assert!(assembler.complete().is_none());
    }

    #[test]
    fn begin_discards_previous_turn() {
        let mut assembler = ResponseAudioAssembler::new();
        assembler.push_base64(&b64(b"stale")).unwrap();
        assembler.begin();
        assembler.push_base64(&b64(b"fresh")).unwrap();
        assert_eq!(&assembler.complete().unwrap()[..], b"fresh");
    }

    #[test]
    fn invalid_base64_leaves_buffer_untouched() {
        let mut assembler = ResponseAudioAssembler::new();
        assembler.push_base64(&b64(b"ok")).unwrap();
        assert!(matches!(
            assembler.push_base64("!!not base64!!"),
            Err(ConciergeError::Codec(_))
        ));
        assert_eq!(assembler.fragment_count(), 1);
    }
}
