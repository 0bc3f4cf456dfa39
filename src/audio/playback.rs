//! Response audio playback to system speakers via cpal.

use crate::audio::capture::{resample_linear, to_mono};
use crate::config::AudioConfig;
use crate::error::{ConciergeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Plays one assembled response.
#[async_trait]
pub trait ResponsePlayer: Send + Sync + 'static {
    /// Play `audio` to completion, or until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`ConciergeError::Playback`] if the audio cannot be decoded
    /// or the output device fails.
    async fn play(&self, audio: Bytes, cancel: CancellationToken) -> Result<()>;
}

/// Decoded mono PCM.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Playback through the system output device.
pub struct CpalPlayer {
    device_name: Option<String>,
}

impl CpalPlayer {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.output_device.clone(),
        }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| ConciergeError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl ResponsePlayer for CpalPlayer {
    async fn play(&self, audio: Bytes, cancel: CancellationToken) -> Result<()> {
        let device_name = self.device_name.clone();
        tokio::task::spawn_blocking(move || {
            let decoded = decode_audio(&audio)?;
            play_blocking(device_name.as_deref(), &decoded, &cancel)
        })
        .await
        .map_err(|e| ConciergeError::Playback(format!("playback task failed: {e}")))?
    }
}

/// Decode an encoded response (mp3, aac, wav) to mono f32.
///
/// # Errors
///
/// Returns [`ConciergeError::Playback`] if the container or codec is not
/// recognised.
pub fn decode_audio(audio: &[u8]) -> Result<DecodedAudio> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let source = std::io::Cursor::new(audio.to_vec());
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| ConciergeError::Playback(format!("unrecognised response audio: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| ConciergeError::Playback("no default audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| ConciergeError::Playback("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| ConciergeError::Playback(format!("failed to create decoder: {e}")))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(ConciergeError::Playback(format!("audio read error: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(msg)) => {
                debug!("skipping undecodable packet: {msg}");
                continue;
            }
            Err(e) => return Err(ConciergeError::Playback(format!("audio decode error: {e}"))),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        if channels <= 1 {
            samples.extend_from_slice(buf.samples());
        } else {
            samples.extend(to_mono(buf.samples(), channels as u16));
        }
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

fn play_blocking(
    device_name: Option<&str>,
    audio: &DecodedAudio,
    cancel: &CancellationToken,
) -> Result<()> {
    let host = cpal::default_host();
    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| ConciergeError::Playback(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| ConciergeError::Playback(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| ConciergeError::Playback("no default output device".into()))?
    };

    let default_config = device
        .default_output_config()
        .map_err(|e| ConciergeError::Playback(format!("no default output config: {e}")))?;
    let device_rate = default_config.sample_rate();
    let device_channels = default_config.channels();

    let stream_config = StreamConfig {
        channels: device_channels,
        sample_rate: device_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let samples = resample_linear(&audio.samples, audio.sample_rate, device_rate);
    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples,
        position: 0,
        finished: false,
    }));
    let buffer_clone = Arc::clone(&buffer);
    let channels = device_channels.max(1) as usize;

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut buf = match buffer_clone.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };

                for frame in data.chunks_mut(channels) {
                    let value = if buf.position < buf.samples.len() {
                        let v = buf.samples[buf.position];
                        buf.position += 1;
                        v
                    } else {
                        buf.finished = true;
                        0.0
                    };
                    frame.fill(value);
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| ConciergeError::Playback(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| ConciergeError::Playback(format!("failed to start output stream: {e}")))?;
    info!(
        "playing response: {:.1}s at {}Hz",
        audio.samples.len() as f32 / audio.sample_rate.max(1) as f32,
        device_rate
    );

    loop {
        std::thread::sleep(Duration::from_millis(10));
        if cancel.is_cancelled() {
            debug!("playback cancelled");
            break;
        }
        let buf = buffer
            .lock()
            .map_err(|e| ConciergeError::Playback(format!("playback buffer lock poisoned: {e}")))?;
        if buf.finished {
            break;
        }
    }

    drop(stream);
    Ok(())
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::audio::capture::encode_wav;
    use crate::config::AudioEncoding;

    #[test]
    fn decodes_wav_response() {
        let samples: Vec<f32> = (0..2400).map(|i| (i as f32 / 100.0).sin() * 0.5).collect();
        let wav = encode_wav(&samples, 24_000, AudioEncoding::WavFloat32).unwrap();
        let decoded = decode_audio(&wav).unwrap();
        assert_eq!(decoded.sample_rate, 24_000);
        assert_eq!(decoded.samples.len(), samples.len());
        assert!((decoded.samples[100] - samples[100]).abs() < 1e-6);
    }

    #[test]
    fn garbage_is_a_playback_error() {
        let result = decode_audio(b"definitely not audio");
        assert!(matches!(result, Err(ConciergeError::Playback(_))));
    }
}
