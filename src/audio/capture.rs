//! Microphone capture and the per-utterance capture controller.
//!
//! A [`Microphone`] hands out two taps per acquisition: an analysis tap
//! carrying the RMS energy of the latest callback buffer, and a
//! [`Recorder`] accumulating the utterance. The [`AudioCaptureController`]
//! drives one acquisition at a time, runs the VAD analysis loop against the
//! analysis tap and always releases the device when the attempt ends.

use crate::config::{AudioConfig, AudioEncoding, VadConfig};
use crate::error::{ConciergeError, Result};
use crate::vad::{StopReason, VoiceActivityDetector, rms_energy};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Taps opened on an acquired input device.
pub struct OpenedCapture {
    /// RMS energy of the most recent input buffer.
    pub analysis: watch::Receiver<f32>,
    pub recorder: Box<dyn Recorder>,
}

/// Recording tap of an acquired device.
pub trait Recorder: Send {
    /// Encoding the recorder produces.
    fn encoding(&self) -> AudioEncoding;

    /// Encode everything captured so far into one payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio cannot be encoded.
    fn finalize(&mut self) -> Result<Vec<u8>>;

    /// Stop the device tracks. Must be idempotent.
    fn release(&mut self);
}

/// Input device seam.
pub trait Microphone: Send + Sync + 'static {
    /// Whether the device can record in `encoding`.
    fn supports(&self, encoding: AudioEncoding) -> bool;

    /// Acquire the device and start both taps.
    ///
    /// # Errors
    ///
    /// Returns [`ConciergeError::Permission`] if the device is denied or missing.
    fn open(&self, encoding: AudioEncoding) -> Result<OpenedCapture>;
}

/// First encoding in `preference` that `mic` supports.
///
/// # Errors
///
/// Returns [`ConciergeError::Audio`] if none is supported.
pub fn select_encoding(mic: &dyn Microphone, preference: &[AudioEncoding]) -> Result<AudioEncoding> {
    for encoding in preference {
        if mic.supports(*encoding) {
            return Ok(*encoding);
        }
        debug!("encoding {encoding:?} unsupported, trying next");
    }
    Err(ConciergeError::Audio(
        "no supported recording encoding".into(),
    ))
}

/// Signals from the analysis loop of one capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSignal {
    SpeechStarted { epoch: u64 },
    VadStop { epoch: u64, reason: StopReason },
}

/// A finalized utterance.
#[derive(Debug, Clone)]
pub struct CapturedUtterance {
    pub epoch: u64,
    pub encoding: AudioEncoding,
    pub audio: Vec<u8>,
}

/// Releases the device when dropped, on every exit path.
struct DeviceGuard {
    recorder: Box<dyn Recorder>,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.recorder.release();
    }
}

struct ActiveCapture {
    epoch: u64,
    device: DeviceGuard,
    cancel: CancellationToken,
    analysis: JoinHandle<()>,
}

impl ActiveCapture {
    fn cancel_analysis(&self) {
        self.cancel.cancel();
        self.analysis.abort();
    }
}

/// Owns the microphone for one capture attempt at a time.
pub struct AudioCaptureController {
    mic: Arc<dyn Microphone>,
    vad: VadConfig,
    preference: Vec<AudioEncoding>,
    epoch: u64,
    active: Option<ActiveCapture>,
    signals: mpsc::UnboundedSender<CaptureSignal>,
}

impl AudioCaptureController {
    /// Create a controller and the receiver for its analysis signals.
    pub fn new(
        mic: Arc<dyn Microphone>,
        vad: VadConfig,
        preference: Vec<AudioEncoding>,
    ) -> (Self, mpsc::UnboundedReceiver<CaptureSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        (
            Self {
                mic,
                vad,
                preference,
                epoch: 0,
                active: None,
                signals,
            },
            rx,
        )
    }

    /// Whether a capture is in progress.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Epoch of the current (or most recent) capture attempt.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Acquire the device and start the analysis loop.
    ///
    /// Returns the epoch of the new attempt.
    ///
    /// # Errors
    ///
    /// Rejects a second concurrent capture; propagates device acquisition
    /// failures ([`ConciergeError::Permission`]).
    pub fn start(&mut self) -> Result<u64> {
        if self.active.is_some() {
            return Err(ConciergeError::Audio("capture already in progress".into()));
        }

        let encoding = select_encoding(self.mic.as_ref(), &self.preference)?;
        let opened = self.mic.open(encoding)?;
        let device = DeviceGuard {
            recorder: opened.recorder,
        };

        self.epoch += 1;
        let epoch = self.epoch;
        let cancel = CancellationToken::new();
        let analysis = tokio::spawn(analysis_loop(
            epoch,
            opened.analysis,
            self.vad.clone(),
            cancel.clone(),
            self.signals.clone(),
        ));

        info!("capture {epoch} started ({encoding:?})");
        self.active = Some(ActiveCapture {
            epoch,
            device,
            cancel,
            analysis,
        });
        Ok(epoch)
    }

    /// Stop the current capture and return what was recorded.
    ///
    /// The device is released whether or not finalization succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing is being captured or finalization fails.
    pub fn stop(&mut self) -> Result<CapturedUtterance> {
        let active = self
            .active
            .take()
            .ok_or_else(|| ConciergeError::Audio("no capture in progress".into()))?;
        active.cancel_analysis();

        let ActiveCapture {
            epoch, mut device, ..
        } = active;
        let encoding = device.recorder.encoding();
        let finalized = device.recorder.finalize();
        drop(device);

        match finalized {
            Ok(audio) => {
                info!("capture {epoch} stopped: {} bytes", audio.len());
                Ok(CapturedUtterance {
                    epoch,
                    encoding,
                    audio,
                })
            }
            Err(e) => {
                error!("capture {epoch} finalize failed: {e}");
                Err(e)
            }
        }
    }

    /// Release the device and drop whatever was recorded.
    pub fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel_analysis();
            info!("capture {} aborted", active.epoch);
        }
    }
}

impl Drop for AudioCaptureController {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Per-frame VAD loop for one capture attempt. Ends on cancel or stop.
async fn analysis_loop(
    epoch: u64,
    mut energy: watch::Receiver<f32>,
    config: VadConfig,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<CaptureSignal>,
) {
    let mut vad = VoiceActivityDetector::new(&config, tokio::time::Instant::now().into_std());
    let mut ticker = tokio::time::interval(config.frame_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // A dropped sender means the device went away; treat it as silence.
        let level = if energy.has_changed().is_err() {
            0.0
        } else {
            *energy.borrow_and_update()
        };
        let frame = vad.process(level, tokio::time::Instant::now().into_std());

        if frame.speech_started {
            let _ = signals.send(CaptureSignal::SpeechStarted { epoch });
        }
        if let Some(reason) = frame.stop {
            let _ = signals.send(CaptureSignal::VadStop { epoch, reason });
            break;
        }
    }
    debug!("analysis loop {epoch} ended");
}

/// Microphone backed by the system input device via cpal.
///
/// cpal streams are not `Send`, so each acquisition runs its stream on a
/// dedicated thread that holds it until released.
pub struct CpalMicrophone {
    device_name: Option<String>,
    target_sample_rate: u32,
}

impl CpalMicrophone {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
            target_sample_rate: config.capture_sample_rate,
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
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

impl Microphone for CpalMicrophone {
    fn supports(&self, encoding: AudioEncoding) -> bool {
        matches!(encoding, AudioEncoding::WavPcm16 | AudioEncoding::WavFloat32)
    }

    fn open(&self, encoding: AudioEncoding) -> Result<OpenedCapture> {
        let (energy_tx, energy_rx) = watch::channel(0.0f32);
        let samples = Arc::new(Mutex::new(Vec::<f32>::new()));
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let device_name = self.device_name.clone();
        let target_rate = self.target_sample_rate;
        let buffer = Arc::clone(&samples);

        let thread = std::thread::Builder::new()
            .name("concierge-mic".into())
            .spawn(move || {
                let stream = match build_input_stream(device_name, target_rate, energy_tx, buffer)
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Hold the stream until released (or the recorder is dropped).
                let _ = stop_rx.recv();
                drop(stream);
                info!("microphone released");
            })
            .map_err(|e| ConciergeError::Audio(format!("cannot spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(ConciergeError::Audio("capture thread exited".into()));
            }
        }

        Ok(OpenedCapture {
            analysis: energy_rx,
            recorder: Box::new(CpalRecorder {
                samples,
                sample_rate: target_rate,
                encoding,
                stop: Some(stop_tx),
                thread: Some(thread),
            }),
        })
    }
}

fn build_input_stream(
    device_name: Option<String>,
    target_rate: u32,
    energy_tx: watch::Sender<f32>,
    buffer: Arc<Mutex<Vec<f32>>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = device_name {
        host.input_devices()
            .map_err(|e| ConciergeError::Permission(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| ConciergeError::Permission(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| ConciergeError::Permission("no default input device".into()))?
    };

    let default_config = device
        .default_input_config()
        .map_err(|e| ConciergeError::Permission(format!("no default input config: {e}")))?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };
                let samples = resample_linear(&mono, native_rate, target_rate);

                energy_tx.send_replace(rms_energy(&samples));
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(&samples);
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| ConciergeError::Permission(format!("failed to open input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| ConciergeError::Permission(format!("failed to start input stream: {e}")))?;

    info!(
        "microphone acquired: native {}Hz x{} -> {}Hz mono",
        native_rate, native_channels, target_rate
    );
    Ok(stream)
}

struct CpalRecorder {
    samples: Arc<Mutex<Vec<f32>>>,
    sample_rate: u32,
    encoding: AudioEncoding,
    stop: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Recorder for CpalRecorder {
    fn encoding(&self) -> AudioEncoding {
        self.encoding
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        let samples = {
            let mut buf = self
                .samples
                .lock()
                .map_err(|e| ConciergeError::Audio(format!("capture buffer lock poisoned: {e}")))?;
            std::mem::take(&mut *buf)
        };
        encode_wav(&samples, self.sample_rate, self.encoding)
    }

    fn release(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("capture thread panicked");
            }
        }
    }
}

impl Drop for CpalRecorder {
    fn drop(&mut self) {
        self.release();
    }
}

/// Encode mono samples as a WAV file in memory.
///
/// # Errors
///
/// Returns [`ConciergeError::Codec`] if the WAV writer fails.
pub fn encode_wav(samples: &[f32], sample_rate: u32, encoding: AudioEncoding) -> Result<Vec<u8>> {
    let (bits_per_sample, sample_format) = match encoding {
        AudioEncoding::WavPcm16 => (16, hound::SampleFormat::Int),
        AudioEncoding::WavFloat32 => (32, hound::SampleFormat::Float),
    };
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample,
        sample_format,
    };
    let codec = |e: hound::Error| ConciergeError::Codec(format!("wav encode failed: {e}"));

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(codec)?;
        for &s in samples {
            match encoding {
                AudioEncoding::WavPcm16 => {
                    let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                    writer.write_sample(v).map_err(codec)?;
                }
                AudioEncoding::WavFloat32 => writer.write_sample(s).map_err(codec)?,
            }
        }
        writer.finalize().map_err(codec)?;
    }
    Ok(cursor.into_inner())
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub(crate) fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler (no anti-alias filter).
pub(crate) fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}
