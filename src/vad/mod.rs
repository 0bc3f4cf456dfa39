//! Voice activity detection using adaptive energy thresholding.
//!
//! The detector is a resettable state machine stepped once per analysis
//! frame with the frame's RMS energy and timestamp. It never fails: missing
//! or non-finite energy is treated as silence, so a muted device ends in the
//! no-speech stop instead of recording forever.

use crate::config::VadConfig;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Why the detector asked the caller to end the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Enough speech was heard, followed by a long enough pause.
    SilenceAfterSpeech,
    /// Nothing meaningful was said within the no-speech window.
    NoSpeech,
    /// The absolute recording limit was reached.
    MaxDuration,
}

impl StopReason {
    /// Short label for logs and UI.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SilenceAfterSpeech => "silence_after_speech",
            Self::NoSpeech => "no_speech",
            Self::MaxDuration => "max_duration",
        }
    }
}

/// Result of stepping the detector with one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadFrame {
    /// Whether this frame was classified as speech.
    pub speaking: bool,
    /// Speech was detected for the first time in this attempt.
    pub speech_started: bool,
    /// The caller should stop recording. Reported at most once per attempt.
    pub stop: Option<StopReason>,
}

/// Mutable detector state. Recreated by [`VoiceActivityDetector::reset`].
#[derive(Debug, Clone)]
pub struct VadState {
    pub calibrating: bool,
    pub calibration_start: Instant,
    pub background_energy: f32,
    /// Always `>= initial_energy_threshold`.
    pub adaptive_threshold: f32,
    pub smoothed_energy: f32,
    /// Sticky: speech has been heard at least once in this attempt.
    pub speech_detected: bool,
    /// Previous frame was speech.
    pub speaking: bool,
    pub last_speech_at: Option<Instant>,
    /// Set only after speech was detected and energy fell below threshold.
    pub silence_started_at: Option<Instant>,
    pub speech_accumulated: Duration,
    pub last_frame_at: Instant,
    pub stopped: Option<StopReason>,
}

impl VadState {
    fn fresh(config: &VadConfig, now: Instant) -> Self {
        Self {
            calibrating: true,
            calibration_start: now,
            background_energy: 0.0,
            adaptive_threshold: config.initial_energy_threshold,
            smoothed_energy: 0.0,
            speech_detected: false,
            speaking: false,
            last_speech_at: None,
            silence_started_at: None,
            speech_accumulated: Duration::ZERO,
            last_frame_at: now,
            stopped: None,
        }
    }
}

/// Adaptive energy-based voice activity detector.
pub struct VoiceActivityDetector {
    config: VadConfig,
    state: VadState,
    calibration: Duration,
    min_silence: Duration,
    min_speech: Duration,
    no_speech_timeout: Duration,
    max_recording: Duration,
}

impl VoiceActivityDetector {
    /// Create a detector whose first attempt starts calibrating at `now`.
    #[must_use]
    pub fn new(config: &VadConfig, now: Instant) -> Self {
        Self {
            state: VadState::fresh(config, now),
            calibration: Duration::from_millis(config.calibration_ms),
            min_silence: Duration::from_millis(config.min_silence_ms),
            min_speech: Duration::from_millis(config.min_speech_ms),
            no_speech_timeout: Duration::from_millis(config.no_speech_timeout_ms),
            max_recording: Duration::from_millis(config.max_recording_ms),
            config: config.clone(),
        }
    }

    /// Discard all state and restart calibration at `now`.
    ///
    /// Must be called at the start of every capture attempt; thresholds from
    /// a previous room must not leak into the next one.
    pub fn reset(&mut self, now: Instant) {
        self.state = VadState::fresh(&self.config, now);
    }

    /// Step the detector with one frame of RMS energy captured at `now`.
    pub fn process(&mut self, raw_energy: f32, now: Instant) -> VadFrame {
        if self.state.stopped.is_some() {
            return VadFrame::default();
        }

        let raw = if raw_energy.is_finite() && raw_energy > 0.0 {
            raw_energy
        } else {
            0.0
        };
        let frame_elapsed = now.saturating_duration_since(self.state.last_frame_at);
        self.state.last_frame_at = now;

        let alpha = self.config.energy_smoothing;
        self.state.smoothed_energy = alpha * self.state.smoothed_energy + (1.0 - alpha) * raw;

        let since_start = now.saturating_duration_since(self.state.calibration_start);
        let mut frame = VadFrame::default();

        if self.state.calibrating && since_start >= self.calibration {
            self.state.calibrating = false;
            info!(
                "VAD calibrated: background={:.5}, threshold={:.5}",
                self.state.background_energy, self.state.adaptive_threshold
            );
        }

        if self.state.calibrating {
            self.state.background_energy =
                (self.state.background_energy + self.state.smoothed_energy) / 2.0;
            self.state.adaptive_threshold = self
                .config
                .initial_energy_threshold
                .max(self.state.background_energy * self.config.energy_multiplier);
        } else {
            frame.speaking = self.state.smoothed_energy > self.state.adaptive_threshold;
            self.classify(&mut frame, frame_elapsed, now);
        }

        frame.stop = self.stop_reason(since_start, now);
        if let Some(reason) = frame.stop {
            self.state.stopped = Some(reason);
            info!(
                "VAD stop: reason={}, speech={}ms, elapsed={}ms",
                reason.as_str(),
                self.state.speech_accumulated.as_millis(),
                since_start.as_millis()
            );
        }
        frame
    }

    fn classify(&mut self, frame: &mut VadFrame, frame_elapsed: Duration, now: Instant) {
        let state = &mut self.state;
        if frame.speaking {
            if !state.speaking {
                state.silence_started_at = None;
                if !state.speech_detected {
                    frame.speech_started = true;
                    debug!("speech started");
                }
                state.speech_detected = true;
            }
            state.speech_accumulated += frame_elapsed;
            state.last_speech_at = Some(now);
        } else if state.speech_detected && state.silence_started_at.is_none() {
            state.silence_started_at = Some(now);
        }
        state.speaking = frame.speaking;
    }

    /// Precedence: absolute limit, then end of utterance, then no-speech.
    fn stop_reason(&self, since_start: Duration, now: Instant) -> Option<StopReason> {
        let state = &self.state;
        let meaningful_speech = state.speech_accumulated >= self.min_speech;

        if since_start >= self.max_recording {
            return Some(StopReason::MaxDuration);
        }
        if let Some(silence_start) = state.silence_started_at {
            if meaningful_speech && now.saturating_duration_since(silence_start) >= self.min_silence
            {
                return Some(StopReason::SilenceAfterSpeech);
            }
        }
        if since_start > self.no_speech_timeout && !meaningful_speech {
            return Some(StopReason::NoSpeech);
        }
        None
    }

    /// Current detector state.
    #[must_use]
    pub fn state(&self) -> &VadState {
        &self.state
    }

    /// Current speech threshold.
    #[must_use]
    pub fn adaptive_threshold(&self) -> f32 {
        self.state.adaptive_threshold
    }

    /// Whether the calibration window is still open.
    #[must_use]
    pub fn is_calibrating(&self) -> bool {
        self.state.calibrating
    }
}

/// Compute RMS energy of audio samples.
#[must_use]
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
