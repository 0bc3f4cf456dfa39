//! Voice conversation flow over the audio channel.
//!
//! One turn: start recording (`audio_start` to the peer) → VAD or caller
//! stops → the utterance goes out as one `audio_end` → the peer answers with
//! `transcription`, `response_text` and a streamed response audio which is
//! assembled and played. With auto-listen on, capture re-arms after the
//! settle delay once playback ends.

use crate::assembler::ResponseAudioAssembler;
use crate::audio::capture::{AudioCaptureController, CaptureSignal, Microphone};
use crate::audio::playback::ResponsePlayer;
use crate::channel::protocol::{AudioInbound, AudioOutbound, AudioProtocol};
use crate::channel::transport::Transport;
use crate::channel::{ChannelEvent, ChannelOptions, ConnectionState, DuplexChannel};
use crate::config::ConciergeConfig;
use crate::error::{ConciergeError, Result};
use crate::pipeline::{EVENT_CHANNEL_SIZE, ErrorKind};
use crate::session::SessionIdentity;
use crate::vad::StopReason;
use base64::Engine;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Snapshot of the voice conversation for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioChatStatus {
    pub connection: ConnectionState,
    pub is_recording: bool,
    /// From the end of recording until `transcription` or `error` arrives.
    pub is_processing: bool,
    pub is_playing: bool,
    pub auto_listen: bool,
}

/// Notifications from the voice conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioChatEvent {
    /// The peer acknowledged `init`.
    Connected { session_id: Option<String> },
    /// The channel closed (deliberately or not).
    Disconnected { reason: String },
    RecordingStarted { epoch: u64 },
    SpeechDetected,
    /// `reason` is `None` for a caller-requested stop.
    RecordingStopped { reason: Option<StopReason> },
    Transcription(String),
    ResponseText(String),
    TripPlan(serde_json::Value),
    PlaybackStarted,
    /// Playback ended, failed, or was interrupted.
    PlaybackFinished,
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug)]
enum AudioCommand {
    Connect,
    Disconnect,
    StartRecording,
    StopRecording,
    SetAutoListen(bool),
    Shutdown,
}

/// Command surface of a running [`AudioChatOrchestrator`].
#[derive(Clone)]
pub struct AudioChatHandle {
    commands: mpsc::UnboundedSender<AudioCommand>,
    events: broadcast::Sender<AudioChatEvent>,
    status: watch::Receiver<AudioChatStatus>,
}

impl AudioChatHandle {
    fn command(&self, command: AudioCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ConciergeError::Channel("audio chat stopped".into()))
    }

    /// Open the audio channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the orchestrator task has stopped.
    pub fn connect(&self) -> Result<()> {
        self.command(AudioCommand::Connect)
    }

    /// Close the audio channel and abort any turn in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the orchestrator task has stopped.
    pub fn disconnect(&self) -> Result<()> {
        self.command(AudioCommand::Disconnect)
    }

    /// Start capturing an utterance. Failures arrive as [`AudioChatEvent::Error`].
    /// An utterance still waiting for its transcription is abandoned.
    ///
    /// # Errors
    ///
    /// Returns an error if the orchestrator task has stopped.
    pub fn start_recording(&self) -> Result<()> {
        self.command(AudioCommand::StartRecording)
    }

    /// Stop capturing and send what was recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the orchestrator task has stopped.
    pub fn stop_recording(&self) -> Result<()> {
        self.command(AudioCommand::StopRecording)
    }

    /// Toggle automatic re-listening after playback.
    ///
    /// # Errors
    ///
    /// Returns an error if the orchestrator task has stopped.
    pub fn set_auto_listen(&self, enabled: bool) -> Result<()> {
        self.command(AudioCommand::SetAutoListen(enabled))
    }

    /// Disconnect and stop the orchestrator task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(AudioCommand::Shutdown);
    }

    /// Subscribe to conversation events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AudioChatEvent> {
        self.events.subscribe()
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> AudioChatStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<AudioChatStatus> {
        self.status.clone()
    }
}

struct PlaybackDone {
    turn: u64,
    result: Result<()>,
}

struct ActivePlayback {
    turn: u64,
    cancel: CancellationToken,
}

/// Actor composing the audio channel, capture, VAD and response playback.
pub struct AudioChatOrchestrator {
    channel: DuplexChannel<AudioProtocol>,
    capture: AudioCaptureController,
    capture_signals: mpsc::UnboundedReceiver<CaptureSignal>,
    assembler: ResponseAudioAssembler,
    player: Arc<dyn ResponsePlayer>,
    playback: Option<ActivePlayback>,
    playback_turn: u64,
    playback_tx: mpsc::UnboundedSender<PlaybackDone>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackDone>,
    settle_delay: Duration,
    rearm_at: Option<Instant>,
    commands: mpsc::UnboundedReceiver<AudioCommand>,
    events: broadcast::Sender<AudioChatEvent>,
    status: watch::Sender<AudioChatStatus>,
}

impl AudioChatOrchestrator {
    /// Build the orchestrator and its handle. Call [`run`](Self::run) (or use
    /// [`spawn`](Self::spawn)) to start processing.
    pub fn new(
        config: &ConciergeConfig,
        transport: Arc<dyn Transport>,
        session: Arc<dyn SessionIdentity>,
        mic: Arc<dyn Microphone>,
        player: Arc<dyn ResponsePlayer>,
    ) -> (Self, AudioChatHandle) {
        let channel = DuplexChannel::new(
            transport,
            session,
            ChannelOptions {
                base_url: config.channel.base_url.clone(),
                path: config.channel.audio_path.clone(),
                keepalive_interval: config.channel.keepalive_interval(),
                // Reconnecting the voice channel is left to the user.
                reconnect: None,
            },
        );
        let (capture, capture_signals) = AudioCaptureController::new(
            mic,
            config.vad.clone(),
            config.audio.encoding_preference.clone(),
        );
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (status, status_rx) = watch::channel(AudioChatStatus {
            connection: ConnectionState::Disconnected,
            is_recording: false,
            is_processing: false,
            is_playing: false,
            auto_listen: config.playback.auto_listen,
        });
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();

        let handle = AudioChatHandle {
            commands: commands_tx,
            events: events.clone(),
            status: status_rx,
        };
        let orchestrator = Self {
            channel,
            capture,
            capture_signals,
            assembler: ResponseAudioAssembler::new(),
            player,
            playback: None,
            playback_turn: 0,
            playback_tx,
            playback_rx,
            settle_delay: Duration::from_millis(config.playback.settle_delay_ms),
            rearm_at: None,
            commands,
            events,
            status,
        };
        (orchestrator, handle)
    }

    /// Build and spawn onto the current tokio runtime.
    pub fn spawn(
        config: &ConciergeConfig,
        transport: Arc<dyn Transport>,
        session: Arc<dyn SessionIdentity>,
        mic: Arc<dyn Microphone>,
        player: Arc<dyn ResponsePlayer>,
    ) -> AudioChatHandle {
        let (orchestrator, handle) = Self::new(config, transport, session, mic, player);
        tokio::spawn(orchestrator.run());
        handle
    }

    /// Process commands and channel traffic until shut down.
    pub async fn run(mut self) {
        loop {
            let rearm_at = self.rearm_at;
            let rearm = async move {
                match rearm_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(AudioCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = self.channel.next_event() => self.handle_channel_event(event),
                Some(signal) = self.capture_signals.recv() => self.handle_capture_signal(signal),
                Some(done) = self.playback_rx.recv() => self.handle_playback_done(done),
                _ = rearm => {
                    self.rearm_at = None;
                    self.auto_listen();
                }
            }
        }

        self.teardown().await;
        info!("audio chat stopped");
    }

    async fn handle_command(&mut self, command: AudioCommand) {
        match command {
            AudioCommand::Connect => {
                if let Err(e) = self.channel.connect() {
                    self.notify_error(&e);
                }
                self.sync_connection();
            }
            AudioCommand::Disconnect => {
                self.teardown().await;
                self.emit(AudioChatEvent::Disconnected {
                    reason: "disconnected".to_owned(),
                });
            }
            AudioCommand::StartRecording => self.start_recording(),
            AudioCommand::StopRecording => self.stop_recording(None),
            AudioCommand::SetAutoListen(enabled) => {
                if !enabled {
                    self.rearm_at = None;
                }
                self.update_status(|s| s.auto_listen = enabled);
            }
            AudioCommand::Shutdown => {}
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent<AudioInbound>) {
        match event {
            ChannelEvent::Opened => {}
            ChannelEvent::Message(message) => self.handle_message(message),
            ChannelEvent::Closed { reason } => {
                self.capture.abort();
                self.rearm_at = None;
                self.assembler.clear();
                self.update_status(|s| {
                    s.is_recording = false;
                    s.is_processing = false;
                });
                self.emit(AudioChatEvent::Error {
                    kind: ErrorKind::Transport,
                    message: reason.clone(),
                });
                self.emit(AudioChatEvent::Disconnected { reason });
            }
            ChannelEvent::ReconnectScheduled { .. } | ChannelEvent::GaveUp => {}
        }
        self.sync_connection();
    }

    fn handle_message(&mut self, message: AudioInbound) {
        match message {
            AudioInbound::Connected { session_id } => {
                info!("audio channel ready");
                self.emit(AudioChatEvent::Connected { session_id });
            }
            AudioInbound::Transcription { text } => {
                self.update_status(|s| s.is_processing = false);
                self.emit(AudioChatEvent::Transcription(text));
            }
            AudioInbound::ResponseText { text } => {
                self.emit(AudioChatEvent::ResponseText(text));
            }
            AudioInbound::AudioStart => self.assembler.begin(),
            AudioInbound::AudioChunk { audio } => {
                if let Err(e) = self.assembler.push_base64(&audio) {
                    warn!("dropping response fragment: {e}");
                }
            }
            AudioInbound::AudioComplete => match self.assembler.complete() {
                Some(audio) => self.start_playback(audio),
                None => debug!("audio_complete without fragments"),
            },
            AudioInbound::TripPlan { data } => self.emit(AudioChatEvent::TripPlan(data)),
            AudioInbound::Error { message } => {
                warn!("peer error: {message}");
                if self.capture.is_active() {
                    self.capture.abort();
                }
                self.update_status(|s| {
                    s.is_recording = false;
                    s.is_processing = false;
                });
                self.emit(AudioChatEvent::Error {
                    kind: ErrorKind::Protocol,
                    message,
                });
            }
            AudioInbound::Pong | AudioInbound::Unknown => {}
        }
    }

    fn handle_capture_signal(&mut self, signal: CaptureSignal) {
        let current = self.capture.is_active().then(|| self.capture.epoch());
        match signal {
            CaptureSignal::SpeechStarted { epoch } if current == Some(epoch) => {
                self.emit(AudioChatEvent::SpeechDetected);
            }
            CaptureSignal::VadStop { epoch, reason } if current == Some(epoch) => {
                self.stop_recording(Some(reason));
            }
            stale => debug!("ignoring stale capture signal: {stale:?}"),
        }
    }

    fn start_recording(&mut self) {
        if self.capture.is_active() {
            debug!("start_recording ignored: already recording");
            return;
        }
        if self.channel.state() != ConnectionState::Connected {
            self.notify_error(&ConciergeError::NotConnected);
            return;
        }
        // A new turn abandons one the peer never answered.
        let abandoned = self.status.borrow().is_processing;

        self.rearm_at = None;
        // Barge-in: talking over the response cuts it off.
        self.stop_playback();

        let epoch = match self.capture.start() {
            Ok(epoch) => epoch,
            Err(e) => {
                self.notify_error(&e);
                return;
            }
        };
        if let Err(e) = self.channel.send(AudioOutbound::AudioStart) {
            self.capture.abort();
            self.notify_error(&e);
            return;
        }

        if abandoned {
            info!("abandoning unanswered utterance for capture {epoch}");
        }
        self.update_status(|s| {
            s.is_recording = true;
            s.is_processing = false;
        });
        self.emit(AudioChatEvent::RecordingStarted { epoch });
    }

    fn stop_recording(&mut self, reason: Option<StopReason>) {
        if !self.capture.is_active() {
            return;
        }

        let sent = self.capture.stop().and_then(|utterance| {
            let audio = base64::engine::general_purpose::STANDARD.encode(&utterance.audio);
            self.channel.send(AudioOutbound::AudioEnd {
                audio,
                mime_type: utterance.encoding.mime_type().to_owned(),
            })
        });

        match sent {
            Ok(()) => {
                self.update_status(|s| {
                    s.is_recording = false;
                    s.is_processing = true;
                });
                self.emit(AudioChatEvent::RecordingStopped { reason });
            }
            Err(e) => {
                self.update_status(|s| {
                    s.is_recording = false;
                    s.is_processing = false;
                });
                self.emit(AudioChatEvent::RecordingStopped { reason });
                self.notify_error(&e);
            }
        }
    }

    fn start_playback(&mut self, audio: Bytes) {
        self.stop_playback();
        self.playback_turn += 1;
        let turn = self.playback_turn;
        let cancel = CancellationToken::new();

        let player = Arc::clone(&self.player);
        let done_tx = self.playback_tx.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let result = player.play(audio, token).await;
            let _ = done_tx.send(PlaybackDone { turn, result });
        });

        self.playback = Some(ActivePlayback { turn, cancel });
        self.update_status(|s| s.is_playing = true);
        self.emit(AudioChatEvent::PlaybackStarted);
    }

    fn stop_playback(&mut self) {
        if let Some(playback) = self.playback.take() {
            playback.cancel.cancel();
            self.update_status(|s| s.is_playing = false);
            self.emit(AudioChatEvent::PlaybackFinished);
        }
    }

    fn handle_playback_done(&mut self, done: PlaybackDone) {
        if self.playback.as_ref().map(|p| p.turn) != Some(done.turn) {
            return;
        }
        self.playback = None;
        if let Err(e) = done.result {
            // A broken response still ends the turn.
            warn!("playback failed: {e}");
        }
        self.update_status(|s| s.is_playing = false);
        self.emit(AudioChatEvent::PlaybackFinished);

        if self.status.borrow().auto_listen {
            self.rearm_at = Some(Instant::now() + self.settle_delay);
        }
    }

    fn auto_listen(&mut self) {
        let status = *self.status.borrow();
        if !status.auto_listen
            || status.is_processing
            || status.is_playing
            || self.capture.is_active()
            || self.channel.state() != ConnectionState::Connected
        {
            debug!("auto-listen skipped");
            return;
        }
        info!("auto-listen: re-arming capture");
        self.start_recording();
    }

    async fn teardown(&mut self) {
        self.capture.abort();
        self.stop_playback();
        self.rearm_at = None;
        self.assembler.clear();
        self.channel.disconnect().await;
        self.update_status(|s| {
            s.is_recording = false;
            s.is_processing = false;
        });
        self.sync_connection();
    }

    fn sync_connection(&self) {
        let connection = self.channel.state();
        self.update_status(|s| s.connection = connection);
    }

    fn update_status(&self, apply: impl FnOnce(&mut AudioChatStatus)) {
        self.status.send_if_modified(|status| {
            let before = *status;
            apply(status);
            before != *status
        });
    }

    fn notify_error(&self, err: &ConciergeError) {
        warn!("audio chat: {err}");
        self.emit(AudioChatEvent::Error {
            kind: ErrorKind::of(err),
            message: err.to_string(),
        });
    }

    fn emit(&self, event: AudioChatEvent) {
        let _ = self.events.send(event);
    }
}
