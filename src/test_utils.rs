//! In-memory doubles for the transport, microphone and speaker seams.
//!
//! Shared by the channel, capture and orchestrator test modules so every
//! layer is exercised against the same fakes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::audio::capture::{Microphone, OpenedCapture, Recorder};
use crate::audio::playback::ResponsePlayer;
use crate::channel::transport::{Transport, TransportLink};
use crate::config::AudioEncoding;
use crate::error::{ConciergeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use url::Url;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// How the next `connect` call behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Open a link and hand the far end to the test as a [`MockPeer`].
    Accept,
    /// Fail to connect.
    Refuse,
    /// Open a link that ends immediately, optionally after a `connected`
    /// envelope. Writes are accepted and discarded.
    Flap { connected: bool },
}

struct TransportState {
    queued: Mutex<VecDeque<MockBehavior>>,
    default: Mutex<MockBehavior>,
    connects: AtomicUsize,
    peers: mpsc::UnboundedSender<MockPeer>,
}

/// Transport whose connections are driven by the test.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<TransportState>,
}

impl MockTransport {
    /// New transport accepting every connection; accepted peers arrive on
    /// the returned receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: Arc::new(TransportState {
                queued: Mutex::new(VecDeque::new()),
                default: Mutex::new(MockBehavior::Accept),
                connects: AtomicUsize::new(0),
                peers,
            }),
        };
        (transport, rx)
    }

    /// Behavior once the queued behaviors are used up.
    pub fn set_default_behavior(&self, behavior: MockBehavior) {
        *self.state.default.lock().unwrap() = behavior;
    }

    /// Queue a behavior for the next unconsumed `connect`.
    pub fn push_behavior(&self, behavior: MockBehavior) {
        self.state.queued.lock().unwrap().push_back(behavior);
    }

    /// Number of `connect` calls so far.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> MockBehavior {
        let queued = self.state.queued.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| *self.state.default.lock().unwrap())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &Url) -> Result<TransportLink> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        match self.next_behavior() {
            MockBehavior::Refuse => Err(ConciergeError::Transport("connection refused".into())),
            MockBehavior::Flap { connected } => {
                let frames = if connected {
                    vec![Ok(r#"{"type":"connected"}"#.to_owned())]
                } else {
                    Vec::new()
                };
                Ok(TransportLink {
                    sink: Box::pin(futures_util::sink::unfold((), |(), _text: String| async {
                        Ok::<_, ConciergeError>(())
                    })),
                    stream: Box::pin(futures_util::stream::iter(frames)),
                })
            }
            MockBehavior::Accept => {
                let (to_peer, from_client) = mpsc::unbounded_channel::<String>();
                let (to_client, from_peer) = mpsc::unbounded_channel::<String>();

                let sink = futures_util::sink::unfold(to_peer, |tx, text: String| async move {
                    tx.send(text)
                        .map_err(|_| ConciergeError::Transport("peer went away".into()))?;
                    Ok::<_, ConciergeError>(tx)
                });
                let stream = UnboundedReceiverStream::new(from_peer).map(Ok);

                let peer = MockPeer {
                    url: url.to_string(),
                    inbound: from_client,
                    outbound: to_client,
                };
                self.state
                    .peers
                    .send(peer)
                    .map_err(|_| ConciergeError::Transport("test dropped peer receiver".into()))?;

                Ok(TransportLink {
                    sink: Box::pin(sink),
                    stream: Box::pin(stream),
                })
            }
        }
    }
}

/// Far end of an accepted mock connection. Dropping it closes the link.
pub struct MockPeer {
    url: String,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

impl MockPeer {
    /// URL the client connected to.
    pub fn url(&self) -> String {
        self.url.clone()
    }

    /// Next envelope the client sent, parsed.
    pub async fn recv_json(&mut self) -> serde_json::Value {
        let text = self.inbound.recv().await.expect("client closed the link");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Deliver an envelope to the client.
    pub fn send_json(&self, value: serde_json::Value) {
        let _ = self.outbound.send(value.to_string());
    }
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

struct MicState {
    supported: Vec<AudioEncoding>,
    denied: bool,
    fail_finalize: bool,
    payload: Vec<u8>,
}

/// Scriptable microphone. The analysis tap reports whatever level was last
/// set with [`set_energy`](Self::set_energy).
#[derive(Clone)]
pub struct MockMicrophone {
    state: Arc<Mutex<MicState>>,
    energy: Arc<watch::Sender<f32>>,
    active: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
}

impl MockMicrophone {
    pub fn new() -> Self {
        let (energy, _) = watch::channel(0.0);
        Self {
            state: Arc::new(Mutex::new(MicState {
                supported: vec![AudioEncoding::WavPcm16, AudioEncoding::WavFloat32],
                denied: false,
                fail_finalize: false,
                payload: b"RIFF".to_vec(),
            })),
            energy: Arc::new(energy),
            active: Arc::new(AtomicUsize::new(0)),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_supported(&self, encodings: Vec<AudioEncoding>) {
        self.state.lock().unwrap().supported = encodings;
    }

    pub fn deny_access(&self, denied: bool) {
        self.state.lock().unwrap().denied = denied;
    }

    pub fn fail_finalize(&self, fail: bool) {
        self.state.lock().unwrap().fail_finalize = fail;
    }

    /// Bytes every recorder returns from `finalize`.
    pub fn set_payload(&self, payload: Vec<u8>) {
        self.state.lock().unwrap().payload = payload;
    }

    /// Input level seen by the analysis tap from now on.
    pub fn set_energy(&self, level: f32) {
        self.energy.send_replace(level);
    }

    /// Acquired, not yet released devices.
    pub fn active_tracks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Microphone for MockMicrophone {
    fn supports(&self, encoding: AudioEncoding) -> bool {
        self.state.lock().unwrap().supported.contains(&encoding)
    }

    fn open(&self, encoding: AudioEncoding) -> Result<OpenedCapture> {
        let state = self.state.lock().unwrap();
        if state.denied {
            return Err(ConciergeError::Permission("access denied".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(OpenedCapture {
            analysis: self.energy.subscribe(),
            recorder: Box::new(MockRecorder {
                encoding,
                payload: state.payload.clone(),
                fail: state.fail_finalize,
                released: false,
                active: Arc::clone(&self.active),
            }),
        })
    }
}

struct MockRecorder {
    encoding: AudioEncoding,
    payload: Vec<u8>,
    fail: bool,
    released: bool,
    active: Arc<AtomicUsize>,
}

impl Recorder for MockRecorder {
    fn encoding(&self) -> AudioEncoding {
        self.encoding
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        if self.fail {
            return Err(ConciergeError::Codec("encoder failed".into()));
        }
        Ok(self.payload.clone())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// Speaker
// ---------------------------------------------------------------------------

/// Player that records what it was given and "plays" for a fixed time.
#[derive(Clone)]
pub struct MockPlayer {
    played: Arc<Mutex<Vec<Bytes>>>,
    duration: Arc<Mutex<Duration>>,
    fail: Arc<AtomicBool>,
}

impl MockPlayer {
    pub fn new() -> Self {
        Self {
            played: Arc::new(Mutex::new(Vec::new())),
            duration: Arc::new(Mutex::new(Duration::from_millis(100))),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_duration(&self, duration: Duration) {
        *self.duration.lock().unwrap() = duration;
    }

    /// Make every subsequent `play` fail as undecodable.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Payloads handed to `play`, in order.
    pub fn played(&self) -> Vec<Bytes> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponsePlayer for MockPlayer {
    async fn play(&self, audio: Bytes, cancel: CancellationToken) -> Result<()> {
        self.played.lock().unwrap().push(audio);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConciergeError::Playback("undecodable response".into()));
        }
        let duration = *self.duration.lock().unwrap();
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
        Ok(())
    }
}
