//! Persistent duplex channel shared by the voice and text paths.
//!
//! A [`DuplexChannel`] owns one driver task per `connect()`. The driver opens
//! the transport, sends the protocol's `init` envelope, pumps outbound
//! envelopes, decodes inbound frames, sends keep-alive pings and, when the
//! channel was built with a reconnect policy, reopens the transport after
//! unexpected closes.
//!
//! Driver output is tagged with a generation number. `disconnect()` bumps
//! the generation so anything a previous driver emits afterwards is dropped.

pub mod backoff;
pub mod protocol;
pub mod transport;

use crate::config::ReconnectConfig;
use crate::error::{ConciergeError, Result};
use crate::session::SessionIdentity;
use backoff::ReconnectPolicy;
use futures_util::{SinkExt, StreamExt};
use protocol::{Protocol, decode_inbound};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transport::{Transport, TransportLink};
use url::Url;

/// How long `disconnect()` waits for the driver to close the transport.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection lifecycle of one channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Notifications from the channel driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent<In> {
    /// Transport opened and `init` was sent.
    Opened,
    /// Decoded inbound envelope (pongs are consumed by the driver).
    Message(In),
    /// Transport failed to open or dropped without `disconnect()`.
    Closed { reason: String },
    /// A reconnect attempt will start after `delay`.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Reconnect attempts are exhausted; the channel stays disconnected.
    GaveUp,
}

/// Static settings of one channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub base_url: String,
    /// Endpoint path appended to the base URL.
    pub path: String,
    pub keepalive_interval: Duration,
    /// `None` disables automatic reconnection.
    pub reconnect: Option<ReconnectConfig>,
}

type Tagged<In> = (u64, ChannelEvent<In>);

/// State shared between the handle and its driver.
struct Shared {
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
}

impl Shared {
    /// Update the state only if `generation` is still current.
    fn set_state(&self, generation: u64, state: ConnectionState) {
        if self.generation.load(Ordering::Acquire) == generation {
            self.state.send_replace(state);
        }
    }
}

/// Handle to a persistent duplex channel speaking protocol `P`.
pub struct DuplexChannel<P: Protocol> {
    transport: Arc<dyn Transport>,
    session: Arc<dyn SessionIdentity>,
    options: ChannelOptions,
    shared: Arc<Shared>,
    outbound: Option<mpsc::UnboundedSender<P::Outbound>>,
    events_tx: mpsc::UnboundedSender<Tagged<P::Inbound>>,
    events_rx: mpsc::UnboundedReceiver<Tagged<P::Inbound>>,
    cancel: Option<CancellationToken>,
    driver: Option<JoinHandle<()>>,
}

impl<P: Protocol> DuplexChannel<P> {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<dyn SessionIdentity>,
        options: ChannelOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            session,
            options,
            shared: Arc::new(Shared {
                state,
                generation: AtomicU64::new(0),
            }),
            outbound: None,
            events_tx,
            events_rx,
            cancel: None,
            driver: None,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Open the channel. No-op while connecting or connected; from
    /// `Disconnected` any pending reconnect is abandoned and a fresh
    /// attempt starts immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ConciergeError::Config`] if the endpoint URL is invalid.
    pub fn connect(&mut self) -> Result<()> {
        if self.state() != ConnectionState::Disconnected {
            debug!("{} channel: connect ignored, already active", P::NAME);
            return Ok(());
        }
        if let Some(cancel) = self.cancel.take() {
            debug!("{} channel: dropping pending reconnect", P::NAME);
            cancel.cancel();
        }
        self.outbound = None;
        self.driver = None;

        let session_id = self.session.session_id();
        let url = transport::endpoint_url(&self.options.base_url, &self.options.path, &session_id)?;
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.set_state(generation, ConnectionState::Connecting);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let policy = match self.options.reconnect {
            Some(ref config) => ReconnectPolicy::new(config),
            None => ReconnectPolicy::disabled(),
        };

        let driver = Driver::<P> {
            transport: Arc::clone(&self.transport),
            url,
            session_id,
            token: self.session.bearer_token(),
            keepalive: self.options.keepalive_interval,
            shared: Arc::clone(&self.shared),
            generation,
            events: self.events_tx.clone(),
            outbound: outbound_rx,
            cancel: cancel.clone(),
            policy,
        };

        self.outbound = Some(outbound_tx);
        self.cancel = Some(cancel);
        self.driver = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    /// Queue an envelope for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ConciergeError::NotConnected`] unless the channel is connected.
    pub fn send(&self, message: P::Outbound) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ConciergeError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(ConciergeError::NotConnected)?;
        outbound
            .send(message)
            .map_err(|_| ConciergeError::NotConnected)
    }

    /// Close deliberately. Suppresses reconnection and discards anything the
    /// old driver still has in flight.
    pub async fn disconnect(&mut self) {
        let Some(cancel) = self.cancel.take() else {
            return;
        };
        let generation = self.shared.generation.load(Ordering::Acquire);
        self.shared.set_state(generation, ConnectionState::Closing);
        cancel.cancel();
        self.outbound = None;

        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut driver).await.is_err() {
                warn!("{} channel: driver did not close in time, aborting", P::NAME);
                driver.abort();
            }
        }

        let stale = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.set_state(stale, ConnectionState::Disconnected);
        info!("{} channel disconnected", P::NAME);
    }

    /// Next event from the current driver. Cancel-safe.
    pub async fn next_event(&mut self) -> ChannelEvent<P::Inbound> {
        loop {
            let Some((generation, event)) = self.events_rx.recv().await else {
                // The handle owns a sender, so the queue never closes.
                return std::future::pending().await;
            };
            if generation == self.shared.generation.load(Ordering::Acquire) {
                return event;
            }
            debug!("{} channel: dropping stale event", P::NAME);
        }
    }
}

impl<P: Protocol> Drop for DuplexChannel<P> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

/// How a single connection ended.
enum LinkEnd {
    Cancelled,
    Dropped(String),
}

struct Driver<P: Protocol> {
    transport: Arc<dyn Transport>,
    url: Url,
    session_id: String,
    token: Option<String>,
    keepalive: Duration,
    shared: Arc<Shared>,
    generation: u64,
    events: mpsc::UnboundedSender<Tagged<P::Inbound>>,
    outbound: mpsc::UnboundedReceiver<P::Outbound>,
    cancel: CancellationToken,
    policy: ReconnectPolicy,
}

impl<P: Protocol> Driver<P> {
    fn emit(&self, event: ChannelEvent<P::Inbound>) {
        let _ = self.events.send((self.generation, event));
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.set_state(self.generation, state);
    }

    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = self.transport.connect(&self.url) => Some(result),
            };

            let end = match connected {
                None => LinkEnd::Cancelled,
                Some(Ok(link)) => self.run_link(link).await,
                Some(Err(e)) => LinkEnd::Dropped(e.to_string()),
            };

            let reason = match end {
                LinkEnd::Cancelled => {
                    self.policy.suppress();
                    return;
                }
                LinkEnd::Dropped(reason) => reason,
            };

            self.set_state(ConnectionState::Disconnected);
            let dropped = self.drain_outbound();
            if dropped > 0 {
                warn!("{} channel: discarded {dropped} unsent envelopes", P::NAME);
            }
            warn!("{} channel closed: {reason}", P::NAME);
            self.emit(ChannelEvent::Closed { reason });

            let Some(delay) = self.policy.next_delay() else {
                if self.policy.is_enabled() {
                    warn!("{} channel: reconnect attempts exhausted", P::NAME);
                    self.emit(ChannelEvent::GaveUp);
                }
                return;
            };

            let attempt = self.policy.attempt();
            info!(
                "{} channel: reconnecting in {}ms (attempt {attempt})",
                P::NAME,
                delay.as_millis()
            );
            self.emit(ChannelEvent::ReconnectScheduled { attempt, delay });
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_link(&mut self, link: TransportLink) -> LinkEnd {
        let TransportLink {
            mut sink,
            mut stream,
        } = link;

        self.set_state(ConnectionState::Connected);
        self.emit(ChannelEvent::Opened);

        let init = P::init(self.session_id.clone(), self.token.clone());
        if let Err(e) = send_envelope::<P>(&mut sink, &init).await {
            return LinkEnd::Dropped(format!("init failed: {e}"));
        }

        let start = tokio::time::Instant::now() + self.keepalive;
        let mut keepalive = tokio::time::interval_at(start, self.keepalive);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    return LinkEnd::Cancelled;
                }
                message = self.outbound.recv() => {
                    let Some(message) = message else {
                        let _ = sink.close().await;
                        return LinkEnd::Cancelled;
                    };
                    if let Err(e) = send_envelope::<P>(&mut sink, &message).await {
                        return LinkEnd::Dropped(format!("send failed: {e}"));
                    }
                }
                _ = keepalive.tick() => {
                    debug!("{} channel: ping", P::NAME);
                    if let Err(e) = send_envelope::<P>(&mut sink, &P::ping()).await {
                        return LinkEnd::Dropped(format!("keep-alive failed: {e}"));
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(raw)) => {
                        let Some(message) = decode_inbound::<P>(&raw) else {
                            continue;
                        };
                        if P::is_connected(&message) {
                            self.policy.reset();
                        }
                        if P::is_pong(&message) {
                            debug!("{} channel: pong", P::NAME);
                            continue;
                        }
                        self.emit(ChannelEvent::Message(message));
                    }
                    Some(Err(e)) => return LinkEnd::Dropped(e.to_string()),
                    None => return LinkEnd::Dropped("closed by peer".to_owned()),
                },
            }
        }
    }

    fn drain_outbound(&mut self) -> usize {
        let mut dropped = 0;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

async fn send_envelope<P: Protocol>(
    sink: &mut transport::FrameSink,
    message: &P::Outbound,
) -> Result<()> {
    let text = serde_json::to_string(message).map_err(|e| ConciergeError::Codec(e.to_string()))?;
    sink.send(text).await
}
