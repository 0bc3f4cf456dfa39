//! Typed conversation over the text channel.
//!
//! Streamed `chunk` envelopes accumulate into a partial reply that is
//! replaced by the final `response`. The text channel reconnects on its own
//! with capped exponential backoff.

use crate::channel::protocol::{TextInbound, TextOutbound, TextProtocol};
use crate::channel::transport::Transport;
use crate::channel::{ChannelEvent, ChannelOptions, ConnectionState, DuplexChannel};
use crate::config::ConciergeConfig;
use crate::error::{ConciergeError, Result};
use crate::pipeline::EVENT_CHANNEL_SIZE;
use crate::session::SessionIdentity;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{info, warn};

/// Snapshot of the text conversation for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChatStatus {
    pub connection: ConnectionState,
    pub is_typing: bool,
    /// Reply text streamed so far for the current turn.
    pub partial: String,
    /// Reconnect attempts were exhausted; only an explicit connect recovers.
    pub gave_up: bool,
}

/// Notifications from the text conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum TextChatEvent {
    Connected { session_id: Option<String> },
    Typing(bool),
    /// One streamed fragment; `partial` is the accumulated reply.
    Chunk { content: String, partial: String },
    /// Final reply for the turn.
    Response(String),
    TripPlan(serde_json::Value),
    Suggestion(serde_json::Value),
    Error(String),
    Reconnecting { attempt: u32, delay: Duration },
    /// Deliberate disconnect or exhausted retries. Drops that are retried
    /// only show up as [`Reconnecting`](Self::Reconnecting).
    Disconnected { reason: String },
    GaveUp,
}

enum TextCommand {
    Connect,
    Disconnect,
    Send {
        content: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Command surface of a running [`TextChatOrchestrator`].
#[derive(Clone)]
pub struct TextChatHandle {
    commands: mpsc::UnboundedSender<TextCommand>,
    events: broadcast::Sender<TextChatEvent>,
    status: watch::Receiver<TextChatStatus>,
}

impl TextChatHandle {
    fn command(&self, command: TextCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ConciergeError::Channel("text chat stopped".into()))
    }

    /// Open the text channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the orchestrator task has stopped.
    pub fn connect(&self) -> Result<()> {
        self.command(TextCommand::Connect)
    }

    /// Close the text channel without reconnecting.
    ///
    /// # Errors
    ///
    /// Returns an error if the orchestrator task has stopped.
    pub fn disconnect(&self) -> Result<()> {
        self.command(TextCommand::Disconnect)
    }

    /// Send a user message.
    ///
    /// # Errors
    ///
    /// Returns [`ConciergeError::InvalidInput`] for blank text and
    /// [`ConciergeError::NotConnected`] unless the channel is connected.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<()> {
        let content = text.into();
        if content.trim().is_empty() {
            return Err(ConciergeError::InvalidInput("message is empty".into()));
        }
        let (reply, rx) = oneshot::channel();
        self.command(TextCommand::Send { content, reply })?;
        rx.await
            .map_err(|_| ConciergeError::Channel("text chat stopped".into()))?
    }

    /// Disconnect and stop the orchestrator task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(TextCommand::Shutdown);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TextChatEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> TextChatStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<TextChatStatus> {
        self.status.clone()
    }
}

/// Actor owning the text channel and the streamed reply state.
pub struct TextChatOrchestrator {
    channel: DuplexChannel<TextProtocol>,
    reconnects: bool,
    last_close: Option<String>,
    commands: mpsc::UnboundedReceiver<TextCommand>,
    events: broadcast::Sender<TextChatEvent>,
    status: watch::Sender<TextChatStatus>,
}

impl TextChatOrchestrator {
    pub fn new(
        config: &ConciergeConfig,
        transport: Arc<dyn Transport>,
        session: Arc<dyn SessionIdentity>,
    ) -> (Self, TextChatHandle) {
        let channel = DuplexChannel::new(
            transport,
            session,
            ChannelOptions {
                base_url: config.channel.base_url.clone(),
                path: config.channel.text_path.clone(),
                keepalive_interval: config.channel.keepalive_interval(),
                reconnect: Some(config.channel.reconnect),
            },
        );
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (status, status_rx) = watch::channel(TextChatStatus {
            connection: ConnectionState::Disconnected,
            is_typing: false,
            partial: String::new(),
            gave_up: false,
        });

        let handle = TextChatHandle {
            commands: commands_tx,
            events: events.clone(),
            status: status_rx,
        };
        (
            Self {
                channel,
                reconnects: config.channel.reconnect.max_attempts > 0,
                last_close: None,
                commands,
                events,
                status,
            },
            handle,
        )
    }

    pub fn spawn(
        config: &ConciergeConfig,
        transport: Arc<dyn Transport>,
        session: Arc<dyn SessionIdentity>,
    ) -> TextChatHandle {
        let (orchestrator, handle) = Self::new(config, transport, session);
        tokio::spawn(orchestrator.run());
        handle
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(TextCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = self.channel.next_event() => self.handle_channel_event(event),
            }
        }
        self.channel.disconnect().await;
        info!("text chat stopped");
    }

    async fn handle_command(&mut self, command: TextCommand) {
        match command {
            TextCommand::Connect => {
                self.update_status(|s| s.gave_up = false);
                if let Err(e) = self.channel.connect() {
                    warn!("text chat: {e}");
                    self.emit(TextChatEvent::Error(e.to_string()));
                }
            }
            TextCommand::Disconnect => {
                self.channel.disconnect().await;
                self.last_close = None;
                self.clear_turn();
                self.sync_connection();
                self.emit(TextChatEvent::Disconnected {
                    reason: "disconnected".to_owned(),
                });
            }
            TextCommand::Send { content, reply } => {
                let result = self.channel.send(TextOutbound::Message { content });
                let _ = reply.send(result);
            }
            TextCommand::Shutdown => {}
        }
        self.sync_connection();
    }

    fn handle_channel_event(&mut self, event: ChannelEvent<TextInbound>) {
        match event {
            ChannelEvent::Opened => {}
            ChannelEvent::Message(message) => self.handle_message(message),
            ChannelEvent::Closed { reason } if self.reconnects => {
                // Retried quietly; surfaced only if the retries run out.
                info!("text channel dropped, will retry: {reason}");
                self.last_close = Some(reason);
            }
            ChannelEvent::Closed { reason } => {
                self.clear_turn();
                self.sync_connection();
                self.emit(TextChatEvent::Disconnected { reason });
            }
            ChannelEvent::ReconnectScheduled { attempt, delay } => {
                self.emit(TextChatEvent::Reconnecting { attempt, delay });
            }
            ChannelEvent::GaveUp => {
                self.clear_turn();
                self.update_status(|s| s.gave_up = true);
                self.sync_connection();
                let reason = self
                    .last_close
                    .take()
                    .unwrap_or_else(|| "reconnect attempts exhausted".to_owned());
                self.emit(TextChatEvent::Disconnected { reason });
                self.emit(TextChatEvent::GaveUp);
            }
        }
        self.sync_connection();
    }

    fn handle_message(&mut self, message: TextInbound) {
        match message {
            TextInbound::Connected { session_id } => {
                info!("text channel ready");
                self.last_close = None;
                self.emit(TextChatEvent::Connected { session_id });
            }
            TextInbound::Typing { status } => {
                self.update_status(|s| s.is_typing = status);
                self.emit(TextChatEvent::Typing(status));
            }
            TextInbound::Chunk { content } => {
                let mut partial = String::new();
                self.update_status(|s| {
                    s.partial.push_str(&content);
                    partial.clone_from(&s.partial);
                });
                self.emit(TextChatEvent::Chunk { content, partial });
            }
            TextInbound::Response { content } => {
                let mut streamed = String::new();
                self.update_status(|s| {
                    streamed = std::mem::take(&mut s.partial);
                    s.is_typing = false;
                });
                // Some replies only arrive as chunks.
                let text = if content.is_empty() { streamed } else { content };
                self.emit(TextChatEvent::Response(text));
            }
            TextInbound::TripPlan { data } => self.emit(TextChatEvent::TripPlan(data)),
            TextInbound::Suggestion { data } => self.emit(TextChatEvent::Suggestion(data)),
            TextInbound::Error { message } => {
                warn!("peer error: {message}");
                self.clear_turn();
                self.emit(TextChatEvent::Error(message));
            }
            TextInbound::Pong | TextInbound::Unknown => {}
        }
    }

    fn clear_turn(&self) {
        self.update_status(|s| {
            s.is_typing = false;
            s.partial.clear();
        });
    }

    fn sync_connection(&self) {
        let connection = self.channel.state();
        self.update_status(|s| s.connection = connection);
    }

    fn update_status(&self, apply: impl FnOnce(&mut TextChatStatus)) {
        self.status.send_if_modified(|status| {
            let before = status.clone();
            apply(status);
            before != *status
        });
    }

    fn emit(&self, event: TextChatEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::session::StaticSession;
    use crate::test_utils::{MockBehavior, MockPeer, MockTransport};
    use serde_json::json;

    async fn next_event(events: &mut broadcast::Receiver<TextChatEvent>) -> TextChatEvent {
        tokio::time::timeout(Duration::from_secs(120), events.recv())
            .await
            .expect("event timeout")
            .expect("event channel")
    }

    async fn connected() -> (TextChatHandle, broadcast::Receiver<TextChatEvent>, MockPeer) {
        let (transport, mut peers) = MockTransport::new();
        let handle = TextChatOrchestrator::spawn(
            &ConciergeConfig::default(),
            Arc::new(transport),
            Arc::new(StaticSession::new("text-session", None)),
        );
        let mut events = handle.subscribe();
        handle.connect().unwrap();
        let mut peer = peers.recv().await.unwrap();
        let _init = peer.recv_json().await;
        peer.send_json(json!({"type": "connected", "session_id": "text-session"}));
        assert_eq!(
            next_event(&mut events).await,
            TextChatEvent::Connected {
                session_id: Some("text-session".into())
            }
        );
        (handle, events, peer)
    }

    #[tokio::test]
    async fn message_reaches_peer() {
        let (handle, _events, mut peer) = connected().await;
        handle.send_message("Find me a hotel in Porto").await.unwrap();
        assert_eq!(
            peer.recv_json().await,
            json!({"type": "message", "content": "Find me a hotel in Porto"})
        );
    }

    #[tokio::test]
    async fn blank_message_is_rejected_locally() {
        let (handle, _events, _peer) = connected().await;
        assert!(matches!(
            handle.send_message("   ").await,
            Err(ConciergeError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let (transport, _peers) = MockTransport::new();
        let handle = TextChatOrchestrator::spawn(
            &ConciergeConfig::default(),
            Arc::new(transport),
            Arc::new(StaticSession::new("s", None)),
        );
        assert!(matches!(
            handle.send_message("hello").await,
            Err(ConciergeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn chunks_accumulate_until_response() {
        let (handle, mut events, peer) = connected().await;
        peer.send_json(json!({"type": "typing", "status": true}));
        peer.send_json(json!({"type": "chunk", "content": "Lisbon "}));
        peer.send_json(json!({"type": "chunk", "content": "in May"}));

        assert_eq!(next_event(&mut events).await, TextChatEvent::Typing(true));
        assert_eq!(
            next_event(&mut events).await,
            TextChatEvent::Chunk {
                content: "Lisbon ".into(),
                partial: "Lisbon ".into()
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            TextChatEvent::Chunk {
                content: "in May".into(),
                partial: "Lisbon in May".into()
            }
        );
        let status = handle.status();
        assert!(status.is_typing);
        assert_eq!(status.partial, "Lisbon in May");

        peer.send_json(json!({"type": "response", "content": "Lisbon in May is lovely."}));
        assert_eq!(
            next_event(&mut events).await,
            TextChatEvent::Response("Lisbon in May is lovely.".into())
        );
        let status = handle.status();
        assert!(!status.is_typing);
        assert!(status.partial.is_empty());
    }

    #[tokio::test]
    async fn empty_response_falls_back_to_streamed_text() {
        let (_handle, mut events, peer) = connected().await;
        peer.send_json(json!({"type": "chunk", "content": "Only chunks"}));
        peer.send_json(json!({"type": "response", "content": ""}));
        let _chunk = next_event(&mut events).await;
        assert_eq!(
            next_event(&mut events).await,
            TextChatEvent::Response("Only chunks".into())
        );
    }

    #[tokio::test]
    async fn peer_error_clears_partial_reply() {
        let (handle, mut events, peer) = connected().await;
        peer.send_json(json!({"type": "typing", "status": true}));
        peer.send_json(json!({"type": "chunk", "content": "half"}));
        peer.send_json(json!({"type": "error", "message": "model overloaded"}));

        loop {
            if next_event(&mut events).await == TextChatEvent::Error("model overloaded".into()) {
                break;
            }
        }
        let status = handle.status();
        assert!(!status.is_typing);
        assert!(status.partial.is_empty());
        assert_eq!(status.connection, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn structured_payloads_are_forwarded() {
        let (_handle, mut events, peer) = connected().await;
        peer.send_json(json!({"type": "trip_plan", "data": {"days": 3}}));
        peer.send_json(json!({"type": "suggestion", "data": ["Sintra"]}));
        assert_eq!(
            next_event(&mut events).await,
            TextChatEvent::TripPlan(json!({"days": 3}))
        );
        assert_eq!(
            next_event(&mut events).await,
            TextChatEvent::Suggestion(json!(["Sintra"]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_are_reported() {
        let (transport, _peers) = MockTransport::new();
        transport.set_default_behavior(MockBehavior::Refuse);
        let handle = TextChatOrchestrator::spawn(
            &ConciergeConfig::default(),
            Arc::new(transport.clone()),
            Arc::new(StaticSession::new("s", None)),
        );
        let mut events = handle.subscribe();
        handle.connect().unwrap();

        let mut attempts = Vec::new();
        let mut disconnects = Vec::new();
        loop {
            match next_event(&mut events).await {
                TextChatEvent::Reconnecting { attempt, .. } => attempts.push(attempt),
                TextChatEvent::Disconnected { reason } => disconnects.push(reason),
                TextChatEvent::GaveUp => break,
                _ => {}
            }
        }
        assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
        // Only the final failure is surfaced as a disconnect.
        assert_eq!(disconnects.len(), 1);
        assert!(disconnects[0].contains("connection refused"), "{disconnects:?}");
        assert_eq!(transport.connect_count(), 6);
        let status = handle.status();
        assert!(status.gave_up);
        assert_eq!(status.connection, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_drop_reconnects_without_disconnect_event() {
        let (transport, mut peers) = MockTransport::new();
        transport.push_behavior(MockBehavior::Flap { connected: true });
        let handle = TextChatOrchestrator::spawn(
            &ConciergeConfig::default(),
            Arc::new(transport.clone()),
            Arc::new(StaticSession::new("text-session", None)),
        );
        let mut events = handle.subscribe();
        handle.connect().unwrap();

        let mut peer = peers.recv().await.unwrap();
        let _init = peer.recv_json().await;
        peer.send_json(json!({"type": "connected", "session_id": "text-session"}));

        let mut seen = Vec::new();
        loop {
            let event = next_event(&mut events).await;
            let done = event
                == TextChatEvent::Connected {
                    session_id: Some("text-session".into()),
                };
            seen.push(event);
            if done {
                break;
            }
        }
        assert!(
            !seen
                .iter()
                .any(|e| matches!(e, TextChatEvent::Disconnected { .. } | TextChatEvent::GaveUp)),
            "{seen:?}"
        );
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, TextChatEvent::Reconnecting { attempt: 1, .. }))
                .count(),
            1
        );
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(handle.status().connection, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_clears_turn_state() {
        let (handle, mut events, peer) = connected().await;
        peer.send_json(json!({"type": "typing", "status": true}));
        assert_eq!(next_event(&mut events).await, TextChatEvent::Typing(true));

        handle.disconnect().unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            TextChatEvent::Disconnected { .. }
        ));
        let status = handle.status();
        assert!(!status.is_typing);
        assert_eq!(status.connection, ConnectionState::Disconnected);
    }
}
