//! Streaming protocol client.
//!
//! One [`LiveClient`] owns one connection at a time. Outbound messages go through a writer task
//! in call order; inbound messages are handled by a reader task strictly in arrival order. Audio
//! is handed to an [`AudioSink`], everything else surfaces as [`ClientEvent`]s.

pub mod events;
pub mod session;

use crate::capture::{CaptureEvent, CapturePipeline};
use crate::config::Endpoint;
use crate::error::{LiveError, Result};
use crate::playback::AudioSink;
use crate::protocol::{
    self, ClientContent, Content, FunctionResponse, InboundMessage, MediaChunk, OutboundMessage,
    Part, RealtimeInput, ServerContent, SessionConfig, ToolResponse,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub use events::{ClientEvent, ConnectionState};
pub use session::{PendingCalls, Session, SessionLog, StreamingLogEntry, DEFAULT_LOG_CAPACITY};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Model-turn text that signals a barge-in, checked against the first text part. `None`
    /// relies on the `interrupted` flag alone.
    pub interruption_marker: Option<String>,
    /// Entries kept in the session log
    pub log_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            interruption_marker: Some("interrupted".to_string()),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Flushes queued messages, sends a close frame and waits for both tasks.
    async fn shutdown(self) {
        self.cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.writer).await.is_err() {
            log::warn!("LiveClient: writer did not finish within {:?}", SHUTDOWN_TIMEOUT);
        }
        self.reader.abort();
        let _ = self.reader.await;
    }
}

struct CaptureLink {
    pipeline: CapturePipeline,
    task: JoinHandle<()>,
}

struct Inner {
    config: ClientConfig,
    playback: Arc<dyn AudioSink>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
    connection: Mutex<Option<Connection>>,
    capture: Mutex<Option<CaptureLink>>,
}

/// Handle to the streaming client. Clones share the same connection.
#[derive(Clone)]
pub struct LiveClient {
    inner: Arc<Inner>,
}

impl LiveClient {
    pub fn new(
        config: ClientConfig,
        playback: Arc<dyn AudioSink>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let client = Self {
            inner: Arc::new(Inner {
                config,
                playback,
                events,
                state,
                session: Mutex::new(Session::default()),
                connection: Mutex::new(None),
                capture: Mutex::new(None),
            }),
        };
        (client, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the client reaches `target`. Fails if the connection ends in another state
    /// first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let reached = rx
            .wait_for(|state| {
                *state == target
                    || matches!(state, ConnectionState::Errored | ConnectionState::Closed)
            })
            .await
            .map(|state| *state)
            .map_err(|_| LiveError::Connection("client dropped".to_string()))?;

        match reached {
            state if state == target => Ok(()),
            ConnectionState::Errored => Err(LiveError::Connection("connection failed".to_string())),
            state => Err(LiveError::NotConnected(state.to_string())),
        }
    }

    /// Copy of the current session log.
    pub fn session_log(&self) -> Vec<StreamingLogEntry> {
        self.inner.session().log.entries().cloned().collect()
    }

    pub fn session_config(&self) -> Option<SessionConfig> {
        self.inner.session().config.clone()
    }

    /// Connects and sends `setup`. Returns in `AwaitingSetupAck`; readiness is signalled by
    /// [`ClientEvent::Open`].
    pub async fn open(&self, endpoint: &Endpoint, config: SessionConfig) -> Result<()> {
        let mut current = ConnectionState::Idle;
        let started = self.inner.state.send_if_modified(|state| {
            current = *state;
            if state.can_open() {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(LiveError::InvalidState {
                operation: "open",
                state: current.to_string(),
            });
        }

        let model = config.model.clone();
        let setup = OutboundMessage::Setup(config.clone());
        *self.inner.session() = Session::new(config, self.inner.config.log_capacity);
        let frame = match protocol::encode(&setup) {
            Ok(frame) => frame,
            Err(e) => {
                self.inner.fail(format!("Failed to encode setup: {}", e));
                return Err(e.into());
            }
        };
        log::info!(
            "LiveClient: connecting to {} (model {})",
            endpoint.display_url(),
            model
        );

        let ws = match connect_async(endpoint.connect_url().as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                let detail = format!("Failed to connect: {}", e);
                self.inner.fail(detail.clone());
                return Err(LiveError::Connection(detail));
            }
        };
        let (mut write, read) = ws.split();

        if let Err(e) = write.send(frame).await {
            let detail = format!("Failed to send setup: {}", e);
            self.inner.fail(detail.clone());
            return Err(LiveError::Connection(detail));
        }
        self.inner.record_outbound(&setup);

        let awaiting = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::AwaitingSetupAck;
                true
            } else {
                false
            }
        });
        if !awaiting {
            let _ = write.close().await;
            return Err(LiveError::Connection("closed while connecting".to_string()));
        }
        log::debug!("LiveClient: setup sent, awaiting acknowledgement");

        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(
            Arc::clone(&self.inner),
            write,
            outbound_rx,
            cancel.clone(),
        ));
        let reader = tokio::spawn(run_reader(Arc::clone(&self.inner), read, cancel.clone()));
        *self.inner.connection() = Some(Connection {
            outbound,
            cancel,
            writer,
            reader,
        });

        // close() may have run before the connection was stored.
        if !self.state().is_open() {
            let orphaned = self.inner.connection().take();
            if let Some(connection) = orphaned {
                connection.shutdown().await;
            }
            return Err(LiveError::Connection("closed while connecting".to_string()));
        }
        Ok(())
    }

    pub fn send_realtime_input(&self, media_chunks: Vec<MediaChunk>) -> Result<()> {
        self.inner
            .send(OutboundMessage::RealtimeInput(RealtimeInput { media_chunks }))
    }

    pub fn send_content(&self, parts: Vec<Part>, turn_complete: bool) -> Result<()> {
        self.inner.send(OutboundMessage::ClientContent(ClientContent {
            turns: vec![Content::user(parts)],
            turn_complete,
        }))
    }

    /// Sends responses for outstanding calls. Responses for unknown, cancelled or already
    /// answered ids are dropped; if none remain nothing is transmitted.
    pub fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<()> {
        self.inner.ensure_active()?;

        let (accepted, rejected) = self.inner.session().pending.accept(responses);
        for response in &rejected {
            log::warn!(
                "LiveClient: dropping response for '{}' (id {}): call not outstanding",
                response.name,
                response.id
            );
        }
        if accepted.is_empty() {
            return Ok(());
        }

        self.inner.send(OutboundMessage::ToolResponse(ToolResponse {
            function_responses: accepted,
        }))
    }

    /// Starts `pipeline` and forwards its frames as `realtimeInput` until capture is stopped or
    /// the connection closes.
    pub fn start_capture(&self, pipeline: &CapturePipeline) -> Result<()> {
        self.inner.ensure_active()?;
        self.stop_capture();

        // Subscribe before starting so the first frame is not lost.
        let events = pipeline.events();
        pipeline.start()?;

        let mime_type = pipeline.config().mime_type();
        let client = self.clone();
        let task = tokio::spawn(async move {
            tokio::pin!(events);
            while let Some(event) = events.next().await {
                match event {
                    CaptureEvent::Data(frame) => {
                        let chunk = MediaChunk::new(mime_type.as_str(), frame.base64);
                        if let Err(e) = client.send_realtime_input(vec![chunk]) {
                            log::debug!("LiveClient: capture forwarding stopped: {}", e);
                            break;
                        }
                    }
                    CaptureEvent::Volume(level) => {
                        log::trace!("LiveClient: input level {:.3}", level);
                    }
                }
            }
        });

        *self.inner.capture() = Some(CaptureLink {
            pipeline: pipeline.clone(),
            task,
        });
        Ok(())
    }

    pub fn stop_capture(&self) {
        self.inner.stop_capture();
    }

    /// Stops capture and playback, tears down the transport and emits `Close`. No-op when
    /// nothing is open.
    pub async fn close(&self) {
        let mut previous = ConnectionState::Idle;
        let closing = self.inner.state.send_if_modified(|state| {
            previous = *state;
            if state.is_open() {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if !closing {
            log::debug!("LiveClient: close ignored while {}", previous);
            return;
        }

        log::info!("LiveClient: closing (was {})", previous);
        self.inner.teardown_media();

        let connection = self.inner.connection().take();
        if let Some(connection) = connection {
            connection.shutdown().await;
        }

        self.inner.record("client.close", "closed by client");
        self.inner.state.send_replace(ConnectionState::Closed);
        self.inner.emit(ClientEvent::Close("closed by client".to_string()));
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn capture(&self) -> MutexGuard<'_, Option<CaptureLink>> {
        match self.capture.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: ClientEvent) {
        // The owner may have dropped the receiver; events are then simply not observed.
        let _ = self.events.send(event);
    }

    fn record(&self, tag: &str, message: &str) {
        let entry = self
            .session()
            .log
            .push(StreamingLogEntry::new(tag, message))
            .clone();
        self.emit(ClientEvent::Log(entry));
    }

    fn record_outbound(&self, message: &OutboundMessage) {
        self.record(&format!("client.{}", message.name()), &message.summary());
    }

    fn ensure_active(&self) -> Result<()> {
        let state = *self.state.borrow();
        if state == ConnectionState::Active {
            Ok(())
        } else {
            Err(LiveError::NotConnected(state.to_string()))
        }
    }

    fn send(&self, message: OutboundMessage) -> Result<()> {
        self.ensure_active()?;
        let frame = protocol::encode(&message)?;

        let queued = match self.connection().as_ref() {
            Some(connection) => connection.outbound.send(frame).is_ok(),
            None => false,
        };
        if !queued {
            return Err(LiveError::NotConnected("transport closed".to_string()));
        }

        log::trace!("LiveClient: queued {}", message.name());
        self.record_outbound(&message);
        Ok(())
    }

    fn stop_capture(&self) {
        let link = self.capture().take();
        if let Some(link) = link {
            link.task.abort();
            link.pipeline.stop();
        }
    }

    /// Releases both audio devices.
    fn teardown_media(&self) {
        self.stop_capture();
        self.playback.stop();
    }

    /// Ends an open connection from inside: transport failure (`Errored`) or remote close
    /// (`Closed`). No-op once closing or closed.
    fn terminate(&self, next: ConnectionState, reason: String) {
        let ended = self.state.send_if_modified(|state| {
            if state.is_open() {
                *state = next;
                true
            } else {
                false
            }
        });
        if !ended {
            return;
        }

        self.teardown_media();
        if let Some(connection) = self.connection().take() {
            connection.cancel.cancel();
        }

        if next == ConnectionState::Errored {
            log::error!("LiveClient: connection failed: {}", reason);
            self.record("client.error", &reason);
            self.emit(ClientEvent::Error(reason.clone()));
        } else {
            log::info!("LiveClient: server closed the connection: {}", reason);
            self.record("server.close", &reason);
        }
        self.emit(ClientEvent::Close(reason));
    }

    fn fail(&self, detail: String) {
        self.terminate(ConnectionState::Errored, detail);
    }

    /// Surfaces an error raised while the connection is running. Only transport failures end
    /// the connection; anything else becomes an `Error` event and the session carries on.
    fn report(&self, err: LiveError) {
        if err.is_fatal() {
            self.fail(err.to_string());
        } else {
            log::warn!("LiveClient: {}", err);
            self.emit(ClientEvent::Error(err.to_string()));
        }
    }

    fn handle_inbound(&self, message: InboundMessage) {
        self.record(&format!("server.{}", message.name()), &message.summary());

        let state = *self.state.borrow();
        match (state, message) {
            (ConnectionState::AwaitingSetupAck, InboundMessage::SetupComplete) => {
                self.state.send_replace(ConnectionState::Active);
                log::info!("LiveClient: session active");
                self.emit(ClientEvent::Open);
            }
            (ConnectionState::AwaitingSetupAck, other) => {
                let violation = LiveError::ProtocolViolation(format!(
                    "{} received before setupComplete",
                    other.name()
                ));
                log::warn!("LiveClient: {}, discarded", violation);
            }
            (ConnectionState::Active, InboundMessage::SetupComplete) => {
                log::warn!("LiveClient: duplicate setupComplete ignored");
            }
            (ConnectionState::Active, InboundMessage::ServerContent(content)) => {
                self.handle_server_content(content);
            }
            (ConnectionState::Active, InboundMessage::ToolCall(call)) => {
                self.session().pending.register(&call.function_calls);
                self.emit(ClientEvent::ToolCall(call.function_calls));
            }
            (ConnectionState::Active, InboundMessage::ToolCallCancellation(cancellation)) => {
                let dropped = self.session().pending.cancel(&cancellation.ids);
                log::debug!(
                    "LiveClient: {} of {} cancelled calls were outstanding",
                    dropped,
                    cancellation.ids.len()
                );
                self.emit(ClientEvent::ToolCallCancellation(cancellation.ids));
            }
            (state, other) => {
                log::debug!("LiveClient: {} ignored while {}", other.name(), state);
            }
        }
    }

    fn handle_server_content(&self, content: ServerContent) {
        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();

        if content.interrupted || self.is_interruption_marker(&parts) {
            // Flush before anything else from this message can reach playback.
            self.playback.flush();
            log::info!("LiveClient: interrupted, playback flushed");
            self.emit(ClientEvent::Interrupted);
            return;
        }

        for part in parts {
            if let Some(pcm) = part.audio_bytes() {
                if let Err(e) = self.playback.enqueue(pcm) {
                    self.report(e.into());
                }
                self.emit(ClientEvent::Audio(pcm.to_vec()));
            } else {
                self.emit(ClientEvent::Content(part));
            }
        }

        if content.turn_complete {
            self.emit(ClientEvent::TurnComplete);
        }
    }

    fn is_interruption_marker(&self, parts: &[Part]) -> bool {
        let Some(marker) = self.config.interruption_marker.as_deref() else {
            return false;
        };
        parts.iter().find_map(Part::as_text) == Some(marker)
    }
}

async fn run_writer(
    inner: Arc<Inner>,
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            // Drain queued messages before honouring a close.
            biased;
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = write.send(message).await {
                    inner.report(e.into());
                    return;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    if let Err(e) = write.close().await {
        log::debug!("LiveClient: close frame not sent: {}", e);
    }
}

async fn run_reader(inner: Arc<Inner>, mut read: SplitStream<WsStream>, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = read.next() => next,
        };

        match next {
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "connection closed".to_string());
                inner.terminate(ConnectionState::Closed, reason);
                break;
            }
            Some(Ok(message)) => match protocol::decode(&message) {
                Ok(Some(inbound)) => inner.handle_inbound(inbound),
                Ok(None) => {}
                Err(e) => {
                    let violation = LiveError::ProtocolViolation(e.to_string());
                    log::warn!("LiveClient: {}, discarded", violation);
                    inner.record("server.unknown", &violation.to_string());
                }
            },
            Some(Err(e)) => {
                inner.report(e.into());
                break;
            }
            None => {
                inner.terminate(ConnectionState::Closed, "connection closed".to_string());
                break;
            }
        }
    }
}
