pub mod backoff;
pub mod dispatcher;
pub mod events;
pub mod heartbeat;
pub mod intents;
pub mod session;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use backoff::Backoff;
use dispatcher::Dispatcher;
use events::{
    close_code, event_type, opcode, DispatchEvent, GatewayFrame, HelloData, LifecycleEvent,
    ReadyData,
};
use heartbeat::{Beat, Heartbeater};
use session::{ConnectionState, SessionState, Transition};

/// Protocol version and encoding negotiated through the connect URL.
pub const GATEWAY_QUERY: &str = "v=10&encoding=json";

/// How long the writer task gets to flush before it is aborted.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, Message>;

/// How a socket ended and what the reconnect loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketEnd {
    Shutdown,
    /// Keep the session and try RESUME on the next socket.
    Resume,
    /// No session to resume; IDENTIFY afresh.
    Reconnect,
    /// The gateway ended the session. IDENTIFY afresh; counts toward the
    /// reconnect budget.
    Invalidated,
}

/// Result of handling one inbound frame.
enum FrameOutcome {
    Continue,
    /// Frame was understood but not valid here; counts toward the protocol
    /// error threshold.
    Unexpected,
    End(SocketEnd),
}

/// What a gateway close code means for the session.
#[derive(Debug)]
pub enum CloseAction {
    Fatal(GatewayError),
    Resume,
    Reconnect,
}

/// Classify a close code (or an op-4 failure code).
pub fn classify_close(code: u16) -> CloseAction {
    match code {
        close_code::AUTH_FAILED => CloseAction::Fatal(GatewayError::AuthenticationFailed(code)),
        close_code::SHARDING_REQUIRED | close_code::DISALLOWED_INTENT => {
            CloseAction::Fatal(GatewayError::DisallowedIntents(code))
        }
        close_code::INVALID_INTENT => CloseAction::Fatal(GatewayError::InvalidIntents(code)),
        close_code::INVALID_SHARD | close_code::INVALID_VERSION => {
            CloseAction::Fatal(GatewayError::UnrecoverableClose(code))
        }
        close_code::NORMAL
        | close_code::GOING_AWAY
        | close_code::INVALID_SEQ
        | close_code::SESSION_TIMED_OUT => CloseAction::Reconnect,
        _ => CloseAction::Resume,
    }
}

fn is_valid_resume_url(url: &str) -> bool {
    url.starts_with("wss://") || url.starts_with("ws://")
}

fn close_message(code: u16) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    }))
}

async fn send_frame(
    out_tx: &mpsc::Sender<Message>,
    frame: &GatewayFrame,
) -> Result<(), GatewayError> {
    let json = serde_json::to_string(frame)?;
    out_tx
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| GatewayError::Protocol("websocket writer closed".into()))
}

/// Owns the socket's write half so writes never wait on a pending read.
async fn write_loop(mut ws_sink: WsWriter, mut out_rx: mpsc::Receiver<Message>) {
    while let Some(msg) = out_rx.recv().await {
        let closing = msg.is_close();
        if let Err(e) = ws_sink.send(msg).await {
            tracing::debug!("gateway writer: send failed: {e}");
            return;
        }
        if closing {
            break;
        }
    }
    let _ = ws_sink.close().await;
}

/// A single logical session with the Gateway.
///
/// Hides reconnects and resumes from consumers: dispatch events reach the
/// [`Dispatcher`] in sequence order for as long as [`GatewaySession::run`]
/// is running.
pub struct GatewaySession {
    config: GatewayConfig,
    dispatcher: Dispatcher,
    state: SessionState,
    shutdown: CancellationToken,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    /// Set once the current socket reached `Connected`.
    established: bool,
}

impl GatewaySession {
    pub fn new(config: GatewayConfig, dispatcher: Dispatcher, shutdown: CancellationToken) -> Self {
        let (lifecycle, _) = broadcast::channel(64);
        Self {
            config,
            dispatcher,
            state: SessionState::new(),
            shutdown,
            lifecycle,
            established: false,
        }
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.state.session_id.as_deref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.state.sequence
    }

    /// Run until shutdown or a fatal error.
    ///
    /// Transport failures, socket drops and handshake timeouts are retried
    /// forever under capped backoff. Only sessions the gateway invalidates
    /// count toward `max_reconnect_attempts`, and the count resets on READY or
    /// RESUMED. Returns `Err` only
    /// for failures that need operator action: rejected credentials,
    /// disallowed or invalid intents, or too many invalidated sessions.
    pub async fn run(&mut self) -> Result<(), GatewayError> {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        let mut invalidated: u32 = 0;
        let mut resume_failures: u32 = 0;

        while !self.shutdown.is_cancelled() {
            let resuming = self.state.can_resume();
            let end = self.connect_and_run().await;

            if self.established {
                backoff.reset();
                invalidated = 0;
                resume_failures = 0;
            } else if resuming {
                resume_failures = resume_failures.saturating_add(1);
            }

            match end {
                Ok(SocketEnd::Shutdown) => break,
                Ok(SocketEnd::Resume) => {}
                Ok(SocketEnd::Reconnect) => self.state.clear_session(),
                Ok(SocketEnd::Invalidated) => {
                    self.state.clear_session();
                    invalidated = invalidated.saturating_add(1);
                }
                Err(e) if e.is_fatal() => return Err(self.fail(e)),
                Err(e) => tracing::warn!(error = %e, "gateway connection error"),
            }

            if resume_failures >= self.config.max_resume_attempts && self.state.can_resume() {
                tracing::warn!(resume_failures, "resume keeps failing, discarding session");
                self.state.clear_session();
                resume_failures = 0;
            }
            if invalidated > self.config.max_reconnect_attempts {
                return Err(self.fail(GatewayError::ReconnectAttemptsExhausted(invalidated)));
            }

            let delay = backoff.next_delay();
            let resume = self.state.can_resume();
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempt(),
                resume,
                "reconnecting to gateway"
            );
            self.emit(LifecycleEvent::Reconnecting {
                attempt: backoff.attempt(),
                delay_ms: delay.as_millis() as u64,
                resume,
            });

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("gateway session closed");
        self.emit(LifecycleEvent::Disconnected);
        Ok(())
    }

    fn fail(&mut self, err: GatewayError) -> GatewayError {
        if let Some(code) = err.close_code() {
            if matches!(err, GatewayError::DisallowedIntents(_)) {
                tracing::error!(
                    privileged = ?intents::privileged_names(self.config.intents),
                    "gateway refused the requested intents"
                );
            }
            tracing::error!(code, "fatal gateway error, not retrying: {err}");
            self.emit(LifecycleEvent::FatalAuthError {
                code,
                reason: err.to_string(),
            });
        } else {
            tracing::error!("giving up on gateway session: {err}");
        }
        self.emit(LifecycleEvent::Disconnected);
        err
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.lifecycle.send(event);
    }

    /// Apply a state transition. Illegal transitions are logged and leave the
    /// state unchanged.
    fn transition(&mut self, input: Transition) -> bool {
        match self.state.apply(input) {
            Ok(next) => {
                tracing::trace!(state = ?next, "connection state changed");
                true
            }
            Err(e) => {
                tracing::warn!("{e}");
                false
            }
        }
    }

    fn connect_url(&self) -> String {
        let base = match self.state.resume_gateway_url.as_deref() {
            Some(url) if self.state.can_resume() && is_valid_resume_url(url) => url.to_string(),
            _ => self.config.url.clone(),
        };
        format!("{}/?{GATEWAY_QUERY}", base.trim_end_matches('/'))
    }

    fn resume_or_reconnect(&self) -> SocketEnd {
        if self.state.can_resume() {
            SocketEnd::Resume
        } else {
            SocketEnd::Reconnect
        }
    }

    /// One socket: connect, handshake, read until it ends, then close it.
    async fn connect_and_run(&mut self) -> Result<SocketEnd, GatewayError> {
        self.established = false;
        self.state.reset_socket();
        let url = self.connect_url();
        self.transition(Transition::Open);
        tracing::info!(url = %url, "connecting to gateway");
        self.emit(LifecycleEvent::Connecting { url: url.clone() });

        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            r = tokio::time::timeout(self.config.handshake_timeout, connect_async(url.as_str())) => Some(r),
        };
        let ws = match connected {
            None => {
                self.transition(Transition::Shutdown);
                self.transition(Transition::Closed);
                return Ok(SocketEnd::Shutdown);
            }
            Some(Err(_)) => {
                self.transition(Transition::Dropped);
                return Err(GatewayError::Protocol("timed out opening websocket".into()));
            }
            Some(Ok(Err(e))) => {
                self.transition(Transition::Dropped);
                return Err(e.into());
            }
            Some(Ok(Ok((ws, _)))) => ws,
        };

        let (ws_sink, mut ws_stream) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(64);
        let mut writer = tokio::spawn(write_loop(ws_sink, out_rx));

        let end = self.read_loop(&mut ws_stream, &out_tx).await;

        let shutting_down = matches!(end, Ok(SocketEnd::Shutdown));
        if shutting_down {
            self.transition(Transition::Shutdown);
        }
        // A normal close ends the session server-side; anything else keeps it resumable.
        let code = match end {
            Ok(SocketEnd::Shutdown | SocketEnd::Reconnect | SocketEnd::Invalidated) => {
                close_code::NORMAL
            }
            _ => close_code::UNKNOWN_ERROR,
        };
        let _ = out_tx.send(close_message(code)).await;
        drop(out_tx);
        tokio::select! {
            _ = &mut writer => {}
            _ = tokio::time::sleep(WRITER_FLUSH_TIMEOUT) => writer.abort(),
        }
        drop(ws_stream);

        if shutting_down {
            self.transition(Transition::Closed);
        } else {
            self.transition(Transition::Dropped);
        }
        end
    }

    async fn wait_for_hello(&self, ws_stream: &mut WsReader) -> Result<HelloData, GatewayError> {
        loop {
            match ws_stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: GatewayFrame = match serde_json::from_str(&text) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::warn!("dropping malformed frame before HELLO: {e}");
                            continue;
                        }
                    };
                    match frame.op {
                        opcode::HELLO => {
                            let data = frame.d.ok_or_else(|| {
                                GatewayError::Protocol("HELLO without data".into())
                            })?;
                            return Ok(serde_json::from_value(data)?);
                        }
                        opcode::AUTH_FAILURE => return Err(self.auth_failure(frame.d)),
                        op => tracing::debug!(op, "ignoring frame before HELLO"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map_or(close_code::NORMAL, |f| u16::from(f.code));
                    return match classify_close(code) {
                        CloseAction::Fatal(e) => Err(e),
                        _ => Err(GatewayError::Protocol(format!(
                            "socket closed ({code}) before HELLO"
                        ))),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err(GatewayError::Protocol("socket closed before HELLO".into())),
            }
        }
    }

    fn auth_failure(&self, data: Option<serde_json::Value>) -> GatewayError {
        let code = data
            .as_ref()
            .and_then(serde_json::Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(close_code::AUTH_FAILED);
        match classify_close(code) {
            CloseAction::Fatal(e) => e,
            _ => GatewayError::AuthenticationFailed(code),
        }
    }

    async fn read_loop(
        &mut self,
        ws_stream: &mut WsReader,
        out_tx: &mpsc::Sender<Message>,
    ) -> Result<SocketEnd, GatewayError> {
        let hello = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(SocketEnd::Shutdown),
            r = tokio::time::timeout(self.config.handshake_timeout, self.wait_for_hello(ws_stream)) => {
                r.map_err(|_| GatewayError::HelloTimeout)??
            }
        };

        let interval = Duration::from_millis(hello.heartbeat_interval.max(1));
        self.state.record_hello(interval);
        let resume = self.state.can_resume();
        self.transition(Transition::Hello { resume });
        tracing::debug!(interval_ms = interval.as_millis() as u64, resume, "HELLO received");

        let mut heartbeater = Heartbeater::start(interval);
        self.authenticate(out_tx).await?;

        let mut protocol_errors: u32 = 0;
        let mut last_frame = Instant::now();

        loop {
            let connected = self.state.state() == ConnectionState::Connected;
            let window = if connected {
                self.config.idle_timeout
            } else {
                self.config.handshake_timeout
            };

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return Ok(SocketEnd::Shutdown),

                _ = heartbeater.tick() => match heartbeater.on_tick() {
                    Beat::Send => {
                        send_frame(out_tx, &events::heartbeat(self.state.sequence)).await?;
                        tracing::trace!(seq = ?self.state.sequence, "heartbeat sent");
                    }
                    Beat::Zombie => {
                        tracing::warn!(
                            interval_ms = self.state.heartbeat_interval.map(|d| d.as_millis() as u64),
                            since_ack_ms = self.state.last_heartbeat_ack.map(|t| t.elapsed().as_millis() as u64),
                            "heartbeat not acknowledged, connection is a zombie"
                        );
                        self.emit(LifecycleEvent::HeartbeatMissed);
                        return Ok(self.resume_or_reconnect());
                    }
                },

                _ = tokio::time::sleep_until(last_frame + window) => {
                    if connected {
                        tracing::warn!(idle_secs = window.as_secs(), "gateway went silent");
                        self.emit(LifecycleEvent::IdleTimeout);
                    } else {
                        tracing::warn!("handshake stalled after HELLO");
                    }
                    return Ok(self.resume_or_reconnect());
                }

                msg = ws_stream.next() => {
                    last_frame = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let outcome = match serde_json::from_str::<GatewayFrame>(&text) {
                                Ok(frame) => self.handle_frame(frame, out_tx, &mut heartbeater).await?,
                                Err(e) => {
                                    tracing::warn!("dropping malformed gateway frame: {e}");
                                    FrameOutcome::Unexpected
                                }
                            };
                            match outcome {
                                FrameOutcome::Continue => protocol_errors = 0,
                                FrameOutcome::Unexpected => {
                                    protocol_errors += 1;
                                    if protocol_errors > self.config.protocol_error_threshold {
                                        tracing::warn!(protocol_errors, "too many bad frames, reconnecting");
                                        return Ok(self.resume_or_reconnect());
                                    }
                                }
                                FrameOutcome::End(end) => return Ok(end),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map_or(close_code::NORMAL, |f| u16::from(f.code));
                            return self.handle_close_code(code);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("websocket read error: {e}");
                            return Ok(self.resume_or_reconnect());
                        }
                        None => {
                            tracing::warn!("websocket stream ended");
                            return Ok(self.resume_or_reconnect());
                        }
                    }
                }
            }
        }
    }

    /// Send IDENTIFY, or RESUME when the session can be resumed.
    async fn authenticate(&mut self, out_tx: &mpsc::Sender<Message>) -> Result<(), GatewayError> {
        let state = self.state.state();
        if !state.may_authenticate() {
            return Err(GatewayError::Protocol(format!(
                "cannot authenticate in state {state:?}"
            )));
        }

        let frame = match (state, self.state.session_id.clone(), self.state.sequence) {
            (ConnectionState::Resuming, Some(session_id), Some(seq)) => {
                tracing::info!(session_id = %session_id, seq, "resuming gateway session");
                let frame = events::resume(&self.config.token, &session_id, seq);
                self.emit(LifecycleEvent::Resuming {
                    session_id,
                    sequence: seq,
                });
                frame
            }
            _ => {
                let intents = intents::identify_intents(&self.config.token, self.config.intents);
                tracing::info!(bot_token = intents.is_some(), "identifying");
                self.emit(LifecycleEvent::Identifying {
                    bot_token: intents.is_some(),
                });
                events::identify(&self.config.token, &self.config.properties, intents)
            }
        };
        send_frame(out_tx, &frame).await
    }

    async fn handle_frame(
        &mut self,
        frame: GatewayFrame,
        out_tx: &mpsc::Sender<Message>,
        heartbeater: &mut Heartbeater,
    ) -> Result<FrameOutcome, GatewayError> {
        match frame.op {
            opcode::DISPATCH => self.handle_dispatch(frame),
            opcode::HEARTBEAT => {
                send_frame(out_tx, &events::heartbeat(self.state.sequence)).await?;
                heartbeater.record_sent();
                Ok(FrameOutcome::Continue)
            }
            opcode::HEARTBEAT_ACK => {
                heartbeater.ack();
                self.state.last_heartbeat_ack = Some(Instant::now());
                Ok(FrameOutcome::Continue)
            }
            opcode::RECONNECT => {
                tracing::info!("gateway requested reconnect");
                Ok(FrameOutcome::End(self.resume_or_reconnect()))
            }
            opcode::INVALID_SESSION => {
                let resumable = frame
                    .d
                    .as_ref()
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if resumable {
                    tracing::info!("invalid session (resumable)");
                    Ok(FrameOutcome::End(self.resume_or_reconnect()))
                } else {
                    tracing::info!("invalid session (not resumable), starting over");
                    self.state.clear_session();
                    Ok(FrameOutcome::End(SocketEnd::Invalidated))
                }
            }
            opcode::AUTH_FAILURE => Err(self.auth_failure(frame.d)),
            opcode::HELLO => {
                tracing::warn!("unexpected HELLO mid-session, ignoring");
                Ok(FrameOutcome::Unexpected)
            }
            op => {
                tracing::debug!(op, "unknown gateway opcode");
                Ok(FrameOutcome::Unexpected)
            }
        }
    }

    fn handle_dispatch(&mut self, frame: GatewayFrame) -> Result<FrameOutcome, GatewayError> {
        // The sequence is recorded before the event is handed on.
        if let Some(seq) = frame.s {
            self.state.observe_sequence(seq);
        }
        let Some(event) = DispatchEvent::from_frame(frame) else {
            tracing::debug!("dispatch frame without event type");
            return Ok(FrameOutcome::Unexpected);
        };

        match event.event_type.as_str() {
            event_type::READY => self.handle_ready(event),
            event_type::RESUMED => {
                if !self.transition(Transition::Resumed) {
                    return Ok(FrameOutcome::Unexpected);
                }
                self.established = true;
                tracing::info!(seq = ?self.state.sequence, "gateway session resumed");
                self.emit(LifecycleEvent::Resumed);
                Ok(FrameOutcome::Continue)
            }
            _ => {
                self.dispatcher.dispatch(event);
                Ok(FrameOutcome::Continue)
            }
        }
    }

    fn handle_ready(&mut self, event: DispatchEvent) -> Result<FrameOutcome, GatewayError> {
        let ready: ReadyData = serde_json::from_value(event.payload)?;
        if !self.transition(Transition::Ready) {
            return Ok(FrameOutcome::Unexpected);
        }

        self.state.session_id = Some(ready.session_id.clone());
        self.state.resume_gateway_url = ready
            .resume_gateway_url
            .filter(|url| is_valid_resume_url(url));
        self.state.user_id = Some(ready.user.id.clone());
        self.established = true;

        tracing::info!(
            session_id = %ready.session_id,
            user_id = %ready.user.id,
            username = ready.user.username.as_deref().unwrap_or("unknown"),
            "gateway session ready"
        );
        self.emit(LifecycleEvent::Ready {
            session_id: ready.session_id,
            user_id: ready.user.id,
        });
        Ok(FrameOutcome::Continue)
    }

    fn handle_close_code(&mut self, code: u16) -> Result<SocketEnd, GatewayError> {
        match classify_close(code) {
            CloseAction::Fatal(e) => Err(e),
            CloseAction::Resume => {
                tracing::warn!(code, "gateway closed the socket");
                Ok(self.resume_or_reconnect())
            }
            CloseAction::Reconnect => {
                tracing::info!(code, "gateway closed the session");
                self.state.clear_session();
                Ok(SocketEnd::Invalidated)
            }
        }
    }
}
