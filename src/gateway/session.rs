use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Connection lifecycle of a gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Identifying,
    Resuming,
    Connected,
    Closing,
}

/// Inputs that move the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Socket opened, waiting for HELLO.
    Open,
    /// HELLO received; `resume` selects RESUME over IDENTIFY.
    Hello { resume: bool },
    Ready,
    Resumed,
    /// Socket lost or abandoned for a reconnect.
    Dropped,
    Shutdown,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: ConnectionState,
    pub input: Transition,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal transition {:?} in state {:?}", self.input, self.from)
    }
}

impl std::error::Error for IllegalTransition {}

impl ConnectionState {
    /// Transition table. Anything not listed is illegal, e.g. READY while
    /// already connected or HELLO before a socket is open.
    pub fn next(self, input: Transition) -> Result<ConnectionState, IllegalTransition> {
        use ConnectionState::*;
        use Transition::*;

        let next = match (self, input) {
            (Disconnected, Open) => Connecting,
            (Connecting, Hello { resume: false }) => Identifying,
            (Connecting, Hello { resume: true }) => Resuming,
            (Identifying, Ready) => Connected,
            (Resuming, Resumed) => Connected,
            (Connecting | Identifying | Resuming | Connected, Dropped) => Disconnected,
            (Disconnected, Dropped) => Disconnected,
            (_, Shutdown) => Closing,
            (Closing, Closed) => Disconnected,
            (from, input) => return Err(IllegalTransition { from, input }),
        };
        Ok(next)
    }

    /// Whether an IDENTIFY or RESUME frame may be sent in this state.
    pub fn may_authenticate(self) -> bool {
        matches!(self, ConnectionState::Identifying | ConnectionState::Resuming)
    }
}

/// Per-session protocol state, owned exclusively by the session's read loop.
#[derive(Debug)]
pub struct SessionState {
    state: ConnectionState,
    pub heartbeat_interval: Option<Duration>,
    pub last_heartbeat_ack: Option<Instant>,
    pub sequence: Option<u64>,
    pub session_id: Option<String>,
    pub resume_gateway_url: Option<String>,
    pub user_id: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            heartbeat_interval: None,
            last_heartbeat_ack: None,
            sequence: None,
            session_id: None,
            resume_gateway_url: None,
            user_id: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn apply(&mut self, input: Transition) -> Result<ConnectionState, IllegalTransition> {
        self.state = self.state.next(input)?;
        Ok(self.state)
    }

    /// Record the HELLO interval. Returns `false` (and keeps the first value)
    /// when the current socket already received one.
    pub fn record_hello(&mut self, interval: Duration) -> bool {
        if self.heartbeat_interval.is_some() {
            return false;
        }
        self.heartbeat_interval = Some(interval);
        true
    }

    /// Sequence numbers only move forward; replays during resume may repeat
    /// an already-seen value.
    pub fn observe_sequence(&mut self, seq: u64) {
        if self.sequence.map_or(true, |current| seq > current) {
            self.sequence = Some(seq);
        }
    }

    /// Resume needs both a session id and a sequence number.
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    /// Forget the session so the next connection performs a fresh IDENTIFY.
    pub fn clear_session(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_gateway_url = None;
    }

    /// Reset the per-socket fields ahead of a new connection attempt.
    pub fn reset_socket(&mut self) {
        self.heartbeat_interval = None;
        self.last_heartbeat_ack = None;
    }
}
