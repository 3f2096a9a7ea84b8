use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opcodes for gateway messages.
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    /// Some gateways report an authentication failure as an op-4 frame
    /// carrying the close code in `d` instead of closing the socket.
    pub const AUTH_FAILURE: u8 = 4;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Close codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const AUTH_FAILED: u16 = 4004;
    pub const INVALID_SEQ: u16 = 4007;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_VERSION: u16 = 4012;
    pub const INVALID_INTENT: u16 = 4013;
    pub const DISALLOWED_INTENT: u16 = 4014;
}

/// Dispatch event names the session itself reacts to.
pub mod event_type {
    pub const READY: &str = "READY";
    pub const RESUMED: &str = "RESUMED";
    pub const MESSAGE_CREATE: &str = "MESSAGE_CREATE";
}

/// Gateway message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayFrame {
    fn outbound(op: u8, d: Value) -> Self {
        Self {
            op,
            d: Some(d),
            s: None,
            t: None,
        }
    }
}

/// HELLO payload data.
#[derive(Debug, Deserialize)]
pub struct HelloData {
    pub heartbeat_interval: u64,
}

/// READY payload data. Only the fields the session keeps are decoded.
#[derive(Debug, Deserialize)]
pub struct ReadyData {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    pub user: ReadyUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyUser {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// Client properties reported in IDENTIFY.
#[derive(Debug, Clone, Serialize)]
pub struct ClientProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// IDENTIFY payload data.
#[derive(Debug, Serialize)]
pub struct IdentifyData<'a> {
    pub token: &'a str,
    pub properties: &'a ClientProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intents: Option<u64>,
}

/// RESUME payload data.
#[derive(Debug, Serialize)]
pub struct ResumeData<'a> {
    pub token: &'a str,
    pub session_id: &'a str,
    pub seq: u64,
}

pub fn identify(token: &str, properties: &ClientProperties, intents: Option<u64>) -> GatewayFrame {
    let data = IdentifyData {
        token,
        properties,
        intents,
    };
    GatewayFrame::outbound(
        opcode::IDENTIFY,
        serde_json::to_value(data).unwrap_or(Value::Null),
    )
}

pub fn resume(token: &str, session_id: &str, seq: u64) -> GatewayFrame {
    let data = ResumeData {
        token,
        session_id,
        seq,
    };
    GatewayFrame::outbound(
        opcode::RESUME,
        serde_json::to_value(data).unwrap_or(Value::Null),
    )
}

/// Heartbeats carry the last sequence number, or `null` before the first dispatch.
pub fn heartbeat(seq: Option<u64>) -> GatewayFrame {
    GatewayFrame::outbound(opcode::HEARTBEAT, seq.map(Value::from).unwrap_or(Value::Null))
}

/// An inbound dispatch (op 0), handed to the dispatcher exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub sequence: Option<u64>,
    pub event_type: String,
    pub payload: Value,
}

impl DispatchEvent {
    /// Build a dispatch event from an op-0 frame. Frames without an event
    /// type are not dispatches and yield `None`.
    pub fn from_frame(frame: GatewayFrame) -> Option<Self> {
        if frame.op != opcode::DISPATCH {
            return None;
        }
        Some(Self {
            sequence: frame.s,
            event_type: frame.t?,
            payload: frame.d.unwrap_or(Value::Null),
        })
    }
}

/// Lifecycle notifications for an external observability collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connecting { url: String },
    Identifying { bot_token: bool },
    Ready { session_id: String, user_id: String },
    Resuming { session_id: String, sequence: u64 },
    Resumed,
    HeartbeatMissed,
    IdleTimeout,
    Reconnecting { attempt: u32, delay_ms: u64, resume: bool },
    FatalAuthError { code: u16, reason: String },
    Disconnected,
}
