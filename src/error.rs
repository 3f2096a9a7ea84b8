use thiserror::Error;

/// Errors raised by the gateway session.
///
/// Only the fatal variants (see [`GatewayError::is_fatal`]) ever leave
/// [`GatewaySession::run`](crate::gateway::GatewaySession::run); the rest are
/// handled by the reconnect loop and surface as lifecycle events.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed gateway payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no HELLO received within the handshake window")]
    HelloTimeout,
    #[error("authentication failed ({0}): the token was rejected")]
    AuthenticationFailed(u16),
    #[error("disallowed intents ({0}): enable the privileged intents for this application")]
    DisallowedIntents(u16),
    #[error("invalid intents ({0})")]
    InvalidIntents(u16),
    #[error("gateway closed the session with unrecoverable code {0}")]
    UnrecoverableClose(u16),
    #[error("gave up after {0} consecutive invalidated sessions")]
    ReconnectAttemptsExhausted(u32),
}

impl GatewayError {
    /// Terminal errors require operator action; retrying with the same
    /// credential cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::AuthenticationFailed(_)
                | GatewayError::DisallowedIntents(_)
                | GatewayError::InvalidIntents(_)
                | GatewayError::UnrecoverableClose(_)
                | GatewayError::ReconnectAttemptsExhausted(_)
        )
    }

    /// The gateway close code behind a fatal error, if any.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            GatewayError::AuthenticationFailed(code)
            | GatewayError::DisallowedIntents(code)
            | GatewayError::InvalidIntents(code)
            | GatewayError::UnrecoverableClose(code) => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failures_are_fatal() {
        assert!(GatewayError::AuthenticationFailed(4004).is_fatal());
        assert!(GatewayError::DisallowedIntents(4014).is_fatal());
        assert!(GatewayError::InvalidIntents(4013).is_fatal());
        assert!(GatewayError::ReconnectAttemptsExhausted(5).is_fatal());
    }

    #[test]
    fn test_transient_errors_are_recoverable() {
        assert!(!GatewayError::HelloTimeout.is_fatal());
        assert!(!GatewayError::Protocol("bad frame".into()).is_fatal());
    }

    #[test]
    fn test_close_code_exposed_for_fatal_errors() {
        assert_eq!(GatewayError::DisallowedIntents(4011).close_code(), Some(4011));
        assert_eq!(GatewayError::HelloTimeout.close_code(), None);
    }
}
