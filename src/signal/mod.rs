//! Contract-address signal detection.
//!
//! A signal is a chat message that names a contract address after the word
//! `CA`. Detection is a pure function of the message: the same
//! [`SignalCandidate`] always produces the same [`Extraction`].

pub mod extractor;
pub mod patterns;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use extractor::{Extraction, Rejection, SignalExtractor};

/// A chat message considered for signal extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalCandidate {
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub is_bot_author: bool,
    pub raw_text: String,
    /// Message timestamp as reported by the gateway.
    pub received_at: DateTime<Utc>,
}

/// How the address was located in the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Found right after `CA:`, `CA=` or `CA `.
    High,
    /// Found as a bare alphanumeric run elsewhere in the text.
    Low,
}

/// A validated signal handed to the notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalRecord {
    pub token_address: String,
    pub source_channel_id: String,
    pub message_id: String,
    pub author_id: String,
    pub detected_at: DateTime<Utc>,
    pub confidence: Confidence,
}
