use std::collections::HashSet;

use super::patterns::{self, ADDRESS_PATTERNS};
use super::{SignalCandidate, SignalRecord};

/// Why a message produced no signal. Rejections are ordinary outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UnsubscribedChannel,
    BotAuthor,
    NoSignalWord,
    NoValidAddress,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::UnsubscribedChannel => "unsubscribed_channel",
            Rejection::BotAuthor => "bot_author",
            Rejection::NoSignalWord => "no_signal_word",
            Rejection::NoValidAddress => "no_valid_address",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Signal(SignalRecord),
    Rejected(Rejection),
}

impl Extraction {
    pub fn into_record(self) -> Option<SignalRecord> {
        match self {
            Extraction::Signal(record) => Some(record),
            Extraction::Rejected(_) => None,
        }
    }
}

/// Stateless signal filter for a fixed set of subscribed channels.
#[derive(Debug, Clone)]
pub struct SignalExtractor {
    subscribed: HashSet<String>,
}

impl SignalExtractor {
    pub fn new<I, S>(subscribed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subscribed: subscribed.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_subscribed(&self, channel_id: &str) -> bool {
        self.subscribed.contains(channel_id)
    }

    /// Run the filters in order, stopping at the first rejection. At most one
    /// record is produced per message.
    pub fn evaluate(&self, candidate: &SignalCandidate) -> Extraction {
        if !self.is_subscribed(&candidate.channel_id) {
            return Extraction::Rejected(Rejection::UnsubscribedChannel);
        }
        if candidate.is_bot_author {
            return Extraction::Rejected(Rejection::BotAuthor);
        }
        if !patterns::has_signal_word(&candidate.raw_text) {
            return Extraction::Rejected(Rejection::NoSignalWord);
        }

        let found = ADDRESS_PATTERNS.iter().find_map(|pattern| {
            pattern
                .first_valid(&candidate.raw_text)
                .map(|address| (*pattern, address))
        });

        match found {
            Some((pattern, address)) => Extraction::Signal(SignalRecord {
                token_address: address.to_string(),
                source_channel_id: candidate.channel_id.clone(),
                message_id: candidate.message_id.clone(),
                author_id: candidate.author_id.clone(),
                detected_at: candidate.received_at,
                confidence: pattern.confidence(),
            }),
            None => Extraction::Rejected(Rejection::NoValidAddress),
        }
    }

    pub fn extract(&self, candidate: &SignalCandidate) -> Option<SignalRecord> {
        self.evaluate(candidate).into_record()
    }
}
