use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::broadcast;

use super::events::{event_type, DispatchEvent};
use crate::signal::{Extraction, SignalCandidate, SignalExtractor, SignalRecord};
use crate::sink::SignalQueue;

#[derive(Debug, Deserialize)]
struct MessageCreateData {
    id: String,
    channel_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    timestamp: Option<String>,
    author: MessageAuthor,
}

#[derive(Debug, Deserialize)]
struct MessageAuthor {
    id: String,
    #[serde(default)]
    bot: bool,
}

/// Decode a `MESSAGE_CREATE` payload. The message timestamp is used when it
/// parses, otherwise `fallback`.
pub fn decode_message_create(
    payload: &serde_json::Value,
    fallback: DateTime<Utc>,
) -> Option<SignalCandidate> {
    let data = MessageCreateData::deserialize(payload).ok()?;
    let received_at = data
        .timestamp
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(fallback);

    Some(SignalCandidate {
        message_id: data.id,
        channel_id: data.channel_id,
        author_id: data.author.id,
        is_bot_author: data.author.bot,
        raw_text: data.content,
        received_at,
    })
}

/// Routes dispatch events: messages go through the signal extractor into the
/// signal queue, everything else is broadcast to whoever subscribed.
pub struct Dispatcher {
    extractor: SignalExtractor,
    queue: SignalQueue,
    tx: broadcast::Sender<DispatchEvent>,
}

impl Dispatcher {
    pub fn new(extractor: SignalExtractor, queue: SignalQueue) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            extractor,
            queue,
            tx,
        }
    }

    /// Receive the dispatch events the dispatcher does not consume itself.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }

    /// Handle one dispatch event. Returns the signal it produced, if any,
    /// after it has been enqueued for the sink.
    pub fn dispatch(&self, event: DispatchEvent) -> Option<SignalRecord> {
        if event.event_type != event_type::MESSAGE_CREATE {
            // Unconsumed events are dropped when nobody is subscribed.
            let _ = self.tx.send(event);
            return None;
        }

        let Some(candidate) = decode_message_create(&event.payload, Utc::now()) else {
            tracing::warn!(seq = ?event.sequence, "undecodable MESSAGE_CREATE payload, skipping");
            return None;
        };

        match self.extractor.evaluate(&candidate) {
            Extraction::Signal(record) => {
                tracing::info!(
                    token_address = %record.token_address,
                    channel_id = %record.source_channel_id,
                    message_id = %record.message_id,
                    confidence = ?record.confidence,
                    "signal extracted"
                );
                self.queue.push(record.clone());
                Some(record)
            }
            Extraction::Rejected(reason) => {
                tracing::trace!(
                    message_id = %candidate.message_id,
                    channel_id = %candidate.channel_id,
                    reason = reason.as_str(),
                    "message rejected"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SignalReceiver;
    use serde_json::json;

    const ADDR: &str = "i9iE6yj9pEtkC3mHUpA16kKvHvhRkBobAsAKUm5vr53";

    fn dispatcher() -> (Dispatcher, SignalReceiver) {
        let (queue, rx) = SignalQueue::bounded(16);
        (Dispatcher::new(SignalExtractor::new(["100"]), queue), rx)
    }

    fn message(channel: &str, content: &str, bot: bool) -> DispatchEvent {
        DispatchEvent {
            sequence: Some(2),
            event_type: "MESSAGE_CREATE".into(),
            payload: json!({
                "id": "555",
                "channel_id": channel,
                "content": content,
                "timestamp": "2025-03-01T12:00:00.000000+00:00",
                "author": { "id": "42", "username": "alice", "bot": bot }
            }),
        }
    }

    #[test]
    fn test_decode_message_create() {
        let event = message("100", "hello", false);
        let c = decode_message_create(&event.payload, Utc::now()).unwrap();
        assert_eq!(c.message_id, "555");
        assert_eq!(c.channel_id, "100");
        assert_eq!(c.author_id, "42");
        assert!(!c.is_bot_author);
        assert_eq!(c.raw_text, "hello");
        assert_eq!(c.received_at.to_rfc3339(), "2025-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_decode_falls_back_on_bad_timestamp() {
        let fallback = Utc::now();
        let payload = json!({
            "id": "1", "channel_id": "2", "content": "x",
            "timestamp": "yesterday", "author": { "id": "3" }
        });
        let c = decode_message_create(&payload, fallback).unwrap();
        assert_eq!(c.received_at, fallback);
        assert!(!c.is_bot_author);
    }

    #[test]
    fn test_decode_rejects_missing_author() {
        let payload = json!({ "id": "1", "channel_id": "2", "content": "x" });
        assert!(decode_message_create(&payload, Utc::now()).is_none());
    }

    #[test]
    fn test_signal_is_enqueued() {
        let (d, mut rx) = dispatcher();
        let record = d.dispatch(message("100", &format!("CA: {ADDR}"), false)).unwrap();
        assert_eq!(record.token_address, ADDR);
        assert_eq!(rx.try_recv().unwrap(), record);
    }

    #[test]
    fn test_bot_and_foreign_channel_messages_ignored() {
        let (d, mut rx) = dispatcher();
        assert!(d.dispatch(message("100", &format!("CA: {ADDR}"), true)).is_none());
        assert!(d.dispatch(message("200", &format!("CA: {ADDR}"), false)).is_none());
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_other_events_are_broadcast() {
        let (d, mut rx) = dispatcher();
        let mut events = d.subscribe();
        let typing = DispatchEvent {
            sequence: Some(3),
            event_type: "TYPING_START".into(),
            payload: json!({ "channel_id": "100" }),
        };
        assert!(d.dispatch(typing.clone()).is_none());
        assert_eq!(events.try_recv().unwrap(), typing);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_unsubscribed_broadcast_is_dropped() {
        let (d, _rx) = dispatcher();
        let event = DispatchEvent {
            sequence: None,
            event_type: "GUILD_CREATE".into(),
            payload: json!({}),
        };
        assert!(d.dispatch(event).is_none());
    }
}
