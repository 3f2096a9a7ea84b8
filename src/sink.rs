use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::config::TelegramConfig;
use crate::error::SinkError;
use crate::signal::SignalRecord;

/// Default number of undelivered signals kept before the oldest is dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Producer half of the signal queue. Pushing never waits: once the receiver
/// is `capacity` records behind, the oldest undelivered records are
/// overwritten, so a slow sink can never stall the gateway read loop.
///
/// The capacity is rounded up to the next power of two.
#[derive(Clone)]
pub struct SignalQueue {
    tx: broadcast::Sender<SignalRecord>,
}

/// Consumer half of the signal queue.
pub struct SignalReceiver {
    rx: broadcast::Receiver<SignalRecord>,
    dropped: u64,
}

impl SignalQueue {
    pub fn bounded(capacity: usize) -> (SignalQueue, SignalReceiver) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (SignalQueue { tx }, SignalReceiver { rx, dropped: 0 })
    }

    pub fn push(&self, record: SignalRecord) {
        if self.tx.send(record).is_err() {
            tracing::debug!("signal receiver gone, dropping signal");
        }
    }

    /// Records not yet taken by the receiver.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SignalReceiver {
    pub fn try_recv(&mut self) -> Option<SignalRecord> {
        loop {
            match self.rx.try_recv() {
                Ok(record) => return Some(record),
                Err(TryRecvError::Lagged(n)) => self.note_lag(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Next record in arrival order. Returns `None` once every producer is
    /// gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<SignalRecord> {
        loop {
            match self.rx.recv().await {
                Ok(record) => return Some(record),
                Err(RecvError::Lagged(n)) => self.note_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Number of records discarded because the queue overflowed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn note_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        tracing::warn!(
            skipped,
            total_dropped = self.dropped,
            "signal queue full, dropped oldest signals"
        );
    }
}

/// External consumer of extracted signals.
#[async_trait]
pub trait SignalSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, record: SignalRecord) -> Result<(), SinkError>;
}

/// Human-readable notification shared by the chat sinks.
pub fn notification_text(record: &SignalRecord) -> String {
    format!(
        "Signal detected\nToken: {}\nChannel: {}\nConfidence: {:?}",
        record.token_address, record.source_channel_id, record.confidence
    )
}

async fn check_status(resp: reqwest::Response) -> Result<(), SinkError> {
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(SinkError::Rejected { status, body });
    }
    Ok(())
}

/// Emits each signal as a structured log event.
pub struct LogSink;

#[async_trait]
impl SignalSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, record: SignalRecord) -> Result<(), SinkError> {
        tracing::info!(
            token_address = %record.token_address,
            channel_id = %record.source_channel_id,
            message_id = %record.message_id,
            author_id = %record.author_id,
            confidence = ?record.confidence,
            detected_at = %record.detected_at,
            "signal detected"
        );
        Ok(())
    }
}

/// Posts each signal to a Discord webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    fn body(record: &SignalRecord) -> serde_json::Value {
        json!({
            "content": notification_text(record),
            "signal": record,
        })
    }
}

#[async_trait]
impl SignalSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, record: SignalRecord) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&Self::body(&record))
            .send()
            .await?;
        check_status(resp).await
    }
}

/// Sends each signal to a Telegram chat through the Bot API `sendMessage`.
pub struct TelegramSink {
    client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(config: &TelegramConfig) -> Self {
        Self::with_api_base(config, TELEGRAM_API_BASE)
    }

    pub fn with_api_base(config: &TelegramConfig, api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!(
                "{}/bot{}/sendMessage",
                api_base.trim_end_matches('/'),
                config.bot_token
            ),
            chat_id: config.chat_id.clone(),
        }
    }
}

#[async_trait]
impl SignalSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, record: SignalRecord) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": notification_text(&record),
            }))
            .send()
            .await?;
        check_status(resp).await
    }
}

/// Delivers every signal to all inner sinks concurrently. One sink failing
/// does not stop the others; the first failure is returned.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn SignalSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn SignalSink>>) -> Self {
        Self { sinks }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl SignalSink for FanoutSink {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn deliver(&self, record: SignalRecord) -> Result<(), SinkError> {
        let results = join_all(self.sinks.iter().map(|sink| sink.deliver(record.clone()))).await;

        let mut first_err = None;
        for (sink, result) in self.sinks.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(sink = sink.name(), message_id = %record.message_id, "sink failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Drain the queue into `sink` in arrival order until every producer is gone.
/// Delivery failures are logged and do not stop forwarding.
pub async fn forward(mut receiver: SignalReceiver, sink: Arc<dyn SignalSink>) {
    while let Some(record) = receiver.recv().await {
        let message_id = record.message_id.clone();
        if let Err(e) = sink.deliver(record).await {
            tracing::warn!(sink = sink.name(), message_id = %message_id, "failed to deliver signal: {e}");
        }
    }
    tracing::debug!(dropped = receiver.dropped(), "signal queue closed, forwarder exiting");
}
