#![allow(dead_code)]

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use signalwatch::config::GatewayConfig;
use signalwatch::error::GatewayError;
use signalwatch::gateway::dispatcher::Dispatcher;
use signalwatch::gateway::events::LifecycleEvent;
use signalwatch::gateway::GatewaySession;
use signalwatch::signal::SignalExtractor;
use signalwatch::sink::{SignalQueue, SignalReceiver};

pub const ADDR: &str = "i9iE6yj9pEtkC3mHUpA16kKvHvhRkBobAsAKUm5vr53";
pub const CHANNEL: &str = "1111";

/// One thing the fake gateway does on a connection, in order.
#[derive(Debug, Clone)]
pub enum Step {
    Hello(u64),
    /// Read client frames until one with this opcode arrives.
    Expect(u8),
    Send(Value),
    SendRaw(String),
    Close(u16),
    /// Keep reading until the client goes away. Heartbeats are ACKed when
    /// `ack` is set.
    Hold { ack: bool },
}

#[derive(Debug, Clone)]
pub struct Received {
    pub conn: usize,
    pub frame: Value,
}

struct Inner {
    scripts: Vec<Vec<Step>>,
    connections: AtomicUsize,
    frames: Mutex<Vec<Received>>,
    queries: Mutex<Vec<Option<String>>>,
}

/// Scripted stand-in for the Discord gateway. Connection `n` plays
/// `scripts[n]`; the last script repeats for any further connections.
pub struct FakeGateway {
    pub url: String,
    inner: Arc<Inner>,
}

impl FakeGateway {
    pub async fn spawn(scripts: Vec<Vec<Step>>) -> Self {
        let inner = Arc::new(Inner {
            scripts,
            connections: AtomicUsize::new(0),
            frames: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(Arc::clone(&inner));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("ws://127.0.0.1:{}", addr.port()),
            inner,
        }
    }

    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<Received> {
        self.inner.frames.lock().unwrap().clone()
    }

    /// Client frames with the given opcode, in arrival order.
    pub fn frames_with_op(&self, op: u8) -> Vec<Received> {
        self.frames()
            .into_iter()
            .filter(|r| r.frame["op"] == op)
            .collect()
    }

    pub fn queries(&self) -> Vec<Option<String>> {
        self.inner.queries.lock().unwrap().clone()
    }

    /// Poll until `cond` holds, panicking after a few seconds.
    pub async fn wait_for(&self, what: &str, cond: impl Fn(&FakeGateway) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond(self) {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}; frames: {:?}", self.frames());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    RawQuery(query): RawQuery,
    State(inner): State<Arc<Inner>>,
) -> Response {
    inner.queries.lock().unwrap().push(query);
    ws.on_upgrade(move |socket| play(socket, inner))
}

async fn play(socket: WebSocket, inner: Arc<Inner>) {
    let conn = inner.connections.fetch_add(1, Ordering::SeqCst);
    let script = inner
        .scripts
        .get(conn)
        .or_else(|| inner.scripts.last())
        .cloned()
        .unwrap_or_default();
    let (mut tx, mut rx) = socket.split();

    for step in script {
        match step {
            Step::Hello(interval) => {
                let hello = json!({ "op": 10, "d": { "heartbeat_interval": interval } });
                if send(&mut tx, &hello).await.is_err() {
                    return;
                }
            }
            Step::Expect(op) => {
                if !read_until(&mut rx, &mut tx, &inner, conn, Some(op), true).await {
                    return;
                }
            }
            Step::Send(frame) => {
                if send(&mut tx, &frame).await.is_err() {
                    return;
                }
            }
            Step::SendRaw(text) => {
                if tx.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            Step::Close(code) => {
                let _ = tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: "".into(),
                    })))
                    .await;
                read_until(&mut rx, &mut tx, &inner, conn, None, false).await;
                return;
            }
            Step::Hold { ack } => {
                read_until(&mut rx, &mut tx, &inner, conn, None, ack).await;
                return;
            }
        }
    }
}

async fn send(tx: &mut SplitSink<WebSocket, Message>, frame: &Value) -> Result<(), axum::Error> {
    tx.send(Message::Text(frame.to_string().into())).await
}

/// Record client frames until `op` shows up (returns true) or the socket ends
/// (returns false).
async fn read_until(
    rx: &mut SplitStream<WebSocket>,
    tx: &mut SplitSink<WebSocket, Message>,
    inner: &Inner,
    conn: usize,
    op: Option<u8>,
    ack: bool,
) -> bool {
    while let Some(Ok(msg)) = rx.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return false,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        let received = frame["op"].as_u64();
        inner.frames.lock().unwrap().push(Received {
            conn,
            frame: frame.clone(),
        });
        if ack && received == Some(1) {
            let _ = send(tx, &json!({ "op": 11 })).await;
        }
        if op.is_some() && received == op.map(u64::from) {
            return true;
        }
    }
    false
}

pub fn dispatch(t: &str, seq: u64, d: Value) -> Value {
    json!({ "op": 0, "t": t, "s": seq, "d": d })
}

pub fn ready(seq: u64, session_id: &str) -> Value {
    dispatch(
        "READY",
        seq,
        json!({
            "v": 10,
            "session_id": session_id,
            "user": { "id": "900", "username": "watcher" }
        }),
    )
}

pub fn ready_with_resume_url(seq: u64, session_id: &str, resume_url: &str) -> Value {
    let mut frame = ready(seq, session_id);
    frame["d"]["resume_gateway_url"] = json!(resume_url);
    frame
}

pub fn resumed(seq: u64) -> Value {
    dispatch("RESUMED", seq, json!(null))
}

pub fn message(seq: u64, id: &str, channel: &str, content: &str, bot: bool) -> Value {
    dispatch(
        "MESSAGE_CREATE",
        seq,
        json!({
            "id": id,
            "channel_id": channel,
            "content": content,
            "timestamp": "2025-03-01T12:00:00.000000+00:00",
            "author": { "id": "42", "username": "caller", "bot": bot }
        }),
    )
}

/// Gateway settings tuned so failure paths resolve in milliseconds.
pub fn gateway_config(url: &str, token: &str) -> GatewayConfig {
    let mut config = GatewayConfig::new(token);
    config.url = url.to_string();
    config.handshake_timeout = Duration::from_secs(2);
    config.idle_timeout = Duration::from_secs(10);
    config.backoff_base = Duration::from_millis(10);
    config.backoff_max = Duration::from_millis(50);
    config
}

/// A session running on its own task.
pub struct Running {
    pub handle: JoinHandle<(Result<(), GatewayError>, GatewaySession)>,
    pub shutdown: CancellationToken,
    pub signals: SignalReceiver,
    pub lifecycle: broadcast::Receiver<LifecycleEvent>,
}

impl Running {
    pub fn start(config: GatewayConfig) -> Self {
        let (queue, signals) = SignalQueue::bounded(16);
        let dispatcher = Dispatcher::new(SignalExtractor::new([CHANNEL]), queue);
        let shutdown = CancellationToken::new();
        let mut session = GatewaySession::new(config, dispatcher, shutdown.clone());
        let lifecycle = session.lifecycle();
        let handle = tokio::spawn(async move {
            let result = session.run().await;
            (result, session)
        });
        Self {
            handle,
            shutdown,
            signals,
            lifecycle,
        }
    }

    /// Wait for `run` to return on its own.
    pub async fn finish(&mut self) -> (Result<(), GatewayError>, GatewaySession) {
        tokio::time::timeout(Duration::from_secs(10), &mut self.handle)
            .await
            .expect("session did not stop")
            .expect("session task panicked")
    }

    pub async fn stop(&mut self) -> (Result<(), GatewayError>, GatewaySession) {
        self.shutdown.cancel();
        self.finish().await
    }

    pub fn lifecycle_events(&mut self) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.lifecycle.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Running {
    /// Wait for a lifecycle event matching `pred`, skipping others.
    pub async fn wait_event(
        &mut self,
        what: &str,
        pred: impl Fn(&LifecycleEvent) -> bool,
    ) -> LifecycleEvent {
        let lifecycle = &mut self.lifecycle;
        let found = tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                match lifecycle.recv().await {
                    Ok(event) if pred(&event) => return Some(event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;
        match found {
            Ok(Some(event)) => event,
            _ => panic!("timed out waiting for {what}"),
        }
    }
}
