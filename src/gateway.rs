//! Gateway (WebSocket) transport for the Discord API.
//!
//! Owns the connection lifecycle:
//!   - connect → HELLO → IDENTIFY or RESUME
//!   - background heartbeat task
//!   - sequence number and session tracking
//!   - reconnect with backoff
//!   - outbound send budget (120 events / 60s)
//!
//! Consumers only see a channel of [`GatewayEvent`]s.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::events::GatewayEvent;
use crate::types::GatewayPayload;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

const SEND_BUDGET_MAX: usize = 120;
const SEND_BUDGET_WINDOW: Duration = Duration::from_secs(60);

/// Consecutive failed connection attempts before the driver gives up.
const MAX_RECONNECT_ATTEMPTS: u32 = 8;

const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT
pub const DEFAULT_INTENTS: u32 = 1 | (1 << 9) | (1 << 15);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid gateway payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

// ---------------------------------------------------------------------------
// Send budget
// ---------------------------------------------------------------------------

/// Sliding-window limiter for outbound gateway frames.
#[derive(Debug)]
struct SendBudget {
    sent: Vec<Instant>,
    max: usize,
    window: Duration,
}

impl SendBudget {
    fn new(max: usize, window: Duration) -> Self {
        Self {
            sent: Vec::with_capacity(max),
            max,
            window,
        }
    }

    /// Time until another frame may go out, or `None` if one may go now.
    fn wait_time(&mut self, now: Instant) -> Option<Duration> {
        let window = self.window;
        self.sent.retain(|t| now.duration_since(*t) < window);
        if self.sent.len() < self.max {
            return None;
        }
        self.sent
            .iter()
            .min()
            .map(|oldest| (*oldest + window).saturating_duration_since(now))
    }

    fn record(&mut self, now: Instant) {
        self.sent.push(now);
    }
}

// ---------------------------------------------------------------------------
// Configuration and session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: u32,
}

#[derive(Debug, Clone, Default)]
struct Session {
    session_id: Option<String>,
    resume_gateway_url: Option<String>,
    sequence: Option<u64>,
}

impl Session {
    fn connect_url(&self) -> String {
        let base = self
            .resume_gateway_url
            .as_deref()
            .unwrap_or(DEFAULT_GATEWAY_URL);
        with_query(base)
    }
}

/// Make sure a gateway URL pins API v10 and JSON encoding.
fn with_query(url: &str) -> String {
    if url.contains("v=10") {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&v=10&encoding=json", url)
    } else {
        format!("{}?v=10&encoding=json", url)
    }
}

fn identify_payload(config: &GatewayConfig) -> Value {
    json!({
        "op": 2,
        "d": {
            "token": config.token,
            "intents": config.intents,
            "properties": {
                "os": std::env::consts::OS,
                "browser": env!("CARGO_PKG_NAME"),
                "device": env!("CARGO_PKG_NAME"),
            },
        }
    })
}

fn resume_payload(config: &GatewayConfig, session_id: &str, seq: u64) -> Value {
    json!({
        "op": 6,
        "d": {
            "token": config.token,
            "session_id": session_id,
            "seq": seq,
        }
    })
}

fn heartbeat_payload(seq: Option<u64>) -> Value {
    json!({ "op": 1, "d": seq })
}

// ---------------------------------------------------------------------------
// Disconnect handling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    Resume,
    Reidentify,
    Fatal,
    ConsumerGone,
}

/// What to do after the server closes the socket with `code`.
fn classify_close(code: u16) -> Disconnect {
    match code {
        // authentication failed, invalid shard, sharding required,
        // invalid API version, invalid intents, disallowed intents
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => Disconnect::Fatal,
        // invalid seq, session timed out
        4007 | 4009 => Disconnect::Reidentify,
        _ => Disconnect::Resume,
    }
}

/// Exponential backoff with ±25% jitter, capped at 60s.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1000u64 * 2u64.saturating_pow(attempt.min(6));
    let jittered = base_ms as f64 * (0.75 + rand::random::<f64>() * 0.5);
    Duration::from_millis(jittered.min(60_000.0) as u64)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// A running gateway connection.
pub struct GatewayHandle {
    /// Typed events, in the order Discord delivered them.
    pub events: async_channel::Receiver<GatewayEvent>,
    /// The background driver; finishes when the connection is given up.
    pub driver: JoinHandle<()>,
}

/// Spawn the gateway driver and return its event channel.
pub fn connect(config: GatewayConfig) -> GatewayHandle {
    let (event_tx, events) = async_channel::bounded(256);
    let driver = tokio::spawn(drive(config, event_tx));
    GatewayHandle { events, driver }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Write half of a live socket, shared with the heartbeat task.
struct Connection {
    write: Mutex<WsSink>,
    budget: Mutex<SendBudget>,
}

impl Connection {
    async fn send(&self, payload: &Value) -> Result<(), GatewayError> {
        loop {
            let wait = self.budget.lock().await.wait_time(Instant::now());
            match wait {
                Some(d) => {
                    debug!(delay_ms = d.as_millis() as u64, "gateway send budget exhausted");
                    tokio::time::sleep(d).await;
                }
                None => break,
            }
        }
        self.budget.lock().await.record(Instant::now());

        let text = serde_json::to_string(payload)?;
        self.write.lock().await.send(WsMessage::text(text)).await?;
        Ok(())
    }
}

async fn drive(config: GatewayConfig, event_tx: async_channel::Sender<GatewayEvent>) {
    let session = Arc::new(Mutex::new(Session::default()));
    let mut attempts: u32 = 0;

    loop {
        let url = session.lock().await.connect_url();
        let outcome = run_connection(&url, &config, &session, &event_tx).await;

        let disconnect = match outcome {
            Ok(disconnect) => {
                attempts = 0;
                disconnect
            }
            Err(e) => {
                error!(error = %e, url = %url, "gateway connection failed");
                Disconnect::Resume
            }
        };

        match disconnect {
            Disconnect::Resume => info!("will attempt RESUME"),
            Disconnect::Reidentify => {
                info!("session invalidated, will re-IDENTIFY");
                let mut s = session.lock().await;
                s.session_id = None;
                s.sequence = None;
            }
            Disconnect::Fatal => {
                error!("fatal gateway error, shutting down");
                return;
            }
            Disconnect::ConsumerGone => {
                info!("event channel closed, shutting down gateway driver");
                return;
            }
        }

        attempts += 1;
        if attempts > MAX_RECONNECT_ATTEMPTS {
            error!("exceeded max reconnect attempts, giving up");
            return;
        }
        let delay = backoff_delay(attempts);
        warn!(
            delay_ms = delay.as_millis() as u64,
            attempt = attempts,
            "reconnecting after backoff"
        );
        tokio::time::sleep(delay).await;
    }
}

/// One connection from handshake to disconnect.
async fn run_connection(
    url: &str,
    config: &GatewayConfig,
    session: &Arc<Mutex<Session>>,
    event_tx: &async_channel::Sender<GatewayEvent>,
) -> Result<Disconnect, GatewayError> {
    info!(url = %url, "connecting to Discord gateway");
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    let (write, mut read) = ws.split();
    let conn = Arc::new(Connection {
        write: Mutex::new(write),
        budget: Mutex::new(SendBudget::new(SEND_BUDGET_MAX, SEND_BUDGET_WINDOW)),
    });

    let interval = read_hello(&mut read).await?;
    info!(interval_ms = interval, "received HELLO");

    let handshake = {
        let s = session.lock().await;
        match (&s.session_id, s.sequence) {
            (Some(id), Some(seq)) => resume_payload(config, id, seq),
            _ => identify_payload(config),
        }
    };
    let resuming = handshake["op"] == 6;
    conn.send(&handshake).await?;
    info!(resuming, "sent handshake");

    let (stop_tx, stop_rx) = oneshot::channel();
    let heartbeat = tokio::spawn(heartbeat_loop(
        Arc::clone(&conn),
        Arc::clone(session),
        Duration::from_millis(interval),
        stop_rx,
    ));

    let disconnect = read_loop(&mut read, &conn, session, event_tx).await;

    let _ = stop_tx.send(());
    heartbeat.abort();
    let _ = conn.write.lock().await.send(WsMessage::Close(None)).await;

    Ok(disconnect)
}

async fn read_hello(read: &mut WsStream) -> Result<u64, GatewayError> {
    let msg = tokio::time::timeout(HELLO_TIMEOUT, read.next())
        .await
        .map_err(|_| GatewayError::Handshake("timed out waiting for HELLO".into()))?
        .ok_or_else(|| GatewayError::Handshake("stream ended before HELLO".into()))??;

    match msg {
        WsMessage::Text(text) => hello_interval(serde_json::from_str(text.as_str())?),
        other => Err(GatewayError::Handshake(format!(
            "expected text frame for HELLO, got {:?}",
            other
        ))),
    }
}

fn hello_interval(payload: GatewayPayload) -> Result<u64, GatewayError> {
    if payload.op != 10 {
        return Err(GatewayError::Handshake(format!(
            "expected op 10 (HELLO), got op {}",
            payload.op
        )));
    }
    payload
        .d
        .as_ref()
        .and_then(|d| d.get("heartbeat_interval"))
        .and_then(Value::as_u64)
        .ok_or_else(|| GatewayError::Handshake("HELLO missing heartbeat_interval".into()))
}

async fn heartbeat_loop(
    conn: Arc<Connection>,
    session: Arc<Mutex<Session>>,
    every: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    // First beat after `every * jitter`, jitter in [0, 1).
    let first = every.mul_f64(rand::random::<f64>());
    tokio::select! {
        _ = tokio::time::sleep(first) => {}
        _ = &mut stop => return,
    }

    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let seq = session.lock().await.sequence;
                if let Err(e) = conn.send(&heartbeat_payload(seq)).await {
                    warn!(error = %e, "heartbeat send failed, stopping heartbeat task");
                    return;
                }
                debug!(seq = ?seq, "sent heartbeat");
            }
            _ = &mut stop => {
                debug!("heartbeat task stopped");
                return;
            }
        }
    }
}

async fn read_loop(
    read: &mut WsStream,
    conn: &Connection,
    session: &Arc<Mutex<Session>>,
    event_tx: &async_channel::Sender<GatewayEvent>,
) -> Disconnect {
    while let Some(frame) = read.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "WebSocket read error");
                return Disconnect::Resume;
            }
        };

        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(close) => {
                let code = close.map(|c| u16::from(c.code));
                warn!(close_code = ?code, "WebSocket closed by server");
                return code.map(classify_close).unwrap_or(Disconnect::Resume);
            }
            _ => continue,
        };

        let payload: GatewayPayload = match serde_json::from_str(text.as_str()) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to parse gateway payload");
                continue;
            }
        };
        if let Some(seq) = payload.s {
            session.lock().await.sequence = Some(seq);
        }

        let event = GatewayEvent::from_payload(payload);
        match &event {
            GatewayEvent::Ready(ready) => {
                let mut s = session.lock().await;
                s.session_id = Some(ready.session_id.clone());
                s.resume_gateway_url = Some(ready.resume_gateway_url.clone());
                info!(session_id = %ready.session_id, user = %ready.user.tag(), "gateway READY");
            }
            GatewayEvent::HeartbeatRequest => {
                let seq = session.lock().await.sequence;
                if let Err(e) = conn.send(&heartbeat_payload(seq)).await {
                    warn!(error = %e, "failed to send requested heartbeat");
                }
                continue;
            }
            GatewayEvent::HeartbeatAck => debug!("heartbeat acknowledged"),
            GatewayEvent::Reconnect => {
                info!("gateway requested reconnect (op 7)");
                return Disconnect::Resume;
            }
            GatewayEvent::InvalidSession(resumable) => {
                warn!(resumable, "session invalidated (op 9)");
                tokio::time::sleep(Duration::from_secs(if *resumable { 2 } else { 3 })).await;
                return if *resumable {
                    Disconnect::Resume
                } else {
                    Disconnect::Reidentify
                };
            }
            _ => {}
        }

        if event_tx.send(event).await.is_err() {
            return Disconnect::ConsumerGone;
        }
    }

    info!("WebSocket stream ended");
    Disconnect::Resume
}
