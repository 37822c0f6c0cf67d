use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::error::GatewayError;

/// Which change types a channel listens to. `All` is the `*` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Insert,
    Update,
    Delete,
}

impl EventFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventFilter::All => "*",
            EventFilter::Insert => "INSERT",
            EventFilter::Update => "UPDATE",
            EventFilter::Delete => "DELETE",
        }
    }

    /// Every filter accepts `Resync`, since the missed changes are unknown.
    pub fn accepts(&self, kind: ChangeEventKind) -> bool {
        match self {
            EventFilter::All => true,
            _ if kind == ChangeEventKind::Resync => true,
            EventFilter::Insert => kind == ChangeEventKind::Insert,
            EventFilter::Update => kind == ChangeEventKind::Update,
            EventFilter::Delete => kind == ChangeEventKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventKind {
    Insert,
    Update,
    Delete,
    /// Raised locally after a channel rejoined; changes during the gap may
    /// have been missed.
    #[serde(skip_deserializing)]
    Resync,
}

/// A row change pushed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeEventKind,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Value,
    pub commit_timestamp: Option<String>,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, kind: ChangeEventKind, record: Value) -> Self {
        Self {
            table: table.into(),
            kind,
            record,
            old_record: Value::Null,
            commit_timestamp: None,
        }
    }

    pub fn resync(table: impl Into<String>) -> Self {
        Self::new(table, ChangeEventKind::Resync, Value::Null)
    }
}

/// What a channel is scoped to.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub schema: String,
    pub table: String,
    pub event: EventFilter,
    pub access_token: Option<String>,
}

impl ChannelSpec {
    pub fn table(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: "public".to_string(),
            table: table.into(),
            event: EventFilter::All,
            access_token: None,
        }
    }

    pub fn with_event(mut self, event: EventFilter) -> Self {
        self.event = event;
        self
    }

    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    pub fn topic(&self) -> String {
        format!("realtime:{}", self.name)
    }

    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        self.table == event.table && self.event.accepts(event.kind)
    }
}

pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a channel handler.
pub fn change_handler<F, Fut>(f: F) -> ChangeHandler
where
    F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// Opaque handle to an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    pub id: Uuid,
    pub topic: String,
}

/// Push notifications for table changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a channel; `handler` runs once per matching change until
    /// unsubscribed. A channel that loses its connection keeps retrying and
    /// hands `handler` a `Resync` event once it is back.
    async fn subscribe(&self, spec: ChannelSpec, handler: ChangeHandler) -> Result<ChannelHandle, GatewayError>;

    /// Closes a channel. Closing an already-closed channel is a no-op.
    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<(), GatewayError>;
}

struct Registration {
    spec: ChannelSpec,
    handler: ChangeHandler,
}

/// In-process change feed. Writers call `publish`; every open channel whose
/// spec accepts the event has its handler awaited in turn.
#[derive(Clone, Default)]
pub struct BroadcastChangeFeed {
    channels: Arc<RwLock<HashMap<Uuid, Registration>>>,
}

impl BroadcastChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` and returns how many handlers ran.
    pub async fn publish(&self, event: ChangeEvent) -> usize {
        let handlers: Vec<ChangeHandler> = {
            let channels = self.channels.read().await;
            channels
                .values()
                .filter(|r| r.spec.accepts(&event))
                .map(|r| Arc::clone(&r.handler))
                .collect()
        };

        for handler in &handlers {
            handler(event.clone()).await;
        }

        debug!("Published {:?} on {} to {} channel(s)", event.kind, event.table, handlers.len());
        handlers.len()
    }

    pub async fn active_channels(&self) -> Vec<Uuid> {
        let channels = self.channels.read().await;
        channels.keys().cloned().collect()
    }
}

#[async_trait]
impl ChangeFeed for BroadcastChangeFeed {
    async fn subscribe(&self, spec: ChannelSpec, handler: ChangeHandler) -> Result<ChannelHandle, GatewayError> {
        let handle = ChannelHandle { id: Uuid::new_v4(), topic: spec.topic() };

        let mut channels = self.channels.write().await;
        channels.insert(handle.id, Registration { spec, handler });

        debug!("Opened in-process channel {} ({})", handle.topic, handle.id);
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<(), GatewayError> {
        let mut channels = self.channels.write().await;
        if channels.remove(&handle.id).is_some() {
            debug!("Closed in-process channel {} ({})", handle.topic, handle.id);
        }
        Ok(())
    }
}

/// Phoenix channel frame used by the Supabase realtime service.
#[derive(Debug, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn join(spec: &ChannelSpec, join_ref: &str) -> Self {
        let mut payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": spec.event.as_str(),
                    "schema": spec.schema,
                    "table": spec.table,
                }]
            }
        });
        if let Some(token) = &spec.access_token {
            payload["access_token"] = json!(token);
        }

        Self {
            topic: spec.topic(),
            event: "phx_join".to_string(),
            payload,
            msg_ref: Some(join_ref.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    pub fn leave(topic: &str, msg_ref: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: "phx_leave".to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref.to_string()),
            join_ref: None,
        }
    }

    pub fn heartbeat(msg_ref: &str) -> Self {
        Self {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref.to_string()),
            join_ref: None,
        }
    }

    fn to_frame(&self) -> Result<Message, GatewayError> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// Extracts a row change from a realtime text frame. Replies, heartbeats and
/// presence traffic yield `None`.
pub fn parse_change_message(text: &str) -> Option<ChangeEvent> {
    let message: PhoenixMessage = serde_json::from_str(text).ok()?;
    if message.event != "postgres_changes" {
        return None;
    }

    let data = message.payload.get("data")?;
    let kind: ChangeEventKind = serde_json::from_value(data.get("type")?.clone()).ok()?;
    let table = data.get("table")?.as_str()?.to_string();

    Some(ChangeEvent {
        table,
        kind,
        record: data.get("record").cloned().unwrap_or(Value::Null),
        old_record: data.get("old_record").cloned().unwrap_or(Value::Null),
        commit_timestamp: data
            .get("commit_timestamp")
            .and_then(|t| t.as_str())
            .map(str::to_string),
    })
}

type RealtimeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const JOIN_REF: &str = "1";
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Reads the status of a `phx_reply` payload. Anything but `ok` is a refusal.
pub fn join_reply_status(payload: &Value) -> Result<(), GatewayError> {
    match payload.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(()),
        status => {
            let reason = payload
                .pointer("/response/reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| payload.get("response").cloned().unwrap_or(Value::Null).to_string());
            Err(GatewayError::Realtime(format!(
                "Join refused with status {}: {}",
                status.unwrap_or("missing"),
                reason
            )))
        }
    }
}

/// Supabase realtime client. Each channel owns one websocket connection and a
/// task that forwards changes to its handler until the channel is closed,
/// reconnecting with exponential backoff whenever the connection drops.
#[derive(Clone)]
pub struct SupabaseRealtime {
    url: String,
    heartbeat: Duration,
    join_timeout: Duration,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    channels: Arc<Mutex<HashMap<Uuid, oneshot::Sender<()>>>>,
}

impl SupabaseRealtime {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            url: config.realtime_url(),
            heartbeat: Duration::from_secs(config.realtime_heartbeat_secs.max(1)),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            reconnect_initial: DEFAULT_RECONNECT_INITIAL,
            reconnect_max: DEFAULT_RECONNECT_MAX,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// First retry waits `initial`; each failed attempt doubles it up to `max`.
    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial = initial;
        self.reconnect_max = max.max(initial);
        self
    }

    pub async fn active_channels(&self) -> usize {
        self.channels.lock().await.len()
    }

    async fn connect_and_join(&self, spec: &ChannelSpec) -> Result<RealtimeSocket, GatewayError> {
        let topic = spec.topic();
        let (mut socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| GatewayError::Realtime(format!("Failed to connect: {}", e)))?;

        socket
            .send(PhoenixMessage::join(spec, JOIN_REF).to_frame()?)
            .await
            .map_err(|e| GatewayError::Realtime(format!("Failed to join {}: {}", topic, e)))?;

        let reply = tokio::time::timeout(self.join_timeout, await_join_reply(&mut socket, &topic)).await;
        match reply {
            Ok(Ok(())) => Ok(socket),
            Ok(Err(e)) => {
                let _ = socket.close(None).await;
                Err(e)
            }
            Err(_) => {
                let _ = socket.close(None).await;
                Err(GatewayError::Realtime(format!(
                    "No reply to join of {} within {:?}",
                    topic, self.join_timeout
                )))
            }
        }
    }

    /// Retries until a join succeeds. `None` when shut down while waiting.
    async fn rejoin(&self, spec: &ChannelSpec, shutdown: &mut oneshot::Receiver<()>) -> Option<RealtimeSocket> {
        let mut delay = self.reconnect_initial;
        let mut attempt: u32 = 1;
        loop {
            tokio::select! {
                _ = &mut *shutdown => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let joined = tokio::select! {
                _ = &mut *shutdown => return None,
                joined = self.connect_and_join(spec) => joined,
            };
            match joined {
                Ok(socket) => {
                    info!("Rejoined realtime channel after {} attempt(s)", attempt);
                    return Some(socket);
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    delay = (delay * 2).min(self.reconnect_max);
                    attempt += 1;
                }
            }
        }
    }

    #[instrument(skip_all, fields(topic = %spec.topic()))]
    async fn run_channel(
        self,
        mut socket: RealtimeSocket,
        spec: ChannelSpec,
        handler: ChangeHandler,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            match pump(socket, &spec, &handler, &mut shutdown, self.heartbeat).await {
                ChannelExit::Shutdown => break,
                ChannelExit::Lost(reason) => warn!("Realtime connection lost: {}", reason),
            }

            socket = match self.rejoin(&spec, &mut shutdown).await {
                Some(socket) => socket,
                None => break,
            };
            handler(ChangeEvent::resync(spec.table.clone())).await;
        }
        debug!("Realtime channel shut down");
    }
}

async fn await_join_reply(socket: &mut RealtimeSocket, topic: &str) -> Result<(), GatewayError> {
    while let Some(frame) = socket.next().await {
        let frame = frame.map_err(|e| GatewayError::Realtime(format!("Join of {} failed: {}", topic, e)))?;
        match frame {
            Message::Text(text) => {
                let Ok(message) = serde_json::from_str::<PhoenixMessage>(&text) else {
                    continue;
                };
                if message.topic == topic
                    && message.event == "phx_reply"
                    && message.msg_ref.as_deref() == Some(JOIN_REF)
                {
                    return join_reply_status(&message.payload);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(GatewayError::Realtime(format!("Connection closed before {} was joined", topic)))
}

enum ChannelExit {
    Shutdown,
    Lost(String),
}

async fn pump(
    socket: RealtimeSocket,
    spec: &ChannelSpec,
    handler: &ChangeHandler,
    shutdown: &mut oneshot::Receiver<()>,
    heartbeat: Duration,
) -> ChannelExit {
    let topic = spec.topic();
    let (mut sink, mut stream) = socket.split();
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    let mut next_ref: u64 = 2;

    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                let leave = PhoenixMessage::leave(&topic, &next_ref.to_string());
                if let Ok(frame) = leave.to_frame() {
                    let _ = sink.send(frame).await;
                }
                let _ = sink.close().await;
                return ChannelExit::Shutdown;
            }
            _ = ticker.tick() => {
                let beat = PhoenixMessage::heartbeat(&next_ref.to_string());
                next_ref += 1;
                let sent = match beat.to_frame() {
                    Ok(frame) => sink.send(frame).await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Err(e) = sent {
                    return ChannelExit::Lost(format!("heartbeat failed: {}", e));
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_change_message(&text) {
                        if spec.accepts(&event) {
                            handler(event).await;
                        }
                    } else if is_channel_failure(&text, &topic) {
                        return ChannelExit::Lost(format!("server dropped the channel: {}", text));
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return ChannelExit::Lost("closed by server".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Realtime connection failed: {}", e);
                    return ChannelExit::Lost(e.to_string());
                }
            }
        }
    }
}

fn is_channel_failure(text: &str, topic: &str) -> bool {
    serde_json::from_str::<PhoenixMessage>(text)
        .is_ok_and(|m| m.topic == topic && (m.event == "phx_error" || m.event == "phx_close"))
}

#[async_trait]
impl ChangeFeed for SupabaseRealtime {
    async fn subscribe(&self, spec: ChannelSpec, handler: ChangeHandler) -> Result<ChannelHandle, GatewayError> {
        let socket = self.connect_and_join(&spec).await?;

        let handle = ChannelHandle { id: Uuid::new_v4(), topic: spec.topic() };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.channels.lock().await.insert(handle.id, shutdown_tx);

        let realtime = self.clone();
        tokio::spawn(async move {
            realtime.run_channel(socket, spec, handler, shutdown_rx).await;
        });

        info!("Subscribed to realtime channel {}", handle.topic);
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<(), GatewayError> {
        let sender = self.channels.lock().await.remove(&handle.id);
        if let Some(sender) = sender {
            // The task may already have exited on its own.
            let _ = sender.send(());
            info!("Unsubscribed from realtime channel {}", handle.topic);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parses_postgres_change_frames() {
        let frame = r#"{
            "topic": "realtime:visits-queue",
            "event": "postgres_changes",
            "ref": null,
            "payload": {
                "ids": [1],
                "data": {
                    "type": "UPDATE",
                    "schema": "public",
                    "table": "visits",
                    "commit_timestamp": "2026-10-17T03:00:00Z",
                    "record": {"id": "v1", "status": "VitalSigns"},
                    "old_record": {"id": "v1"}
                }
            }
        }"#;

        let event = parse_change_message(frame).unwrap();
        assert_eq!(event.table, "visits");
        assert_eq!(event.kind, ChangeEventKind::Update);
        assert_eq!(event.record["status"], "VitalSigns");
        assert_eq!(event.commit_timestamp.as_deref(), Some("2026-10-17T03:00:00Z"));
    }

    #[test]
    fn ignores_replies_and_heartbeats() {
        let reply = r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"2"}"#;
        assert!(parse_change_message(reply).is_none());
        assert!(parse_change_message("not json").is_none());
    }

    #[test]
    fn join_reply_status_maps_refusals() {
        assert!(join_reply_status(&json!({"status": "ok", "response": {}})).is_ok());

        let refused = join_reply_status(&json!({"status": "error", "response": {"reason": "Invalid JWT"}}));
        assert!(matches!(refused, Err(GatewayError::Realtime(msg)) if msg.contains("Invalid JWT")));

        assert!(join_reply_status(&json!({})).is_err());
    }

    #[test]
    fn resync_passes_every_filter_and_never_comes_off_the_wire() {
        for filter in [EventFilter::All, EventFilter::Insert, EventFilter::Update, EventFilter::Delete] {
            assert!(filter.accepts(ChangeEventKind::Resync));
        }
        assert!(ChannelSpec::table("q", "visits")
            .with_event(EventFilter::Insert)
            .accepts(&ChangeEvent::resync("visits")));

        let forged = r#"{"topic":"realtime:q","event":"postgres_changes","ref":null,
            "payload":{"data":{"type":"RESYNC","table":"visits"}}}"#;
        assert!(parse_change_message(forged).is_none());
    }

    #[test]
    fn join_frame_carries_filter_and_token() {
        let spec = ChannelSpec::table("visits-queue", "visits")
            .with_access_token(Some("jwt".to_string()));
        let join = PhoenixMessage::join(&spec, "1");

        assert_eq!(join.topic, "realtime:visits-queue");
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.payload["config"]["postgres_changes"][0]["event"], "*");
        assert_eq!(join.payload["config"]["postgres_changes"][0]["table"], "visits");
        assert_eq!(join.payload["access_token"], "jwt");
    }

    #[tokio::test]
    async fn broadcast_feed_routes_by_table_and_event() {
        let feed = BroadcastChangeFeed::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let handle = feed
            .subscribe(
                ChannelSpec::table("inserts", "visits").with_event(EventFilter::Insert),
                change_handler(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        assert_eq!(feed.publish(ChangeEvent::new("visits", ChangeEventKind::Insert, json!({}))).await, 1);
        assert_eq!(feed.publish(ChangeEvent::new("visits", ChangeEventKind::Update, json!({}))).await, 0);
        assert_eq!(feed.publish(ChangeEvent::new("patients", ChangeEventKind::Insert, json!({}))).await, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        feed.unsubscribe(&handle).await.unwrap();
        feed.unsubscribe(&handle).await.unwrap();
        assert!(feed.active_channels().await.is_empty());
        assert_eq!(feed.publish(ChangeEvent::new("visits", ChangeEventKind::Insert, json!({}))).await, 0);
    }
}
