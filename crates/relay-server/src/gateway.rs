//! WebSocket gateway.
//!
//! One socket per producer id. Inbound frames are validated transport
//! messages and go to the broker topic chosen by their action; relayed
//! messages come back through [`Gateway::send_message`].
//!
//! ```text
//! client ──ws──▶ read loop ──▶ produce(message | signal topic)
//! client ◀──ws── write loop ◀── outbound queue ◀── send_message
//!                    ▲
//!                    └── ping ticker
//! ```

use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use relay_broker::{BrokerError, RetryingProducer};
use relay_core::SessionRegistry;
use relay_protocol::{codec, Action, ProtocolError, TransportMessage, ValidationError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Frame exceeds the size limit.
    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),

    /// Frame is not a transport message.
    #[error("Undecodable frame: {0}")]
    Protocol(#[from] ProtocolError),

    /// A required field is missing.
    #[error("Invalid message: {0}")]
    Invalid(#[from] ValidationError),

    /// The broker rejected the message after retries.
    #[error("Publish failed: {0}")]
    Publish(#[from] BrokerError),
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub outbound_queue: usize,
    pub message_topic: String,
    pub signal_topic: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(6),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_connections: 100_000,
            max_message_size: 64 * 1024,
            outbound_queue: 256,
            message_topic: "messages".to_string(),
            signal_topic: "rtc-signal-topic".to_string(),
        }
    }
}

/// Live socket of one producer.
struct ClientHandle {
    /// Distinguishes a socket from the one that replaced it.
    conn_id: u64,
    tx: mpsc::Sender<Message>,
}

/// Connection table and routing.
pub struct Gateway {
    connections: DashMap<String, ClientHandle>,
    producer: Arc<RetryingProducer>,
    config: GatewayConfig,
    next_conn_id: AtomicU64,
    cancel: CancellationToken,
}

impl Gateway {
    /// Create a gateway publishing through `producer`.
    #[must_use]
    pub fn new(
        producer: Arc<RetryingProducer>,
        config: GatewayConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            producer,
            config,
            next_conn_id: AtomicU64::new(1),
            cancel,
        }
    }

    /// Number of connected producers.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_connected(&self, producer_id: &str) -> bool {
        self.connections.contains_key(producer_id)
    }

    /// Push `message` to the socket of `message.producer`.
    ///
    /// Returns `Ok(false)` without error if that producer is not connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded.
    pub async fn send_message(&self, message: &TransportMessage) -> Result<bool, GatewayError> {
        let Some(tx) = self
            .connections
            .get(&message.producer)
            .map(|client| client.tx.clone())
        else {
            debug!(producer = %message.producer, "Producer not connected, dropping message");
            return Ok(false);
        };

        let text = codec::encode(message)?;
        let len = text.len();
        match timeout(self.config.write_timeout, tx.send(Message::Text(text))).await {
            Ok(Ok(())) => {
                metrics::record_message(len, "outbound");
                Ok(true)
            }
            Ok(Err(_)) => {
                debug!(producer = %message.producer, "Connection closing, dropping message");
                Ok(false)
            }
            Err(_) => {
                warn!(producer = %message.producer, "Outbound queue full, dropping message");
                metrics::record_error("outbound_queue_full");
                Ok(false)
            }
        }
    }

    /// Validate an inbound frame and publish it to its topic.
    ///
    /// The raw text is published unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is invalid or publishing fails.
    pub async fn route(&self, text: &str) -> Result<&str, GatewayError> {
        if text.len() > self.config.max_message_size {
            return Err(GatewayError::TooLarge(text.len()));
        }

        let message = codec::decode_message(text.as_bytes())?;
        message.validate()?;

        let topic = match message.action {
            Action::Message => self.config.message_topic.as_str(),
            Action::Webrtc => self.config.signal_topic.as_str(),
        };
        let key = message.partition_key();

        if let Err(e) = self.producer.produce(topic, Some(&key), text).await {
            metrics::record_publish_failure(topic);
            return Err(e.into());
        }
        Ok(topic)
    }

    fn register(&self, producer_id: &str) -> (u64, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_queue.max(1));
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        // Dropping the previous sender ends the previous socket's writer.
        if self
            .connections
            .insert(producer_id.to_string(), ClientHandle { conn_id, tx })
            .is_some()
        {
            info!(producer = %producer_id, "Replacing existing connection");
        }
        (conn_id, rx)
    }

    fn unregister(&self, producer_id: &str, conn_id: u64) {
        self.connections
            .remove_if(producer_id, |_, client| client.conn_id == conn_id);
    }

    async fn read_loop(
        &self,
        mut stream: SplitStream<WebSocket>,
        producer_id: &str,
        cancel: &CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = timeout(self.config.read_timeout, stream.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    info!(producer = %producer_id, "Read deadline exceeded");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(producer = %producer_id, error = %e, "WebSocket error");
                    metrics::record_error("websocket");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => self.handle_text(producer_id, &text).await,
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => self.handle_text(producer_id, &text).await,
                    Err(_) => warn!(producer = %producer_id, "Dropping non-UTF-8 frame"),
                },
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => {
                    debug!(producer = %producer_id, "Received close frame");
                    break;
                }
            }
        }
    }

    async fn handle_text(&self, producer_id: &str, text: &str) {
        metrics::record_message(text.len(), "inbound");

        match self.route(text).await {
            Ok(topic) => debug!(producer = %producer_id, topic = %topic, "Frame routed"),
            Err(GatewayError::Publish(e)) => {
                error!(producer = %producer_id, error = %e, "Failed to publish frame");
            }
            Err(e) => {
                warn!(producer = %producer_id, error = %e, "Dropping invalid frame");
                metrics::record_error("invalid_frame");
            }
        }
    }
}

/// Drain the outbound queue and send pings until the connection ends.
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Message>,
    config: GatewayConfig,
    cancel: CancellationToken,
    producer_id: String,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let mut ping = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(message) => message,
                None => {
                    debug!(producer = %producer_id, "Connection replaced");
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match timeout(config.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(producer = %producer_id, error = %e, "Write failed, closing connection");
                break;
            }
            Err(_) => {
                warn!(producer = %producer_id, "Write timed out, closing connection");
                break;
            }
        }
    }

    let _ = timeout(config.write_timeout, sink.send(Message::Close(None))).await;
    cancel.cancel();
}

/// Shared server state.
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub registry: Arc<SessionRegistry>,
}

/// Build the HTTP router: `{ws_path}/:producer_id` and `/health`.
pub fn router(state: Arc<AppState>, ws_path: &str) -> Router {
    let ws_path = ws_path.trim_end_matches('/');
    Router::new()
        .route(&format!("{ws_path}/:producer_id"), get(ws_handler))
        .route(&format!("{ws_path}/"), get(missing_producer))
        .route(ws_path, get(missing_producer))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve `app` until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.gateway.connection_count(),
        "sessions": state.registry.len(),
    }))
}

async fn missing_producer() -> Response {
    (StatusCode::BAD_REQUEST, "Producer ID is required").into_response()
}

/// WebSocket upgrade handler.
async fn ws_handler(
    Path(producer_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let producer_id = producer_id.trim().to_string();
    if producer_id.is_empty() {
        return missing_producer().await;
    }

    let gateway = &state.gateway;
    if gateway.connection_count() >= gateway.config.max_connections
        && !gateway.is_connected(&producer_id)
    {
        warn!(producer = %producer_id, "Connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    // Frames over the configured limit are dropped by `route`; only frames
    // the codec could never accept fail the socket.
    ws.max_message_size(codec::MAX_MESSAGE_SIZE.max(gateway.config.max_message_size))
        .on_upgrade(move |socket| handle_websocket(socket, producer_id, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, producer_id: String, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let gateway = &state.gateway;

    let (conn_id, outbound) = gateway.register(&producer_id);
    let cancel = gateway.cancel.child_token();
    info!(producer = %producer_id, connection = conn_id, "WebSocket connected");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        gateway.config.clone(),
        cancel.clone(),
        producer_id.clone(),
    ));

    gateway.read_loop(stream, &producer_id, &cancel).await;

    cancel.cancel();
    if let Err(e) = writer.await {
        error!(producer = %producer_id, error = %e, "Writer task failed");
    }
    gateway.unregister(&producer_id, conn_id);

    info!(producer = %producer_id, connection = conn_id, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_broker::{MemoryBroker, ProducerConfig};
    use relay_protocol::{SignalingEnvelope, WebRtcOffer};
    use std::net::SocketAddr;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    struct Harness {
        addr: SocketAddr,
        state: Arc<AppState>,
        broker: MemoryBroker,
        cancel: CancellationToken,
    }

    impl Harness {
        async fn start(config: GatewayConfig) -> Self {
            let broker = MemoryBroker::new(2);
            let cancel = CancellationToken::new();
            let producer = Arc::new(RetryingProducer::new(
                Arc::new(broker.clone()),
                ProducerConfig {
                    max_attempts: 1,
                    retry_backoff: Duration::from_millis(1),
                },
            ));
            let gateway = Arc::new(Gateway::new(producer, config, cancel.clone()));
            let state = Arc::new(AppState {
                gateway,
                registry: Arc::new(SessionRegistry::new()),
            });

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(serve(listener, router(state.clone(), "/ws"), cancel.clone()));

            Self {
                addr,
                state,
                broker,
                cancel,
            }
        }

        async fn connect(&self, producer_id: &str) -> Client {
            let (client, _) = connect_async(format!("ws://{}/ws/{producer_id}", self.addr))
                .await
                .unwrap();
            wait_until(|| self.state.gateway.is_connected(producer_id)).await;
            client
        }

        fn gateway(&self) -> &Gateway {
            &self.state.gateway
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            let frame = timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return text;
            }
        }
    }

    fn chat(producer: &str) -> TransportMessage {
        TransportMessage::new(producer, "room-1", Action::Message, "hello")
    }

    fn offer(producer: &str) -> TransportMessage {
        let envelope = SignalingEnvelope::Offer(WebRtcOffer {
            sdp: "v=0".into(),
            player_id: producer.into(),
            game_id: "g1".into(),
            session_id: "s1".into(),
        });
        TransportMessage::signal(producer, "g1", &envelope).unwrap()
    }

    #[tokio::test]
    async fn test_frames_routed_by_action() {
        let harness = Harness::start(GatewayConfig::default()).await;
        let mut client = harness.connect("p1").await;

        let chat_text = codec::encode(&chat("p1")).unwrap();
        let offer_text = codec::encode(&offer("p1")).unwrap();
        client.send(WsMessage::Text(chat_text.clone())).await.unwrap();
        client.send(WsMessage::Text(offer_text.clone())).await.unwrap();

        wait_until(|| harness.broker.records("rtc-signal-topic").len() == 1).await;
        let messages = harness.broker.records("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].value, chat_text.as_bytes());
        assert_eq!(messages[0].key.as_deref(), Some("room-1"));

        let signals = harness.broker.records("rtc-signal-topic");
        assert_eq!(signals[0].value, offer_text.as_bytes());
        assert_eq!(signals[0].key.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_invalid_frames_dropped_connection_kept() {
        let harness = Harness::start(GatewayConfig::default()).await;
        let mut client = harness.connect("p1").await;

        client.send(WsMessage::Text("garbage".into())).await.unwrap();
        let mut missing_group = chat("p1");
        missing_group.group.clear();
        client
            .send(WsMessage::Text(codec::encode(&missing_group).unwrap()))
            .await
            .unwrap();
        client
            .send(WsMessage::Text(codec::encode(&chat("p1")).unwrap()))
            .await
            .unwrap();

        wait_until(|| !harness.broker.records("messages").is_empty()).await;
        assert_eq!(harness.broker.records("messages").len(), 1);
        assert!(harness.gateway().is_connected("p1"));
    }

    #[tokio::test]
    async fn test_oversized_frame_dropped_connection_kept() {
        let config = GatewayConfig {
            max_message_size: 256,
            ..GatewayConfig::default()
        };
        let harness = Harness::start(config).await;
        let mut client = harness.connect("p1").await;

        let oversized = TransportMessage::new("p1", "room-1", Action::Message, "x".repeat(1024));
        client
            .send(WsMessage::Text(codec::encode(&oversized).unwrap()))
            .await
            .unwrap();
        let valid = codec::encode(&chat("p1")).unwrap();
        client.send(WsMessage::Text(valid.clone())).await.unwrap();

        wait_until(|| !harness.broker.records("messages").is_empty()).await;
        let messages = harness.broker.records("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].value, valid.as_bytes());
        assert!(harness.gateway().is_connected("p1"));
    }

    #[tokio::test]
    async fn test_frame_without_action_not_routed() {
        let harness = Harness::start(GatewayConfig::default()).await;

        let raw = r#"{"pid":"1","producer":"p1","payload":"hi","group":"room-1"}"#;
        assert!(matches!(
            harness.gateway().route(raw).await,
            Err(GatewayError::Protocol(_))
        ));
        assert!(harness.broker.records("messages").is_empty());
        assert!(harness.broker.records("rtc-signal-topic").is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_reported() {
        let harness = Harness::start(GatewayConfig::default()).await;
        harness.broker.close();

        let text = codec::encode(&chat("p1")).unwrap();
        assert!(matches!(
            harness.gateway().route(&text).await,
            Err(GatewayError::Publish(_))
        ));
    }

    #[tokio::test]
    async fn test_send_message_reaches_socket() {
        let harness = Harness::start(GatewayConfig::default()).await;
        let mut client = harness.connect("p1").await;

        let message = offer("p1");
        assert!(harness.gateway().send_message(&message).await.unwrap());

        let received = codec::decode_message(next_text(&mut client).await.as_bytes()).unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_send_message_to_absent_producer_is_noop() {
        let harness = Harness::start(GatewayConfig::default()).await;
        assert!(!harness.gateway().send_message(&chat("nobody")).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_socket_replaces_first() {
        let harness = Harness::start(GatewayConfig::default()).await;
        let mut first = harness.connect("p1").await;
        let mut second = harness.connect("p1").await;

        let ended = timeout(Duration::from_secs(2), async {
            loop {
                match first.next().await {
                    Some(Ok(WsMessage::Text(_))) => return false,
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return true,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await
        .unwrap();
        assert!(ended);

        assert_eq!(harness.gateway().connection_count(), 1);
        assert!(harness.gateway().send_message(&chat("p1")).await.unwrap());
        let received = codec::decode_message(next_text(&mut second).await.as_bytes()).unwrap();
        assert_eq!(received.producer, "p1");
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let harness = Harness::start(GatewayConfig::default()).await;
        let mut client = harness.connect("p1").await;

        client.close(None).await.unwrap();
        wait_until(|| !harness.gateway().is_connected("p1")).await;
        assert!(!harness.gateway().send_message(&chat("p1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_server_sends_pings() {
        let config = GatewayConfig {
            ping_interval: Duration::from_millis(50),
            ..GatewayConfig::default()
        };
        let harness = Harness::start(config).await;
        let mut client = harness.connect("p1").await;

        let frame = timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(frame, WsMessage::Ping(_)));
    }

    /// A sink whose writes always fail.
    struct BrokenSink {
        pings: Arc<AtomicU64>,
    }

    impl Sink<Message> for BrokenSink {
        type Error = std::io::Error;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn start_send(self: std::pin::Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            if matches!(item, Message::Ping(_)) {
                self.pings.fetch_add(1, Ordering::SeqCst);
            }
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_failed_ping_write_tears_connection_down() {
        let config = GatewayConfig {
            ping_interval: Duration::from_millis(20),
            ..GatewayConfig::default()
        };
        let pings = Arc::new(AtomicU64::new(0));
        let (_tx, outbound) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        timeout(
            Duration::from_secs(2),
            write_loop(
                BrokenSink {
                    pings: pings.clone(),
                },
                outbound,
                config,
                cancel.clone(),
                "p1".to_string(),
            ),
        )
        .await
        .expect("writer kept running after a failed ping");

        assert_eq!(pings.load(Ordering::SeqCst), 1);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_closes_live_sockets() {
        let harness = Harness::start(GatewayConfig::default()).await;
        let mut first = harness.connect("p1").await;
        let mut second = harness.connect("p2").await;

        harness.cancel.cancel();

        for client in [&mut first, &mut second] {
            let ended = timeout(Duration::from_secs(2), async {
                loop {
                    match client.next().await {
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
                        Some(Ok(_)) => {}
                    }
                }
            })
            .await;
            assert!(ended.is_ok(), "socket still open after shutdown");
        }
        wait_until(|| harness.gateway().connection_count() == 0).await;
    }

    #[tokio::test]
    async fn test_idle_connection_closed_after_read_timeout() {
        let config = GatewayConfig {
            read_timeout: Duration::from_millis(100),
            ..GatewayConfig::default()
        };
        let harness = Harness::start(config).await;
        let _client = harness.connect("p1").await;

        wait_until(|| harness.gateway().connection_count() == 0).await;
    }

    #[tokio::test]
    async fn test_missing_producer_rejected() {
        let harness = Harness::start(GatewayConfig::default()).await;

        let err = connect_async(format!("ws://{}/ws/", harness.addr))
            .await
            .unwrap_err();
        match err {
            tungstenite::Error::Http(response) => assert_eq!(response.status(), 400),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = GatewayConfig {
            max_connections: 1,
            ..GatewayConfig::default()
        };
        let harness = Harness::start(config).await;
        let _client = harness.connect("p1").await;

        let err = connect_async(format!("ws://{}/ws/p2", harness.addr))
            .await
            .unwrap_err();
        assert!(matches!(err, tungstenite::Error::Http(response) if response.status() == 503));
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let harness = Harness::start(GatewayConfig::default()).await;
        let _client = harness.connect("p1").await;

        let Json(body) = health_handler(State(harness.state.clone())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 1);
        assert_eq!(body["sessions"], 0);
    }
}
