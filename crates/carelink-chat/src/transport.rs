//! Event-stream transport client.
//!
//! Owns the single logical connection to the chat backend: WebSocket first,
//! HTTP long-polling as fallback, keepalive pings, and the reconnect policy.
//! It decodes frames into [`TransportEvent`]s and knows nothing about
//! channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, SplitSink};
use futures_util::{SinkExt, StreamExt, future};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use carelink_common::config::{ChatConfig, TransportKind};

use crate::error::{ChatError, Result};
use crate::protocol::{self, Frame, Inbound, OutboundEvent, TransportEvent};

/// Seam between the coordinator and the connection.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Start (or restart) the connection in the background.
    async fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Send one event. Dropped silently while disconnected.
    fn emit_event(&self, event: OutboundEvent, payload: Value);

    /// Observer stream. Slow receivers lag and miss events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Lossless, ordered stream for the single consumer that applies events.
    /// A later call replaces the previous feed.
    fn feed(&self) -> mpsc::UnboundedReceiver<TransportEvent>;

    /// Close the connection for good. Idempotent.
    fn destroy(&self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Shared {
    local_user_id: String,
    connected: AtomicBool,
    destroyed: AtomicBool,
    common_token: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    feed: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    events: broadcast::Sender<TransportEvent>,
}

impl Shared {
    fn publish(&self, event: TransportEvent) {
        if let Some(feed) = self.feed.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            let _ = feed.send(event.clone());
        }
        let _ = self.events.send(event);
    }

    fn common_token(&self) -> Option<String> {
        self.common_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_common_token(&self, token: Option<String>) {
        *self.common_token.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn dispatch(&self, frame: Frame) {
        match protocol::decode(&frame, &self.local_user_id) {
            Ok(Inbound::Event(event)) => {
                trace!(event = %frame.event, "Transport: received");
                self.publish(event);
            }
            Ok(Inbound::SessionToken(token)) => {
                debug!("Transport: common token issued");
                self.set_common_token(token);
            }
            Ok(Inbound::Ignored) => trace!(event = %frame.event, "Transport: ignored"),
            Err(e) => warn!(event = %frame.event, error = %e, "Transport: undecodable frame"),
        }
    }
}

/// Event-stream client with transport fallback and auto-reconnect.
pub struct TransportClient {
    config: ChatConfig,
    shared: Arc<Shared>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl TransportClient {
    pub fn new(config: ChatConfig, local_user_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            config,
            shared: Arc::new(Shared {
                local_user_id: local_user_id.into(),
                connected: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                common_token: Mutex::new(None),
                outbound: Mutex::new(None),
                feed: Mutex::new(None),
                events,
            }),
            cancel: Mutex::new(None),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if let Some(token) = self.cancel.lock().unwrap_or_else(PoisonError::into_inner).take() {
            token.cancel();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.set_common_token(None);
        *self.shared.outbound.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[async_trait]
impl ChatTransport for TransportClient {
    async fn connect(&self) -> Result<()> {
        self.stop();
        self.shared.destroyed.store(false, Ordering::SeqCst);

        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());

        tokio::spawn(run(self.config.clone(), Arc::clone(&self.shared), rx, token));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn emit_event(&self, event: OutboundEvent, payload: Value) {
        if !self.is_connected() {
            debug!(event = event.name(), "Transport: not connected, dropping event");
            return;
        }
        let data = protocol::with_common_token(payload, self.shared.common_token().as_deref());
        let outbound = self.shared.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = outbound.as_ref() {
            trace!(event = event.name(), "Transport: emit");
            let _ = tx.send(Frame::new(event.name(), data));
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn feed(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.feed.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Transport: destroyed");
        self.stop();
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Connection loop ───────────────────────────────────────────────────────────

async fn run(
    config: ChatConfig,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) {
    let mut failures = 0u32;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = open_link(&config) => opened,
        };
        match opened {
            Ok(mut link) => {
                failures = 0;
                info!(transport = ?link.kind, "Transport: connected");
                shared.connected.store(true, Ordering::SeqCst);
                shared.publish(TransportEvent::Connected);

                let outcome = drive(&mut link, &config, &shared, &mut outbound, &cancel).await;

                shared.connected.store(false, Ordering::SeqCst);
                shared.set_common_token(None);
                while outbound.try_recv().is_ok() {}
                if cancel.is_cancelled() {
                    break;
                }
                match outcome {
                    Ok(()) => info!("Transport: connection closed by server"),
                    Err(e) => warn!(error = %e, "Transport: connection lost"),
                }
                shared.publish(TransportEvent::Disconnected);
                if !config.reconnection {
                    break;
                }
                // First reconnect after a drop is immediate.
            }
            Err(e) => {
                failures += 1;
                if !config.reconnection || failures >= config.reconnection_attempts {
                    warn!(attempt = failures, error = %e, "Transport: giving up");
                    shared.publish(TransportEvent::ReconnectFailed { attempts: failures });
                    break;
                }
                let delay = backoff_delay(&config, failures, rand::random::<f64>());
                warn!(attempt = failures, ?delay, error = %e, "Transport: connect failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    debug!("Transport: loop exited");
}

async fn drive(
    link: &mut Link,
    config: &ChatConfig,
    shared: &Shared,
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut ping = tokio::time::interval(config.ping_interval());
    ping.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                link.sink.close().await;
                return Ok(());
            }
            _ = ping.tick() => link.sink.ping().await?,
            Some(frame) = outbound.recv() => link.sink.send(&frame).await?,
            next = link.stream.next() => match next {
                None => return Ok(()),
                Some(Ok(frame)) => shared.dispatch(frame),
                Some(Err(ChatError::Json(e))) => warn!(error = %e, "Transport: malformed frame"),
                Some(Err(e)) => return Err(e),
            },
        }
    }
}

/// Reconnect delay for the `attempt`-th consecutive failure (1-based).
///
/// Exponential from the configured delay, spread by the randomization factor
/// using `sample` in `[0, 1)`, and clamped to the configured bounds.
pub fn backoff_delay(config: &ChatConfig, attempt: u32, sample: f64) -> Duration {
    let min = config.reconnection_delay().as_millis() as f64;
    let max = config.reconnection_delay_max().as_millis() as f64;
    let exponent = attempt.saturating_sub(1).min(16);
    let base = min * f64::from(1u32 << exponent);
    let spread = base * config.randomization_factor.clamp(0.0, 1.0);
    let jittered = base - spread + 2.0 * spread * sample.clamp(0.0, 1.0);
    Duration::from_millis(jittered.clamp(min, max) as u64)
}

// ── Links ─────────────────────────────────────────────────────────────────────

struct Link {
    kind: TransportKind,
    sink: FrameSink,
    stream: BoxStream<'static, Result<Frame>>,
}

enum FrameSink {
    WebSocket(SplitSink<WsStream, Message>),
    Polling { client: reqwest::Client, url: String },
}

impl FrameSink {
    async fn send(&mut self, frame: &Frame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        match self {
            Self::WebSocket(sink) => sink.send(Message::Text(text.into())).await?,
            Self::Polling { client, url } => {
                client
                    .post(url.as_str())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(text)
                    .send()
                    .await?
                    .error_for_status()?;
            }
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        if let Self::WebSocket(sink) = self {
            sink.send(Message::Ping(Vec::<u8>::new().into())).await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Self::WebSocket(sink) = self {
            let _ = sink.close().await;
        }
    }
}

async fn open_link(config: &ChatConfig) -> Result<Link> {
    let mut last_err = ChatError::Other("no transports configured".into());
    for kind in &config.transports {
        let opened = match kind {
            TransportKind::WebSocket => open_websocket(&config.url).await,
            TransportKind::Polling => open_polling(&config.url).await,
        };
        match opened {
            Ok(link) => return Ok(link),
            Err(e) => {
                debug!(transport = ?kind, error = %e, "Transport: handshake failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

async fn open_websocket(base: &str) -> Result<Link> {
    let url = endpoint(base, TransportKind::WebSocket)?;
    let (ws, _) = connect_async(url.as_str()).await?;
    let (sink, stream) = ws.split();

    let frames = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => {
                    Some(serde_json::from_str::<Frame>(text.as_str()).map_err(ChatError::from))
                }
                Ok(_) => None,
                Err(e) => Some(Err(ChatError::from(e))),
            }
        })
        .boxed();

    Ok(Link {
        kind: TransportKind::WebSocket,
        sink: FrameSink::WebSocket(sink),
        stream: frames,
    })
}

#[derive(Debug, Deserialize)]
struct PollHandshake {
    sid: String,
}

struct Poller {
    client: reqwest::Client,
    url: String,
}

impl Poller {
    async fn poll(&self) -> Result<Vec<Frame>> {
        let resp = self.client.get(self.url.as_str()).send().await?;
        Ok(resp.error_for_status()?.json::<Vec<Frame>>().await?)
    }
}

async fn open_polling(base: &str) -> Result<Link> {
    let url = endpoint(base, TransportKind::Polling)?;
    let root = url.as_str().trim_end_matches('/').to_owned();
    let client = reqwest::Client::new();

    let handshake: PollHandshake = client
        .get(format!("{root}/poll/handshake"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let session_url = format!("{root}/poll?sid={}", handshake.sid);

    let poller = Poller {
        client: client.clone(),
        url: session_url.clone(),
    };
    let frames = stream::unfold(Some(poller), |poller| async move {
        let poller = poller?;
        match poller.poll().await {
            Ok(batch) => {
                let items: Vec<Result<Frame>> = batch.into_iter().map(Ok).collect();
                Some((stream::iter(items), Some(poller)))
            }
            Err(e) => Some((stream::iter(vec![Err(e)]), None)),
        }
    })
    .flatten()
    .boxed();

    Ok(Link {
        kind: TransportKind::Polling,
        sink: FrameSink::Polling {
            client,
            url: session_url,
        },
        stream: frames,
    })
}

/// Rewrite the configured endpoint for the given transport.
fn endpoint(base: &str, kind: TransportKind) -> Result<Url> {
    let mut url =
        Url::parse(base).map_err(|e| ChatError::Other(format!("invalid chat url {base}: {e}")))?;
    let scheme = match (kind, url.scheme()) {
        (TransportKind::WebSocket, "ws" | "http") => "ws",
        (TransportKind::WebSocket, "wss" | "https") => "wss",
        (TransportKind::Polling, "ws" | "http") => "http",
        (TransportKind::Polling, "wss" | "https") => "https",
        (_, other) => return Err(ChatError::Other(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| ChatError::Other(format!("cannot use {scheme} for {base}")))?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn config() -> ChatConfig {
        ChatConfig::default()
    }

    #[test]
    fn test_backoff_stays_within_bounds() {
        let cfg = config();
        for attempt in 1..=12 {
            for sample in [0.0, 0.25, 0.5, 0.99] {
                let delay = backoff_delay(&cfg, attempt, sample);
                assert!(delay >= Duration::from_secs(1), "{delay:?}");
                assert!(delay <= Duration::from_secs(3), "{delay:?}");
            }
        }
        let no_jitter = ChatConfig {
            randomization_factor: 0.0,
            ..config()
        };
        assert_eq!(backoff_delay(&no_jitter, 1, 0.9), Duration::from_secs(1));
        assert_eq!(backoff_delay(&no_jitter, 2, 0.9), Duration::from_secs(2));
        assert_eq!(backoff_delay(&no_jitter, 5, 0.9), Duration::from_secs(3));
    }

    #[test]
    fn test_endpoint_scheme_rewrite() {
        let ws = endpoint("https://chat.example.com/socket", TransportKind::WebSocket).unwrap();
        assert_eq!(ws.as_str(), "wss://chat.example.com/socket");

        let poll = endpoint("ws://localhost:3300", TransportKind::Polling).unwrap();
        assert_eq!(poll.scheme(), "http");

        assert!(endpoint("ftp://localhost", TransportKind::WebSocket).is_err());
    }

    #[test]
    fn test_emit_dropped_while_disconnected() {
        let client = TransportClient::new(config(), "me");
        let (tx, mut rx) = mpsc::unbounded_channel();
        *client.shared.outbound.lock().unwrap() = Some(tx);

        client.emit_event(OutboundEvent::InitChannel, json!({ "userIdx": "me" }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_merges_common_token() {
        let client = TransportClient::new(config(), "me");
        let (tx, mut rx) = mpsc::unbounded_channel();
        *client.shared.outbound.lock().unwrap() = Some(tx);
        client.shared.connected.store(true, Ordering::SeqCst);

        client.shared.dispatch(Frame::new(
            protocol::names::INIT_DATA_COMPLETE,
            json!({ "commonToken": "ct-7" }),
        ));
        client.emit_event(OutboundEvent::JoinChannel, json!({ "channelIdx": "c-1" }));

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.event, "channel.join");
        assert_eq!(frame.data["commonToken"], "ct-7");
        assert_eq!(frame.data["channelIdx"], "c-1");
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let client = TransportClient::new(config(), "me");
        client.shared.connected.store(true, Ordering::SeqCst);
        client.destroy();
        client.destroy();
        assert!(client.is_destroyed());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_gives_up_after_configured_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cfg = ChatConfig {
            url: format!("ws://127.0.0.1:{port}"),
            transports: vec![TransportKind::WebSocket],
            reconnection_attempts: 2,
            reconnection_delay_ms: 10,
            reconnection_delay_max_ms: 20,
            ..config()
        };
        let client = TransportClient::new(cfg, "me");
        let mut events = client.subscribe();
        client.connect().await.unwrap();

        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(event, TransportEvent::ReconnectFailed { attempts: 2 });
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<Frame>();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let token = json!({ "event": "init.data.complete", "data": { "commonToken": "ct" } });
            ws.send(Message::Text(token.to_string().into())).await.unwrap();
            let join = json!({
                "event": "user.join",
                "data": {
                    "messageChannelIdx": "c-1",
                    "userIdx": "u-2",
                    "userList": ["u-2"],
                    "accessDate": "2026-03-01T10:00:00Z"
                }
            });
            ws.send(Message::Text(join.to_string().into())).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let frame: Frame = serde_json::from_str(text.as_str()).unwrap();
                    let _ = seen_tx.send(frame);
                    break;
                }
            }
        });

        let cfg = ChatConfig {
            url: format!("ws://127.0.0.1:{port}"),
            transports: vec![TransportKind::WebSocket],
            ..config()
        };
        let client = TransportClient::new(cfg, "me");
        let mut events = client.subscribe();
        client.connect().await.unwrap();

        let wait = Duration::from_secs(5);
        assert_eq!(timeout(wait, events.recv()).await.unwrap().unwrap(), TransportEvent::Connected);
        let joined = timeout(wait, events.recv()).await.unwrap().unwrap();
        assert!(matches!(joined, TransportEvent::UserJoin(ref c) if c.message_channel_idx == "c-1"));

        client.emit_event(OutboundEvent::InitChannel, json!({ "userIdx": "me" }));
        let frame = timeout(wait, seen_rx).await.unwrap().unwrap();
        assert_eq!(frame.event, "init.channel");
        assert_eq!(frame.data["commonToken"], "ct");

        client.destroy();
    }

    async fn next_event(events: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap()
    }

    async fn next_text_frame(ws: &mut WebSocketStream<TcpStream>) -> Frame {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
        panic!("socket closed before a text frame arrived");
    }

    fn join_frame() -> Value {
        json!({
            "event": "user.join",
            "data": {
                "messageChannelIdx": "c-1",
                "userIdx": "u-2",
                "userList": ["u-2"],
                "accessDate": "2026-03-01T10:00:00Z"
            }
        })
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drop_without_stale_token() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let token = json!({ "event": "init.data.complete", "data": { "commonToken": "ct" } });
            ws.send(Message::Text(token.to_string().into())).await.unwrap();
            ws.send(Message::Text(join_frame().to_string().into())).await.unwrap();
            let _ = seen_tx.send(next_text_frame(&mut ws).await);
            let _ = ws.close(None).await;
            drop(ws);

            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = seen_tx.send(next_text_frame(&mut ws).await);
            while ws.next().await.is_some() {}
        });

        let cfg = ChatConfig {
            url: format!("ws://127.0.0.1:{port}"),
            transports: vec![TransportKind::WebSocket],
            ..config()
        };
        let client = TransportClient::new(cfg, "me");
        let mut events = client.subscribe();
        client.connect().await.unwrap();

        assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
        assert!(matches!(next_event(&mut events).await, TransportEvent::UserJoin(_)));
        client.emit_event(OutboundEvent::InitChannel, json!({ "userIdx": "me" }));
        let wait = Duration::from_secs(5);
        let first = timeout(wait, seen_rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.data["commonToken"], "ct");

        assert_eq!(next_event(&mut events).await, TransportEvent::Disconnected);
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
        assert!(client.is_connected());

        client.emit_event(OutboundEvent::JoinChannel, json!({ "channelIdx": "c-1" }));
        let second = timeout(wait, seen_rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.event, "channel.join");
        assert!(second.data.get("commonToken").is_none());

        client.destroy();
    }

    struct PollServer {
        served: AtomicBool,
        seen: mpsc::UnboundedSender<Frame>,
    }

    async fn poll_handshake() -> axum::Json<Value> {
        axum::Json(json!({ "sid": "s-1" }))
    }

    async fn poll_frames(
        axum::extract::State(server): axum::extract::State<Arc<PollServer>>,
    ) -> axum::Json<Vec<Frame>> {
        if server.served.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            return axum::Json(Vec::new());
        }
        let join: Frame = serde_json::from_value(join_frame()).unwrap();
        axum::Json(vec![
            Frame::new(protocol::names::INIT_DATA_COMPLETE, json!({ "commonToken": "ct-p" })),
            join,
        ])
    }

    async fn poll_send(
        axum::extract::State(server): axum::extract::State<Arc<PollServer>>,
        axum::Json(frame): axum::Json<Frame>,
    ) -> axum::http::StatusCode {
        let _ = server.seen.send(frame);
        axum::http::StatusCode::OK
    }

    #[tokio::test]
    async fn test_falls_back_to_polling_when_websocket_is_refused() {
        use axum::routing::get;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Frame>();
        let server = Arc::new(PollServer {
            served: AtomicBool::new(false),
            seen: seen_tx,
        });
        let app = axum::Router::new()
            .route("/poll/handshake", get(poll_handshake))
            .route("/poll", get(poll_frames).post(poll_send))
            .with_state(server);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // No upgrade route: the WebSocket handshake gets a 404.
        let cfg = ChatConfig {
            url: format!("http://127.0.0.1:{port}"),
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            ..config()
        };
        let client = TransportClient::new(cfg, "me");
        let mut events = client.subscribe();
        client.connect().await.unwrap();

        assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
        let joined = next_event(&mut events).await;
        assert!(matches!(joined, TransportEvent::UserJoin(ref c) if c.user_idx.as_deref() == Some("u-2")));

        client.emit_event(OutboundEvent::InitChannel, json!({ "userIdx": "me" }));
        let frame = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap();
        assert_eq!(frame.event, "init.channel");
        assert_eq!(frame.data["userIdx"], "me");
        assert_eq!(frame.data["commonToken"], "ct-p");

        client.destroy();
    }

    #[test]
    fn test_feed_receives_every_published_event() {
        let client = TransportClient::new(ChatConfig { event_buffer: 1, ..config() }, "me");
        let mut feed = client.feed();
        for _ in 0..10 {
            client.shared.publish(TransportEvent::Disconnected);
        }
        let mut received = 0;
        while feed.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 10);
    }
}
