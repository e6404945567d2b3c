//! SignalR hub client over WebSocket
//!
//! Negotiates a connection token over HTTP, opens the WebSocket, performs the
//! JSON protocol handshake and then runs one supervisor task per started
//! connection. The supervisor owns the socket: it writes queued frames,
//! sends keep-alive pings, dispatches server invocations to the registered
//! handlers and resolves pending invocations from completions. When the
//! socket drops it walks the reconnect policy before giving up.

use super::protocol::{self, HubMessage, NegotiateResponse};
use super::reconnect::{ConnectRetry, ReconnectPolicy};
use crate::config::SignalingConfig;
use crate::domain::shared::{DomainError, ParticipantId, Result};
use crate::domain::signaling::{ConnectionState, OutboundCall, SignalingChannel};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Url;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type InvocationHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(Option<String>) + Send + Sync>;
type ReconnectedCallback = Arc<dyn Fn(Option<ParticipantId>) + Send + Sync>;
type FrameErrorCallback = Arc<dyn Fn(&DomainError) + Send + Sync>;
type PendingInvocation = oneshot::Sender<Result<Option<Value>>>;

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub reconnect: ReconnectPolicy,
    pub connect_retry: ConnectRetry,
    pub invoke_timeout: Duration,
    pub keep_alive: Duration,
    pub server_timeout: Duration,
    pub skip_negotiation: bool,
}

impl HubOptions {
    pub fn from_config(config: &SignalingConfig) -> Self {
        Self {
            reconnect: ReconnectPolicy::from_millis(&config.reconnect_delays_ms),
            connect_retry: ConnectRetry::new(
                Duration::from_millis(config.connect_retry_ms),
                config.connect_max_attempts,
            ),
            invoke_timeout: Duration::from_millis(config.invoke_timeout_ms),
            keep_alive: Duration::from_millis(config.keep_alive_ms),
            server_timeout: Duration::from_millis(config.server_timeout_ms),
            skip_negotiation: config.skip_negotiation,
        }
    }
}

impl Default for HubOptions {
    fn default() -> Self {
        Self::from_config(&SignalingConfig::default())
    }
}

/// Client side of a SignalR hub connection. Cheap to clone.
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    options: HubOptions,
    http: reqwest::Client,
    state: Mutex<ConnectionState>,
    connection_id: Mutex<Option<ParticipantId>>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<String, PendingInvocation>>,
    next_invocation: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<InvocationHandler>>>,
    reconnecting: Mutex<Vec<ErrorCallback>>,
    reconnected: Mutex<Vec<ReconnectedCallback>>,
    closed: Mutex<Vec<ErrorCallback>>,
    frame_errors: Mutex<Vec<FrameErrorCallback>>,
    stop_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// One live socket, handshake done
struct Session {
    stream: WsStream,
    outgoing: mpsc::UnboundedReceiver<String>,
    backlog: Vec<HubMessage>,
    connection_id: Option<ParticipantId>,
}

enum SessionEnd {
    Stopped,
    Lost {
        error: Option<String>,
        reconnect: bool,
    },
}

impl HubConnection {
    pub fn new(url: &str, options: HubOptions) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| DomainError::Config(format!("invalid hub url '{}': {}", url, e)))?;
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                options,
                http: reqwest::Client::new(),
                state: Mutex::new(ConnectionState::Disconnected),
                connection_id: Mutex::new(None),
                writer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_invocation: AtomicU64::new(0),
                handlers: Mutex::new(HashMap::new()),
                reconnecting: Mutex::new(Vec::new()),
                reconnected: Mutex::new(Vec::new()),
                closed: Mutex::new(Vec::new()),
                frame_errors: Mutex::new(Vec::new()),
                stop_tx,
                supervisor: Mutex::new(None),
            }),
        })
    }

    /// Register a handler for a server-to-client invocation
    pub fn on(&self, target: &str, handler: impl Fn(&[Value]) + Send + Sync + 'static) {
        self.inner
            .handlers
            .lock()
            .entry(target.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn on_reconnecting(&self, callback: impl Fn(Option<String>) + Send + Sync + 'static) {
        self.inner.reconnecting.lock().push(Arc::new(callback));
    }

    pub fn on_reconnected(&self, callback: impl Fn(Option<ParticipantId>) + Send + Sync + 'static) {
        self.inner.reconnected.lock().push(Arc::new(callback));
    }

    /// Fires once the connection is gone for good, with the last error
    pub fn on_close(&self, callback: impl Fn(Option<String>) + Send + Sync + 'static) {
        self.inner.closed.lock().push(Arc::new(callback));
    }

    /// Called for every inbound frame that cannot be decoded
    pub fn on_frame_error(&self, callback: impl Fn(&DomainError) + Send + Sync + 'static) {
        self.inner.frame_errors.lock().push(Arc::new(callback));
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn connection_id(&self) -> Option<ParticipantId> {
        self.inner.connection_id.lock().clone()
    }

    /// Open the connection once
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(DomainError::Signaling(format!(
                    "cannot start a connection that is {}",
                    *state
                )));
            }
            *state = ConnectionState::Connecting;
        }
        self.inner.stop_tx.send_replace(false);

        match self.inner.open().await {
            Ok(session) => {
                self.inner.set_state(ConnectionState::Connected);
                info!(
                    "Connected to hub {} as {}",
                    self.inner.url,
                    session
                        .connection_id
                        .as_ref()
                        .map(|id| id.as_str())
                        .unwrap_or("<unassigned>")
                );
                let handle = tokio::spawn(supervise(self.inner.clone(), session));
                *self.inner.supervisor.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Start, retrying on failure until connected, stopped, or out of
    /// attempts
    pub async fn connect_with_retry(&self) -> Result<()> {
        let retry = self.inner.options.connect_retry.clone();
        let mut stop = self.inner.stop_tx.subscribe();
        let mut attempts = 0u32;

        loop {
            match self.start().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    if !retry.should_retry(attempts) {
                        error!("Giving up on hub connection after {} attempts: {}", attempts, e);
                        return Err(e);
                    }
                    let delay = retry.delay();
                    warn!("Hub connection failed ({}), retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stopped(&mut stop) => return Err(DomainError::SignalingClosed),
                    }
                }
            }
        }
    }

    /// Close the connection without reconnecting
    pub async fn stop(&self) {
        let handle = self.inner.supervisor.lock().take();
        self.inner.stop_tx.send_replace(true);
        if let Some(handle) = handle {
            self.inner.set_state(ConnectionState::Disconnecting);
            if let Err(e) = handle.await {
                warn!("Hub supervisor ended abnormally: {}", e);
            }
        }
    }

    /// Invoke a hub method and wait for its completion
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Option<Value>> {
        let writer = self.writer(target)?;
        let id = self
            .inner
            .next_invocation
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        let frame = HubMessage::invocation(Some(id.clone()), target, arguments).encode()?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), tx);
        if writer.send(frame).is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(DomainError::SignalingClosed);
        }

        match tokio::time::timeout(self.inner.options.invoke_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DomainError::SignalingClosed),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(DomainError::Signaling(format!(
                    "invocation of {} timed out",
                    target
                )))
            }
        }
    }

    /// Invoke a hub method without waiting for a result
    pub fn send(&self, target: &str, arguments: Vec<Value>) -> Result<()> {
        let writer = self.writer(target)?;
        let frame = HubMessage::invocation(None, target, arguments).encode()?;
        writer.send(frame).map_err(|_| DomainError::SignalingClosed)
    }

    fn writer(&self, target: &str) -> Result<mpsc::UnboundedSender<String>> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(DomainError::Signaling(format!(
                "cannot invoke {} while {}",
                target, state
            )));
        }
        self.inner
            .writer
            .lock()
            .clone()
            .ok_or(DomainError::SignalingClosed)
    }
}

#[async_trait]
impl SignalingChannel for HubConnection {
    async fn invoke(&self, call: OutboundCall) -> Result<()> {
        debug!("Invoking {}", call.procedure());
        HubConnection::invoke(self, call.procedure(), call.arguments())
            .await
            .map(|_| ())
    }

    fn connection_id(&self) -> Option<ParticipantId> {
        HubConnection::connection_id(self)
    }

    fn state(&self) -> ConnectionState {
        HubConnection::state(self)
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Negotiate, connect and handshake
    async fn open(&self) -> Result<Session> {
        let (ws_url, connection_id) = if self.options.skip_negotiation {
            (websocket_url(&self.url, None)?, None)
        } else {
            let negotiated = self.negotiate().await?;
            let ws_url = websocket_url(&self.url, negotiated.token())?;
            (ws_url, negotiated.connection_id.map(ParticipantId::new))
        };

        let (mut stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| DomainError::Signaling(format!("websocket connect failed: {}", e)))?;
        debug!("Hub websocket connected to {}", ws_url);

        stream
            .send(Message::Text(protocol::handshake_request()))
            .await
            .map_err(|e| DomainError::Signaling(format!("handshake send failed: {}", e)))?;
        let backlog = tokio::time::timeout(self.options.server_timeout, read_handshake(&mut stream))
            .await
            .map_err(|_| DomainError::Signaling("handshake timed out".to_string()))??;

        let (tx, outgoing) = mpsc::unbounded_channel();
        *self.writer.lock() = Some(tx);
        *self.connection_id.lock() = connection_id.clone();

        Ok(Session {
            stream,
            outgoing,
            backlog,
            connection_id,
        })
    }

    async fn negotiate(&self) -> Result<NegotiateResponse> {
        let url = negotiate_url(&self.url);
        let response: NegotiateResponse = self
            .http
            .post(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DomainError::Signaling(format!("negotiate failed: {}", e)))?
            .json()
            .await
            .map_err(|e| DomainError::Signaling(format!("malformed negotiate response: {}", e)))?;

        if let Some(error) = response.error {
            return Err(DomainError::Signaling(format!("negotiate rejected: {}", error)));
        }
        if response.url.is_some() {
            return Err(DomainError::Signaling(
                "negotiate redirects are not supported".to_string(),
            ));
        }
        Ok(response)
    }

    /// Returns how the session ends if the message ends it
    fn handle_message(&self, message: HubMessage) -> Option<SessionEnd> {
        match message {
            HubMessage::Invocation {
                target, arguments, ..
            } => {
                let handlers = self.handlers.lock().get(&target).cloned();
                match handlers {
                    Some(handlers) => {
                        for handler in handlers {
                            handler(&arguments);
                        }
                    }
                    None => warn!("No handler registered for hub method '{}'", target),
                }
                None
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let pending = self.pending.lock().remove(&invocation_id);
                match pending {
                    Some(tx) => {
                        let outcome = match error {
                            Some(e) => Err(DomainError::Signaling(e)),
                            None => Ok(result),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => debug!("Completion for unknown invocation {}", invocation_id),
                }
                None
            }
            HubMessage::Ping => None,
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                info!("Server closed the hub connection: {:?}", error);
                Some(SessionEnd::Lost {
                    error,
                    reconnect: allow_reconnect,
                })
            }
            HubMessage::Other(kind) => {
                debug!("Ignoring hub message type {}", kind);
                None
            }
        }
    }

    fn fail_pending(&self) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(DomainError::SignalingClosed));
        }
    }

    /// Terminal close: no more reconnect attempts
    fn finish(&self, error: Option<String>) {
        self.set_state(ConnectionState::Disconnected);
        *self.connection_id.lock() = None;
        match &error {
            Some(e) => warn!("Hub connection closed: {}", e),
            None => info!("Hub connection closed"),
        }
        let callbacks = self.closed.lock().clone();
        for callback in callbacks {
            callback(error.clone());
        }
    }
}

async fn supervise(inner: Arc<Inner>, mut session: Session) {
    let mut stop = inner.stop_tx.subscribe();

    loop {
        let end = run_session(&inner, session, &mut stop).await;
        inner.writer.lock().take();
        inner.fail_pending();

        let error = match end {
            SessionEnd::Stopped => {
                inner.finish(None);
                return;
            }
            SessionEnd::Lost {
                error,
                reconnect: false,
            } => {
                inner.finish(error);
                return;
            }
            SessionEnd::Lost { error, .. } => error,
        };

        match reconnect(&inner, error, &mut stop).await {
            Some(next) => session = next,
            None => return,
        }
    }
}

async fn run_session(
    inner: &Inner,
    session: Session,
    stop: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let Session {
        stream,
        mut outgoing,
        backlog,
        ..
    } = session;
    let (mut sink, mut source) = stream.split();

    for message in backlog {
        if let Some(end) = inner.handle_message(message) {
            return end;
        }
    }

    let keep_alive = inner.options.keep_alive;
    let server_timeout = inner.options.server_timeout;
    let mut ping = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
    let mut deadline = Instant::now() + server_timeout;

    loop {
        tokio::select! {
            _ = stopped(stop) => {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Stopped;
            }
            frame = outgoing.recv() => {
                let Some(text) = frame else {
                    return lost("outgoing queue closed");
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    return lost(e);
                }
            }
            _ = ping.tick() => {
                if let Ok(text) = HubMessage::Ping.encode() {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        return lost(e);
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                return lost("server timeout elapsed without receiving a message");
            }
            incoming = source.next() => {
                deadline = Instant::now() + server_timeout;
                match incoming {
                    Some(Ok(Message::Text(text))) => match protocol::decode_frames(&text) {
                        Ok(messages) => {
                            for message in messages {
                                if let Some(end) = inner.handle_message(message) {
                                    return end;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("Dropping malformed hub frame: {}", e);
                            let callbacks = inner.frame_errors.lock().clone();
                            for callback in callbacks {
                                callback(&e);
                            }
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Lost {
                            error: frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty()),
                            reconnect: true,
                        };
                    }
                    Some(Ok(Message::Binary(_))) => warn!("Ignoring binary frame on a JSON hub"),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return lost(e),
                    None => return lost("websocket closed"),
                }
            }
        }
    }
}

/// Walk the reconnect policy. Returns the new session, or `None` once the
/// connection is closed for good.
async fn reconnect(
    inner: &Inner,
    error: Option<String>,
    stop: &mut watch::Receiver<bool>,
) -> Option<Session> {
    inner.set_state(ConnectionState::Reconnecting);
    *inner.connection_id.lock() = None;
    warn!("Hub connection lost ({:?}), reconnecting", error);
    let callbacks = inner.reconnecting.lock().clone();
    for callback in callbacks {
        callback(error.clone());
    }

    let mut last_error = error;
    let mut attempt = 0;
    while let Some(delay) = inner.options.reconnect.next_delay(attempt) {
        attempt += 1;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(stop) => {
                inner.finish(None);
                return None;
            }
        }

        match inner.open().await {
            Ok(session) => {
                inner.set_state(ConnectionState::Connected);
                info!("Hub reconnected after {} attempt(s)", attempt);
                let callbacks = inner.reconnected.lock().clone();
                for callback in callbacks {
                    callback(session.connection_id.clone());
                }
                return Some(session);
            }
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                last_error = Some(e.to_string());
            }
        }
    }

    inner.finish(last_error);
    None
}

async fn read_handshake(stream: &mut WsStream) -> Result<Vec<HubMessage>> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => return protocol::parse_handshake_response(&text),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(DomainError::Signaling(format!("handshake failed: {}", e))),
        }
    }
    Err(DomainError::Signaling(
        "connection closed during handshake".to_string(),
    ))
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

fn lost(error: impl std::fmt::Display) -> SessionEnd {
    SessionEnd::Lost {
        error: Some(error.to_string()),
        reconnect: true,
    }
}

fn negotiate_url(hub: &Url) -> Url {
    let mut url = hub.clone();
    let path = format!("{}/negotiate", hub.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    url
}

fn websocket_url(hub: &Url, token: Option<&str>) -> Result<Url> {
    let scheme = match hub.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(DomainError::Config(format!(
                "unsupported hub url scheme '{}'",
                other
            )))
        }
    };
    let mut url = hub.clone();
    url.set_scheme(scheme)
        .map_err(|_| DomainError::Config(format!("cannot derive websocket url from {}", hub)))?;
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("id", token);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_url() {
        let hub = Url::parse("http://localhost:5000/hub/webrtc").unwrap();
        assert_eq!(
            negotiate_url(&hub).as_str(),
            "http://localhost:5000/hub/webrtc/negotiate?negotiateVersion=1"
        );
    }

    #[test]
    fn test_websocket_url() {
        let hub = Url::parse("https://relay.example.com/hub/webrtc").unwrap();
        assert_eq!(
            websocket_url(&hub, Some("tok")).unwrap().as_str(),
            "wss://relay.example.com/hub/webrtc?id=tok"
        );

        let hub = Url::parse("http://localhost:5000/hub/webrtc").unwrap();
        assert_eq!(
            websocket_url(&hub, None).unwrap().as_str(),
            "ws://localhost:5000/hub/webrtc"
        );

        let ftp = Url::parse("ftp://localhost/hub").unwrap();
        assert!(websocket_url(&ftp, None).is_err());
    }

    #[tokio::test]
    async fn test_invoke_requires_connection() {
        let hub = HubConnection::new("http://localhost:5000/hub/webrtc", HubOptions::default())
            .unwrap();
        assert_eq!(hub.state(), ConnectionState::Disconnected);
        let err = hub.invoke("JoinRoom", vec![]).await.unwrap_err();
        assert!(matches!(err, DomainError::Signaling(_)));
        assert!(hub.connection_id().is_none());
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(HubConnection::new("not a url", HubOptions::default()).is_err());
    }
}
