//! WebSocket JSON-RPC client.
//!
//! One socket carries calls, fire-and-forget notifications and server pushes.
//! Responses are matched to callers through [`PendingCalls`]; notifications
//! are fanned out to the handlers registered with [`RpcClient::subscribe`].
//!
//! # Thread Safety
//!
//! `RpcClient` is a cheap clone around an `Arc` and may be used from many
//! tasks at once. A background reader task owns the receive half of the
//! socket and a writer task drains the outbound queue.

use crate::codec::{decode_incoming, Incoming, Request};
use crate::config::{ClientConfig, RpcConfig};
use crate::correlator::{PendingCalls, Settled};
use crate::error::{Result, RpcError};
use crate::liveness::Watchdog;
use crate::scope::Scopes;
use crate::session::{Identity, Outbound};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback invoked with the params of a pushed notification.
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Lifecycle events published by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Authenticated(Identity),
    /// No server ping arrived within the heartbeat timeout.
    HeartbeatMissed,
    Disconnected,
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the configured call timeout; zero waits forever
    pub timeout: Option<Duration>,
    /// Act on behalf of another user (needs the `service` scope)
    pub become_user: Option<String>,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn become_user(user: impl Into<String>) -> Self {
        Self {
            become_user: Some(user.into()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A live socket and the tasks serving it.
struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    stop: Arc<watch::Sender<bool>>,
    reader: Option<JoinHandle<()>>,
    watchdog: Option<Arc<Watchdog>>,
}

struct ClientInner {
    url: String,
    config: ClientConfig,
    pending: Arc<PendingCalls>,
    handlers: Mutex<HashMap<String, Vec<NotificationHandler>>>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    identity: RwLock<Option<Identity>>,
    events: broadcast::Sender<ClientEvent>,
}

/// JSON-RPC client over WebSocket.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Create a client for `url`. No connection is made until [`connect`](Self::connect).
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(RpcConfig::EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                url: url.into(),
                config,
                pending: Arc::new(PendingCalls::new()),
                handlers: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                identity: RwLock::new(None),
                events,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link().is_some()
    }

    /// Identity returned by the last successful [`auth`](Self::auth) on this connection.
    pub fn identity(&self) -> Option<Identity> {
        self.inner
            .identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Scopes of the cached identity, empty when not logged in.
    pub fn scopes(&self) -> Scopes {
        self.identity().map(|i| i.scopes).unwrap_or_default()
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Open the socket.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(RpcError::AlreadyConnected);
        }

        let url = self.endpoint()?;
        let (socket, _response) = tokio::time::timeout(
            RpcConfig::CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| RpcError::Transport(format!("timed out connecting to {}", url)))??;

        let (sink, stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop = Arc::new(stop_tx);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let watchdog = self.arm_watchdog(&stop);

        {
            let mut link = self.inner.link();
            if link.is_some() {
                return Err(RpcError::AlreadyConnected);
            }
            *link = Some(Link {
                generation,
                outbound: outbound_tx,
                stop: Arc::clone(&stop),
                reader: None,
                watchdog: watchdog.clone(),
            });
        }

        info!("connected to {}", url);
        self.inner.emit(ClientEvent::Connected);

        tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(
            Arc::clone(&self.inner),
            generation,
            stream,
            stop_rx,
            watchdog,
        ));

        if let Some(link) = self.inner.link().as_mut() {
            if link.generation == generation {
                link.reader = Some(reader);
            }
        }
        Ok(())
    }

    /// Close the socket politely.
    ///
    /// Calls still pending are rejected with [`RpcError::ConnectionClosed`].
    pub async fn close(&self) {
        let (reader, stop) = {
            let mut link = self.inner.link();
            let Some(link) = link.as_mut() else {
                return;
            };
            let _ = link.outbound.send(Outbound::Close);
            (link.reader.take(), Arc::clone(&link.stop))
        };

        let Some(mut reader) = reader else {
            return;
        };

        if tokio::time::timeout(RpcConfig::CLOSE_GRACE, &mut reader).await.is_err() {
            debug!("server did not acknowledge close, dropping socket");
            let _ = stop.send(true);
            let _ = reader.await;
        }
    }

    fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.inner.url)
            .map_err(|e| RpcError::Transport(format!("invalid url {}: {}", self.inner.url, e)))?;

        let scheme = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            let _ = url.set_scheme(scheme);
        }

        if let Some(id) = &self.inner.config.socket_id {
            url.query_pairs_mut()
                .append_pair(RpcConfig::SOCKET_ID_PARAM, id);
        }
        Ok(url)
    }

    fn arm_watchdog(&self, stop: &Arc<watch::Sender<bool>>) -> Option<Arc<Watchdog>> {
        let timeout = self.inner.config.heartbeat_timeout;
        if timeout.is_zero() {
            return None;
        }

        let stop = Arc::clone(stop);
        let events = self.inner.events.clone();
        Some(Arc::new(Watchdog::spawn(timeout, move || {
            warn!("no heartbeat from server within {:?}, terminating", timeout);
            let _ = events.send(ClientEvent::HeartbeatMissed);
            let _ = stop.send(true);
        })))
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call a remote method and wait for its result.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        options: CallOptions,
    ) -> Result<Value> {
        let (generation, outbound) = self.outbound()?;
        let timeout = options.timeout.unwrap_or(self.inner.config.call_timeout);

        let pending = self.inner.pending.register();
        // Teardown forgets the link before rejecting pending calls, so a
        // call registered after that rejection sees the link gone here.
        if self.inner.generation_of_link() != Some(generation) {
            pending.cancel();
            return Err(RpcError::NotConnected);
        }
        let request = Request::call(method, params, pending.id()).with_become(options.become_user);

        let text = match serde_json::to_string(&request) {
            Ok(text) => text,
            Err(e) => {
                pending.cancel();
                return Err(e.into());
            }
        };

        if let Err(e) = send_flushed(&outbound, text).await {
            pending.cancel();
            return Err(e);
        }

        pending.wait(method, timeout).await
    }

    /// Send a notification; resolves once the frame is written.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        options: CallOptions,
    ) -> Result<()> {
        let (_, outbound) = self.outbound()?;
        let request = Request::notification(method, params).with_become(options.become_user);
        let text = serde_json::to_string(&request)?;
        send_flushed(&outbound, text).await
    }

    /// Log in with `credentials` and cache the resulting identity.
    pub async fn auth(&self, credentials: Value) -> Result<Identity> {
        let result = self
            .call(RpcConfig::LOGIN_METHOD, Some(credentials), CallOptions::default())
            .await?;
        let identity: Identity = serde_json::from_value(result)?;

        *self
            .inner
            .identity
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(identity.clone());

        info!("authenticated as {}", identity.user);
        self.inner
            .emit(ClientEvent::Authenticated(identity.clone()));
        Ok(identity)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to a server notification.
    ///
    /// The handler is only recorded once the server accepts the subscription;
    /// adding the same handler twice is a no-op.
    pub async fn subscribe(&self, name: &str, handler: NotificationHandler) -> Result<()> {
        let status = self.toggle(RpcConfig::SUBSCRIBE_METHOD, name).await?;
        if status != RpcConfig::STATUS_OK {
            return Err(RpcError::Subscription {
                name: name.to_string(),
                reason: status,
            });
        }

        let mut handlers = self.inner.handlers();
        let registered = handlers.entry(name.to_string()).or_default();
        if !registered.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            registered.push(handler);
        }
        Ok(())
    }

    /// Drop `handler` for a notification.
    ///
    /// The server subscription is only released once no local handler for
    /// `name` remains.
    pub async fn unsubscribe(&self, name: &str, handler: &NotificationHandler) -> Result<()> {
        {
            let mut handlers = self.inner.handlers();
            if let Some(registered) = handlers.get_mut(name) {
                registered.retain(|h| !Arc::ptr_eq(h, handler));
                if !registered.is_empty() {
                    debug!("{} still has {} local handlers", name, registered.len());
                    return Ok(());
                }
                handlers.remove(name);
            }
        }

        let status = self.toggle(RpcConfig::UNSUBSCRIBE_METHOD, name).await?;
        if status != RpcConfig::STATUS_OK {
            return Err(RpcError::Subscription {
                name: name.to_string(),
                reason: status,
            });
        }
        Ok(())
    }

    async fn toggle(&self, method: &str, name: &str) -> Result<String> {
        let result = self
            .call(method, Some(json!([name])), CallOptions::default())
            .await?;
        Ok(result
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or("no status returned")
            .to_string())
    }

    fn outbound(&self) -> Result<(u64, mpsc::UnboundedSender<Outbound>)> {
        self.inner
            .link()
            .as_ref()
            .map(|link| (link.generation, link.outbound.clone()))
            .ok_or(RpcError::NotConnected)
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("url", &self.inner.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ClientInner {
    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn generation_of_link(&self) -> Option<u64> {
        self.link().as_ref().map(|link| link.generation)
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<String, Vec<NotificationHandler>>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Route one inbound message to waiting calls and notification handlers.
    fn handle_incoming(&self, text: &str) {
        for incoming in decode_incoming(text) {
            match incoming {
                Incoming::Response(response) => {
                    let Some(id) = response.numeric_id() else {
                        debug!("dropping response without a usable id");
                        continue;
                    };
                    let outcome = response.into_outcome().map_err(Settled::Remote);
                    self.pending.resolve(id, outcome);
                }
                Incoming::Notification(notification) => {
                    let handlers = self
                        .handlers()
                        .get(&notification.method)
                        .cloned()
                        .unwrap_or_default();
                    if handlers.is_empty() {
                        debug!("no handler for notification {}", notification.method);
                    }
                    for handler in handlers {
                        handler(notification.params.clone());
                    }
                }
            }
        }
    }

    /// Forget the link of `generation` and fail everything that depended on it.
    fn teardown(&self, generation: u64) {
        let link = {
            let mut link = self.link();
            match link.as_ref() {
                Some(current) if current.generation == generation => link.take(),
                _ => None,
            }
        };
        let Some(link) = link else {
            return;
        };

        if let Some(watchdog) = &link.watchdog {
            watchdog.stop();
        }
        drop(link);

        let rejected = self.pending.reject_all();
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = None;

        info!(
            "disconnected from {} ({} pending calls rejected)",
            self.url, rejected
        );
        self.emit(ClientEvent::Disconnected);
    }
}

async fn send_flushed(outbound: &mpsc::UnboundedSender<Outbound>, text: String) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    outbound
        .send(Outbound::Text {
            text,
            flushed: Some(tx),
        })
        .map_err(|_| RpcError::NotConnected)?;
    rx.await.map_err(|_| RpcError::ConnectionClosed)
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Text { text, flushed } => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!("write failed: {}", e);
                    break;
                }
                if let Some(ack) = flushed {
                    let _ = ack.send(());
                }
            }
            Outbound::Ping => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

async fn read_loop(
    inner: Arc<ClientInner>,
    generation: u64,
    mut stream: SplitStream<Socket>,
    mut stop: watch::Receiver<bool>,
    watchdog: Option<Arc<Watchdog>>,
) {
    loop {
        tokio::select! {
            _ = stop.wait_for(|stop| *stop) => break,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => inner.handle_incoming(&text),
                Some(Ok(Message::Binary(bytes))) => {
                    inner.handle_incoming(&String::from_utf8_lossy(&bytes))
                }
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite answers with a pong on the next read.
                    if let Some(watchdog) = &watchdog {
                        watchdog.reset();
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("read failed: {}", e);
                    break;
                }
            },
        }
    }

    inner.teardown(generation);
}
