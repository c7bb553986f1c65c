//! WebSocket JSON-RPC server.
//!
//! Accepts connections on an axum router, dispatches requests against the
//! [`Registry`] and pushes notifications to subscribed connections.
//!
//! # Thread Safety
//!
//! Each connection runs a reader loop and a writer task. Every inbound
//! message is dispatched on its own task, so a slow handler never blocks
//! later requests on the same socket; responses are written in completion
//! order. Shared tables use internal synchronization and the server itself
//! is a cheap clone around an `Arc`.

use crate::auth::{AnonymousAuthenticator, Authenticator};
use crate::codec::{
    decode_frame, user_name, validate_request, Frame, Notification, Request, Response,
};
use crate::config::{RpcConfig, ServerConfig};
use crate::error::{ErrorCode, ErrorObject, HandlerError, Result};
use crate::handler::{handler_fn, CallContext, MethodHandler};
use crate::liveness;
use crate::registry::Registry;
use crate::scope::Scopes;
use crate::session::{Identity, Outbound, Session};
use crate::spec::{EventSpec, MethodSpec, RpcSpec};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use rand::seq::IndexedRandom;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle events published by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Listening(SocketAddr),
    Connection { id: String },
    Authenticated { id: String, user: String },
    Disconnect { id: String },
    Close,
    Error(String),
}

/// Options for [`RpcServer::notify`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyOptions {
    /// Deliver to at most one eligible subscriber, picked at random
    pub random: bool,
}

/// Handle to a listening server. Dropping shuts the server down.
pub struct ServerHandle {
    addr: SocketAddr,
    server: RpcServer,
    shutdown_tx: Option<oneshot::Sender<()>>,
    serve_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn server(&self) -> &RpcServer {
        &self.server
    }

    /// Stop accepting connections and close every open one.
    pub fn shutdown(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = tx.send(());

        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }

        for session in self.server.sessions() {
            session.close();
        }

        info!("RPC server on {} shutting down", self.addr);
        self.server.emit(ServerEvent::Close);
    }

    /// Shut down and wait for the listener task to finish.
    pub async fn close(mut self) {
        self.shutdown();
        if let Some(task) = self.serve_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.serve_task.take() {
            task.abort();
        }
    }
}

struct ServerInner {
    config: ServerConfig,
    registry: Registry,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    authenticator: RwLock<Arc<dyn Authenticator>>,
    events: broadcast::Sender<ServerEvent>,
}

/// Callable entry resolved for an inbound method name.
enum Target {
    Login,
    Subscribe,
    Unsubscribe,
    Handler(Arc<dyn MethodHandler>),
}

/// JSON-RPC server over WebSocket.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl RpcServer {
    pub fn new(config: ServerConfig) -> Self {
        let (events, _) = broadcast::channel(RpcConfig::EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ServerInner {
                config,
                registry: Registry::new(),
                sessions: RwLock::new(HashMap::new()),
                authenticator: RwLock::new(Arc::new(AnonymousAuthenticator)),
                events,
            }),
        }
    }

    /// Use `authenticator` for `rpc.login`.
    pub fn with_authenticator(self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.set_authenticator(authenticator);
        self
    }

    pub fn set_authenticator(&self, authenticator: Arc<dyn Authenticator>) {
        *self
            .inner
            .authenticator
            .write()
            .unwrap_or_else(|e| e.into_inner()) = authenticator;
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register an async closure as a method.
    pub fn register_method<F, Fut>(&self, name: &str, scopes: Scopes, f: F) -> Result<()>
    where
        F: Fn(Option<Value>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
    {
        self.register_handler(name, scopes, handler_fn(f))
    }

    pub fn register_handler(
        &self,
        name: &str,
        scopes: Scopes,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<()> {
        self.inner.registry.register_method(name, handler, scopes)
    }

    pub fn deregister_method(&self, name: &str) -> bool {
        self.inner.registry.deregister_method(name)
    }

    pub fn register_notification(&self, name: &str, scopes: Scopes) -> Result<()> {
        self.inner.registry.register_notification(name, scopes)
    }

    pub fn deregister_notification(&self, name: &str) -> bool {
        self.inner.registry.deregister_notification(name)
    }

    /// Register everything a parsed spec declares.
    ///
    /// `resolve_method` maps each method entry to its handler; returning
    /// `None` aborts the whole registration.
    pub fn register_spec<M, E>(&self, spec: &RpcSpec, resolve_method: M, on_event: E) -> Result<()>
    where
        M: FnMut(&str, &MethodSpec) -> Option<Arc<dyn MethodHandler>>,
        E: FnMut(&str, &EventSpec),
    {
        self.inner
            .registry
            .register_spec(spec, resolve_method, on_event)
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Push a notification to its subscribers.
    ///
    /// When `params` carries a non-null `user`, only connections logged in
    /// as that user (compared by its string form) or holding the `service`
    /// scope receive it. Returns the ids of the connections the notification
    /// was flushed to.
    pub async fn notify(
        &self,
        name: &str,
        params: Option<Value>,
        options: NotifyOptions,
    ) -> Result<Vec<String>> {
        let subscriber_ids = self.inner.registry.subscribers(name)?;
        let target_user = params
            .as_ref()
            .and_then(|p| p.get("user"))
            .filter(|user| !user.is_null())
            .map(user_name);

        let mut targets: Vec<Arc<Session>> = {
            let sessions = self.sessions_read();
            subscriber_ids
                .iter()
                .filter_map(|id| sessions.get(id).cloned())
                .filter(|s| !s.is_closed())
                .filter(|s| match &target_user {
                    Some(user) => s.user() == *user || s.scopes().is_service(),
                    None => true,
                })
                .collect()
        };

        if options.random {
            targets = targets.choose(&mut rand::rng()).cloned().into_iter().collect();
        }

        if targets.is_empty() {
            debug!("notification {} has no eligible recipients", name);
            return Ok(Vec::new());
        }

        let text = serde_json::to_string(&Notification::new(name, params))?;
        let deliveries = targets.iter().map(|session| {
            let text = text.clone();
            async move {
                let result = session.send_text_flushed(text).await;
                (session.id().to_string(), result)
            }
        });

        let mut delivered = Vec::with_capacity(targets.len());
        for (id, result) in futures::future::join_all(deliveries).await {
            match result {
                Ok(()) => delivered.push(id),
                Err(e) => debug!("notification {} not delivered to {}: {}", name, id, e),
            }
        }
        Ok(delivered)
    }

    pub fn has_subscribers(&self, name: &str) -> Result<bool> {
        self.inner.registry.has_subscribers(name)
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub fn connection_count(&self) -> usize {
        self.sessions_read().len()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.sessions_read().keys().cloned().collect()
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions_read().get(id).cloned()
    }

    /// Snapshot of every open session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions_read().values().cloned().collect()
    }

    /// Force-close a connection without a closing handshake.
    pub fn terminate(&self, id: &str) -> bool {
        match self.session(id) {
            Some(session) => {
                session.terminate();
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Transport
    // ========================================================================

    /// Build the router serving WebSocket upgrades and `/health`.
    ///
    /// Upgrades are accepted on any path other than `/health`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .fallback(upgrade)
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Bind `addr` and start serving.
    ///
    /// Port 0 picks a free port; the bound address is on the returned handle.
    pub async fn listen(&self, addr: SocketAddr) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = self.router();
        let events = self.inner.events.clone();
        let serve_task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("RPC server error: {}", e);
                let _ = events.send(ServerEvent::Error(e.to_string()));
            }
        });

        let interval = self.inner.config.ping_interval;
        let heartbeat_task = (!interval.is_zero()).then(|| {
            let server = self.clone();
            tokio::spawn(liveness::run_heartbeat(interval, move || server.sessions()))
        });

        info!("RPC server listening on {}", addr);
        self.emit(ServerEvent::Listening(addr));

        Ok(ServerHandle {
            addr,
            server: self.clone(),
            shutdown_tx: Some(shutdown_tx),
            serve_task: Some(serve_task),
            heartbeat_task,
        })
    }

    /// Drive one upgraded socket until it closes.
    async fn serve_socket(self, socket: WebSocket, requested_id: String) {
        let (session, mut outbound_rx) = self.open_session(requested_id);
        let id = session.id().to_string();
        let (mut sink, mut stream) = socket.split();

        let mut writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    Outbound::Text { text, flushed } => {
                        if sink.send(Message::Text(text)).await.is_err() {
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
        });

        loop {
            tokio::select! {
                _ = session.closed() => break,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.spawn_dispatch(&session, text),
                    Some(Ok(Message::Binary(bytes))) => {
                        self.spawn_dispatch(&session, String::from_utf8_lossy(&bytes).into_owned())
                    }
                    Some(Ok(Message::Pong(_))) => session.mark_alive(),
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("connection {} read error: {}", id, e);
                        self.emit(ServerEvent::Error(e.to_string()));
                        break;
                    }
                },
            }
        }

        self.close_session(&session);

        if tokio::time::timeout(RpcConfig::CLOSE_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
    }

    fn open_session(
        &self,
        requested_id: String,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<Outbound>) {
        let (session, outbound_rx) = {
            let mut sessions = self.sessions_write();
            let id = if requested_id.is_empty() || sessions.contains_key(&requested_id) {
                if !requested_id.is_empty() {
                    warn!("connection id {} already in use, assigning a new one", requested_id);
                }
                Uuid::new_v4().to_string()
            } else {
                requested_id
            };
            let (session, outbound_rx) = Session::new(id.clone());
            sessions.insert(id, Arc::clone(&session));
            (session, outbound_rx)
        };

        info!("connection {} opened", session.id());
        self.emit(ServerEvent::Connection {
            id: session.id().to_string(),
        });
        (session, outbound_rx)
    }

    fn close_session(&self, session: &Arc<Session>) {
        session.close();
        self.sessions_write().remove(session.id());
        self.inner.registry.remove_connection(session.id());

        info!("connection {} closed", session.id());
        self.emit(ServerEvent::Disconnect {
            id: session.id().to_string(),
        });
    }

    fn spawn_dispatch(&self, session: &Arc<Session>, text: String) {
        let server = self.clone();
        let session = Arc::clone(session);
        tokio::spawn(async move {
            if let Some(reply) = server.handle_message(&session, &text).await {
                if let Err(e) = session.send_text(reply) {
                    debug!("dropping reply for connection {}: {}", session.id(), e);
                }
            }
        });
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Process one inbound message and return the reply to send, if any.
    pub(crate) async fn handle_message(&self, session: &Arc<Session>, text: &str) -> Option<String> {
        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(err) => return encode_reply(Frame::Single(Response::error(None, err))),
        };

        match frame {
            Frame::Single(entry) => {
                let response = self.run_entry(session, entry).await?;
                encode_reply(Frame::Single(response))
            }
            Frame::Batch(entries) => {
                let mut responses = Vec::with_capacity(entries.len());
                for entry in entries {
                    if let Some(response) = self.run_entry(session, entry).await {
                        responses.push(response);
                    }
                }
                if responses.is_empty() {
                    return None;
                }
                encode_reply(Frame::Batch(responses))
            }
        }
    }

    async fn run_entry(&self, session: &Arc<Session>, entry: Value) -> Option<Response> {
        let request = match validate_request(entry) {
            Ok(request) => request,
            Err(invalid) => return Some(invalid.into_response()),
        };

        let answer = request.expects_response();
        let id = request.id.clone();
        let outcome = self.run_request(session, request).await;

        if !answer {
            return None;
        }
        Some(match outcome {
            Ok(result) => Response::success(id, result),
            Err(err) => Response::error(id, err),
        })
    }

    async fn run_request(
        &self,
        session: &Arc<Session>,
        request: Request,
    ) -> std::result::Result<Value, ErrorObject> {
        let Some((scopes, target)) = self.resolve(&request.method) else {
            debug!("connection {} called unknown method {}", session.id(), request.method);
            return Err(ErrorCode::MethodNotFound.into());
        };

        let identity = session.identity();
        if !scopes.permits(&identity.scopes) {
            debug!(
                "connection {} not permitted to call {}",
                session.id(),
                request.method
            );
            return Err(ErrorCode::MethodForbidden.into());
        }

        let service = identity.scopes.is_service();
        let user = match request.become_user {
            Some(target_user) if service => target_user,
            Some(_) => return Err(ErrorCode::BecomingForbidden.into()),
            None => identity.user,
        };

        match target {
            Target::Login => self.login(session, request.params).await,
            Target::Subscribe => self.subscribe(session, request.params),
            Target::Unsubscribe => self.unsubscribe(session, request.params),
            Target::Handler(handler) => {
                let ctx = CallContext {
                    connection_id: session.id().to_string(),
                    user,
                    scopes: identity.scopes,
                    service,
                    method: request.method.clone(),
                };
                handler.call(request.params, ctx).await.map_err(|e| {
                    debug!("method {} failed: {}", request.method, e);
                    e.into_error_object()
                })
            }
        }
    }

    fn resolve(&self, method: &str) -> Option<(Scopes, Target)> {
        match method {
            RpcConfig::LOGIN_METHOD => Some((Scopes::open(), Target::Login)),
            RpcConfig::SUBSCRIBE_METHOD => Some((Scopes::open(), Target::Subscribe)),
            RpcConfig::UNSUBSCRIBE_METHOD => Some((Scopes::open(), Target::Unsubscribe)),
            _ => self
                .inner
                .registry
                .method(method)
                .map(|def| (def.scopes, Target::Handler(def.handler))),
        }
    }

    // ========================================================================
    // Built-in methods
    // ========================================================================

    async fn login(
        &self,
        session: &Arc<Session>,
        params: Option<Value>,
    ) -> std::result::Result<Value, ErrorObject> {
        let Some(credentials) = params else {
            return Err(ErrorCode::ParamsNotFound.into());
        };

        let authenticator = Arc::clone(
            &*self
                .inner
                .authenticator
                .read()
                .unwrap_or_else(|e| e.into_inner()),
        );

        let Some(identity) = authenticator.authenticate(&credentials).await else {
            debug!("login rejected on connection {}", session.id());
            return Err(
                HandlerError::new("AuthenticationFailed", "credentials were rejected")
                    .into_error_object(),
            );
        };

        session.authenticate(identity.clone());
        info!("connection {} authenticated as {}", session.id(), identity.user);
        self.emit(ServerEvent::Authenticated {
            id: session.id().to_string(),
            user: identity.user.clone(),
        });

        identity_value(&identity)
    }

    fn subscribe(
        &self,
        session: &Arc<Session>,
        params: Option<Value>,
    ) -> std::result::Result<Value, ErrorObject> {
        let names = notification_names(params)?;
        let granted = session.scopes();

        let mut statuses = Map::new();
        for name in names {
            let status = self
                .inner
                .registry
                .subscribe(&name, session.id(), &granted);
            statuses.insert(name, Value::from(status.as_str()));
        }

        // The connection may have gone away while this request was in flight.
        if session.is_closed() {
            self.inner.registry.remove_connection(session.id());
        }

        Ok(Value::Object(statuses))
    }

    fn unsubscribe(
        &self,
        session: &Arc<Session>,
        params: Option<Value>,
    ) -> std::result::Result<Value, ErrorObject> {
        let names = notification_names(params)?;

        let mut statuses = Map::new();
        for name in names {
            let status = self.inner.registry.unsubscribe(&name, session.id());
            statuses.insert(name, Value::from(status.as_str()));
        }
        Ok(Value::Object(statuses))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn emit(&self, event: ServerEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    fn sessions_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Session>>> {
        self.inner.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn sessions_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
        self.inner.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Names passed to `rpc.on` / `rpc.off`.
fn notification_names(params: Option<Value>) -> std::result::Result<Vec<String>, ErrorObject> {
    let Some(params) = params else {
        return Err(ErrorCode::EventNotProvided.into());
    };

    let Value::Array(entries) = params else {
        return Err(ErrorObject::new(ErrorCode::InvalidParams)
            .with_data("expected an array of notification names"));
    };

    entries
        .into_iter()
        .map(|entry| match entry {
            Value::String(name) => Ok(name),
            other => Err(ErrorObject::new(ErrorCode::InvalidParams)
                .with_data(format!("notification name must be a string, got {}", other))),
        })
        .collect()
}

fn identity_value(identity: &Identity) -> std::result::Result<Value, ErrorObject> {
    serde_json::to_value(identity).map_err(|e| HandlerError::from(e).into_error_object())
}

fn encode_reply(frame: Frame<Response>) -> Option<String> {
    match frame.encode() {
        Ok(text) => Some(text),
        Err(e) => {
            error!("failed to encode response: {}", e);
            None
        }
    }
}

async fn upgrade(
    State(server): State<RpcServer>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let requested_id = query
        .get(RpcConfig::SOCKET_ID_PARAM)
        .cloned()
        .unwrap_or_default();
    let max_frame_size = server.inner.config.max_frame_size;

    ws.max_message_size(max_frame_size)
        .on_upgrade(move |socket| server.serve_socket(socket, requested_id))
}

async fn health(State(server): State<RpcServer>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "connections": server.connection_count(),
    }))
}
