//! Per-connection server state.
//!
//! A session moves `Connected` → `Authenticated` → `Closed`. Identity is only
//! replaced by a successful `rpc.login`; the alive flag is only touched by the
//! heartbeat sweep and by pongs. Outgoing frames go through an unbounded
//! queue drained by the connection's writer task.

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::scope::Scopes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot, watch};

/// Authenticated identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default = "anonymous_user")]
    pub user: String,
    #[serde(default)]
    pub scopes: Scopes,
}

fn anonymous_user() -> String {
    RpcConfig::ANONYMOUS_USER.to_string()
}

impl Identity {
    pub fn new(user: impl Into<String>, scopes: Scopes) -> Self {
        Self {
            user: user.into(),
            scopes,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(RpcConfig::ANONYMOUS_USER, Scopes::new())
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticated,
    Closed,
}

/// Frame queued for a connection's writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Text {
        text: String,
        flushed: Option<oneshot::Sender<()>>,
    },
    Ping,
    /// Send a close frame, then stop writing.
    Close,
}

#[derive(Debug)]
struct SessionInfo {
    identity: Identity,
    state: SessionState,
}

/// Server-side state of one live socket.
#[derive(Debug)]
pub struct Session {
    id: String,
    info: RwLock<SessionInfo>,
    alive: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    pub(crate) fn new(id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: id.into(),
            info: RwLock::new(SessionInfo {
                identity: Identity::anonymous(),
                state: SessionState::Connected,
            }),
            alive: AtomicBool::new(true),
            outbound: tx,
            closed,
        });
        (session, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> Identity {
        self.read().identity.clone()
    }

    pub fn user(&self) -> String {
        self.read().identity.user.clone()
    }

    pub fn scopes(&self) -> Scopes {
        self.read().identity.scopes.clone()
    }

    pub fn state(&self) -> SessionState {
        self.read().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Replace the identity after a successful login.
    pub(crate) fn authenticate(&self, identity: Identity) {
        let mut info = self.write();
        if info.state == SessionState::Closed {
            return;
        }
        info.identity = identity;
        info.state = SessionState::Authenticated;
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Clear the alive flag, returning whether it was set.
    pub(crate) fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn ping(&self) -> bool {
        self.outbound.send(Outbound::Ping).is_ok()
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Queue a text frame without waiting for it to hit the socket.
    pub(crate) fn send_text(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        self.outbound
            .send(Outbound::Text {
                text,
                flushed: None,
            })
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Queue a text frame and wait until the writer has flushed it.
    pub(crate) async fn send_text_flushed(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Outbound::Text {
                text,
                flushed: Some(tx),
            })
            .map_err(|_| RpcError::ConnectionClosed)?;
        rx.await.map_err(|_| RpcError::ConnectionClosed)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Close politely: a close frame is sent before the socket is dropped.
    pub(crate) fn close(&self) {
        if self.mark_closed() {
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    /// Drop the socket without a closing handshake.
    pub(crate) fn terminate(&self) {
        self.mark_closed();
    }

    /// Resolve once the session has been closed or terminated.
    pub(crate) async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn mark_closed(&self) -> bool {
        let was_open = {
            let mut info = self.write();
            let was_open = info.state != SessionState::Closed;
            info.state = SessionState::Closed;
            was_open
        };
        self.closed.send_replace(true);
        was_open
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SessionInfo> {
        self.info.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SessionInfo> {
        self.info.write().unwrap_or_else(|e| e.into_inner())
    }
}
