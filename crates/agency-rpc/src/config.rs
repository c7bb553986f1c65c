//! Centralized configuration for the RPC runtime.
//!
//! Protocol constants live on [`RpcConfig`]; tunables for each side of the
//! connection live on [`ServerConfig`] and [`ClientConfig`].

use std::time::Duration;

/// Protocol-level constants shared by client and server.
pub struct RpcConfig;

impl RpcConfig {
    pub const PROTOCOL_VERSION: &'static str = "2.0";
    pub const BECOME_FIELD: &'static str = "x-agency-become";
    pub const ANONYMOUS_USER: &'static str = "anonymous";
    pub const SUPPORTED_SPEC_VERSION: u32 = 0;
    pub const RESERVED_PREFIX: &'static str = "rpc.";
    pub const SOCKET_ID_PARAM: &'static str = "socket_id";

    // Built-in methods
    pub const LOGIN_METHOD: &'static str = "rpc.login";
    pub const SUBSCRIBE_METHOD: &'static str = "rpc.on";
    pub const UNSUBSCRIBE_METHOD: &'static str = "rpc.off";

    // Subscription statuses
    pub const STATUS_OK: &'static str = "ok";
    pub const STATUS_NOT_REGISTERED: &'static str = "notification is not registered";
    pub const STATUS_FORBIDDEN: &'static str = "notification forbidden";

    // Defaults
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(35);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// How long a closing connection may spend flushing its queue
    pub const CLOSE_GRACE: Duration = Duration::from_millis(500);
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
}

/// Server-side tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interval between heartbeat probes (zero disables probing)
    pub ping_interval: Duration,
    /// Largest inbound WebSocket message accepted
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ping_interval: RpcConfig::DEFAULT_PING_INTERVAL,
            max_frame_size: RpcConfig::MAX_FRAME_SIZE,
        }
    }
}

/// Client-side tunables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default per-call timeout (zero means calls never expire)
    pub call_timeout: Duration,
    /// How long to wait for a server ping before giving up (zero disables)
    pub heartbeat_timeout: Duration,
    /// Connection id requested from the server
    pub socket_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: RpcConfig::DEFAULT_CALL_TIMEOUT,
            heartbeat_timeout: RpcConfig::DEFAULT_HEARTBEAT_TIMEOUT,
            socket_id: None,
        }
    }
}
