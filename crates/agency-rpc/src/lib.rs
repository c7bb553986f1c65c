//! Agency RPC - bidirectional JSON-RPC 2.0 over WebSocket.
//!
//! Both ends of a connection can call methods and push notifications. The
//! server side adds scope-based authorization, a login handshake, per-user
//! notification targeting and heartbeats that drop dead peers; the client
//! side correlates responses, times calls out and watches for server pings.
//!
//! # Example
//!
//! ```rust,ignore
//! use agency_rpc::{CallOptions, ClientConfig, RpcClient, RpcServer, Scopes};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> agency_rpc::Result<()> {
//!     let server = RpcServer::default();
//!     server.register_method("echo", Scopes::open(), |params, _ctx| async move {
//!         Ok(params.unwrap_or_default())
//!     })?;
//!     let handle = server.listen("127.0.0.1:0".parse().unwrap()).await?;
//!
//!     let client = RpcClient::new(format!("ws://{}", handle.addr()), ClientConfig::default());
//!     client.connect().await?;
//!     let echoed = client.call("echo", Some(json!(["hi"])), CallOptions::default()).await?;
//!     println!("{}", echoed);
//!
//!     client.close().await;
//!     handle.close().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod handler;
pub mod liveness;
pub mod registry;
pub mod scope;
pub mod server;
pub mod session;
pub mod spec;

// Re-export commonly used types
pub use auth::{authenticator_fn, AnonymousAuthenticator, Authenticator};
pub use client::{CallOptions, ClientEvent, NotificationHandler, RpcClient};
pub use config::{ClientConfig, RpcConfig, ServerConfig};
pub use error::{ErrorCode, ErrorObject, HandlerError, Result, RpcError};
pub use handler::{handler_fn, CallContext, MethodHandler};
pub use registry::{MethodDefinition, Registry, SubscriptionStatus};
pub use scope::Scopes;
pub use server::{NotifyOptions, RpcServer, ServerEvent, ServerHandle};
pub use session::{Identity, Session, SessionState};
pub use spec::{EventSpec, MethodSpec, RpcSpec};
