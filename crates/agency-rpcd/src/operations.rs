//! Operations the daemon can bind spec methods to.

use agency_rpc::{handler_fn, HandlerError, MethodHandler, MethodSpec, RpcServer, Scopes};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

pub const PING: &str = "system.ping";
pub const WHOAMI: &str = "system.whoami";

/// Handler for a known operation id.
pub fn builtin(operation_id: &str) -> Option<Arc<dyn MethodHandler>> {
    match operation_id {
        PING => Some(handler_fn(|_params, _ctx| async move { Ok(json!("pong")) })),
        WHOAMI => Some(handler_fn(|_params, ctx| async move {
            Ok(json!({
                "user": ctx.user,
                "scopes": ctx.scopes,
                "connection": ctx.connection_id,
            }))
        })),
        _ => None,
    }
}

/// Placeholder for operations this process does not implement.
fn not_implemented(operation_id: String) -> Arc<dyn MethodHandler> {
    handler_fn(move |_params, ctx| {
        let operation_id = operation_id.clone();
        async move {
            Err(HandlerError::new(
                "NotImplemented",
                format!("{} (operation {}) is not implemented", ctx.method, operation_id),
            ))
        }
    })
}

/// Resolve a spec method to a handler.
///
/// Methods without an `operationId` fall back to their own name.
pub fn resolve(name: &str, meta: &MethodSpec) -> Option<Arc<dyn MethodHandler>> {
    let operation_id = meta.operation_id.as_deref().unwrap_or(name);
    builtin(operation_id).or_else(|| {
        warn!("no implementation for {} ({}), registering a stub", name, operation_id);
        Some(not_implemented(operation_id.to_string()))
    })
}

/// Register the built-in operations under their own names.
pub fn register_builtins(server: &RpcServer) -> agency_rpc::Result<()> {
    for name in [PING, WHOAMI] {
        if let Some(handler) = builtin(name) {
            server.register_handler(name, Scopes::open(), handler)?;
        }
    }
    Ok(())
}
