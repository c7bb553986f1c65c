//! Method handler abstraction.

use crate::error::HandlerError;
use crate::scope::Scopes;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Per-call information handed to a method handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Connection the call arrived on
    pub connection_id: String,
    /// Effective user; the `become` target when impersonating
    pub user: String,
    /// Scopes granted to the connection
    pub scopes: Scopes,
    /// Whether the connection holds the `service` scope
    pub service: bool,
    /// Name the call was dispatched under
    pub method: String,
}

/// Trait implemented by every registered method.
#[async_trait::async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn call(
        &self,
        params: Option<Value>,
        ctx: CallContext,
    ) -> std::result::Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`MethodHandler`].
pub struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Option<Value>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(
        &self,
        params: Option<Value>,
        ctx: CallContext,
    ) -> std::result::Result<Value, HandlerError> {
        (self.0)(params, ctx).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(Option<Value>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
