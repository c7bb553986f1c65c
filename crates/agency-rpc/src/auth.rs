//! Pluggable credential check behind `rpc.login`.

use crate::session::Identity;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Turns login credentials into an identity; `None` rejects the login.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, credentials: &Value) -> Option<Identity>;
}

/// Accepts every login as the anonymous user with no scopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuthenticator;

#[async_trait::async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(&self, _credentials: &Value) -> Option<Identity> {
        Some(Identity::anonymous())
    }
}

struct FnAuthenticator<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Authenticator for FnAuthenticator<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Identity>> + Send + 'static,
{
    async fn authenticate(&self, credentials: &Value) -> Option<Identity> {
        (self.0)(credentials.clone()).await
    }
}

/// Wrap an async closure as an [`Authenticator`].
pub fn authenticator_fn<F, Fut>(f: F) -> Arc<dyn Authenticator>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Identity>> + Send + 'static,
{
    Arc::new(FnAuthenticator(f))
}
