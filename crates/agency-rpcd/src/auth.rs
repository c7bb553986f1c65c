//! Static token table behind `rpc.login`.

use crate::config::TokenGrant;
use agency_rpc::{Authenticator, Identity};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Accepts `{"token": "..."}` credentials found in the configured table.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, TokenGrant>,
}

impl TokenAuthenticator {
    pub fn new(tokens: HashMap<String, TokenGrant>) -> Self {
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait::async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, credentials: &Value) -> Option<Identity> {
        let token = credentials.get("token").and_then(Value::as_str)?;
        let Some(grant) = self.tokens.get(token) else {
            debug!("unknown login token");
            return None;
        };
        Some(Identity::new(grant.user.clone(), grant.scopes.clone()))
    }
}
