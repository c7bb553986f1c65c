//! Method and notification definitions with their required scopes.
//!
//! # Thread Safety
//!
//! Both tables sit behind `std::sync::RwLock`s that are never held across an
//! await, so registration may happen while calls are being dispatched and
//! notifications delivered.

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::handler::MethodHandler;
use crate::scope::Scopes;
use crate::spec::{EventSpec, MethodSpec, RpcSpec};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// A registered method.
#[derive(Clone)]
pub struct MethodDefinition {
    pub name: String,
    pub handler: Arc<dyn MethodHandler>,
    pub scopes: Scopes,
}

impl std::fmt::Debug for MethodDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDefinition")
            .field("name", &self.name)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

/// A notification channel and the connections subscribed to it.
#[derive(Debug, Clone, Default)]
struct Channel {
    scopes: Scopes,
    subscribers: BTreeSet<String>,
}

/// Per-name outcome of a subscribe or unsubscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Ok,
    NotRegistered,
    Forbidden,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Ok => RpcConfig::STATUS_OK,
            SubscriptionStatus::NotRegistered => RpcConfig::STATUS_NOT_REGISTERED,
            SubscriptionStatus::Forbidden => RpcConfig::STATUS_FORBIDDEN,
        }
    }
}

/// Method and notification tables.
#[derive(Debug, Default)]
pub struct Registry {
    methods: RwLock<HashMap<String, MethodDefinition>>,
    channels: RwLock<HashMap<String, Channel>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Methods
    // ========================================================================

    /// Register (or replace) a method.
    pub fn register_method(
        &self,
        name: &str,
        handler: Arc<dyn MethodHandler>,
        scopes: Scopes,
    ) -> Result<()> {
        validate_name(name)?;
        debug!("registering method {} with scopes {:?}", name, scopes);
        self.methods_mut().insert(
            name.to_string(),
            MethodDefinition {
                name: name.to_string(),
                handler,
                scopes,
            },
        );
        Ok(())
    }

    /// Remove a method. Returns false if it was not registered.
    pub fn deregister_method(&self, name: &str) -> bool {
        self.methods_mut().remove(name).is_some()
    }

    pub fn method(&self, name: &str) -> Option<MethodDefinition> {
        self.methods().get(name).cloned()
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods().keys().cloned().collect();
        names.sort();
        names
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Register a notification channel, or replace the scopes of an existing
    /// one. Existing subscribers are kept.
    pub fn register_notification(&self, name: &str, scopes: Scopes) -> Result<()> {
        validate_name(name)?;
        debug!("registering notification {} with scopes {:?}", name, scopes);
        self.channels_mut().entry(name.to_string()).or_default().scopes = scopes;
        Ok(())
    }

    /// Remove a channel along with its subscriber set.
    pub fn deregister_notification(&self, name: &str) -> bool {
        self.channels_mut().remove(name).is_some()
    }

    pub fn notification_scopes(&self, name: &str) -> Option<Scopes> {
        self.channels().get(name).map(|c| c.scopes.clone())
    }

    pub fn notification_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels().keys().cloned().collect();
        names.sort();
        names
    }

    /// Add `connection_id` to a channel if `granted` satisfies its scopes.
    pub fn subscribe(&self, name: &str, connection_id: &str, granted: &Scopes) -> SubscriptionStatus {
        let mut channels = self.channels_mut();
        let Some(channel) = channels.get_mut(name) else {
            return SubscriptionStatus::NotRegistered;
        };

        if !channel.scopes.permits(granted) {
            return SubscriptionStatus::Forbidden;
        }

        channel.subscribers.insert(connection_id.to_string());
        SubscriptionStatus::Ok
    }

    /// Remove `connection_id` from a channel if present.
    pub fn unsubscribe(&self, name: &str, connection_id: &str) -> SubscriptionStatus {
        match self.channels_mut().get_mut(name) {
            Some(channel) => {
                channel.subscribers.remove(connection_id);
                SubscriptionStatus::Ok
            }
            None => SubscriptionStatus::NotRegistered,
        }
    }

    /// Drop a connection from every channel.
    pub fn remove_connection(&self, connection_id: &str) {
        for channel in self.channels_mut().values_mut() {
            channel.subscribers.remove(connection_id);
        }
    }

    /// Snapshot of the connections subscribed to `name`.
    pub fn subscribers(&self, name: &str) -> Result<Vec<String>> {
        self.channels()
            .get(name)
            .map(|c| c.subscribers.iter().cloned().collect())
            .ok_or_else(|| RpcError::NotificationNotRegistered(name.to_string()))
    }

    pub fn has_subscribers(&self, name: &str) -> Result<bool> {
        self.channels()
            .get(name)
            .map(|c| !c.subscribers.is_empty())
            .ok_or_else(|| RpcError::NotificationNotRegistered(name.to_string()))
    }

    // ========================================================================
    // Spec registration
    // ========================================================================

    /// Register every method and event declared by a parsed spec.
    ///
    /// Nothing is registered unless the version is supported and every method
    /// resolves to a handler.
    pub fn register_spec<M, E>(
        &self,
        spec: &RpcSpec,
        mut resolve_method: M,
        mut on_event: E,
    ) -> Result<()>
    where
        M: FnMut(&str, &MethodSpec) -> Option<Arc<dyn MethodHandler>>,
        E: FnMut(&str, &EventSpec),
    {
        if spec.version != RpcConfig::SUPPORTED_SPEC_VERSION {
            return Err(RpcError::UnsupportedSpecVersion(spec.version));
        }

        for name in spec.methods.keys().chain(spec.events.keys()) {
            validate_name(name)?;
        }

        let mut resolved = Vec::with_capacity(spec.methods.len());
        for (name, meta) in &spec.methods {
            let handler = resolve_method(name, meta).ok_or_else(|| RpcError::BadOperation {
                method: name.clone(),
            })?;
            resolved.push((name, handler, meta.scopes.clone()));
        }

        for (name, handler, scopes) in resolved {
            self.register_method(name, handler, scopes)?;
        }

        for (name, meta) in &spec.events {
            on_event(name, meta);
            self.register_notification(name, meta.scopes.clone())?;
        }

        Ok(())
    }

    fn methods(&self) -> RwLockReadGuard<'_, HashMap<String, MethodDefinition>> {
        self.methods.read().unwrap_or_else(|e| e.into_inner())
    }

    fn methods_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, MethodDefinition>> {
        self.methods.write().unwrap_or_else(|e| e.into_inner())
    }

    fn channels(&self) -> RwLockReadGuard<'_, HashMap<String, Channel>> {
        self.channels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn channels_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Channel>> {
        self.channels.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(RpcError::InvalidDefinition {
            name: name.to_string(),
            message: "expected a non-empty name".to_string(),
        });
    }

    if name.starts_with(RpcConfig::RESERVED_PREFIX) {
        return Err(RpcError::InvalidDefinition {
            name: name.to_string(),
            message: format!("names starting with {:?} are reserved", RpcConfig::RESERVED_PREFIX),
        });
    }

    Ok(())
}
