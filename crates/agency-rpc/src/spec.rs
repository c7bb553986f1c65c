//! Parsed form of a declarative RPC spec document.
//!
//! The runtime never reads spec files itself; the hosting application parses
//! them (JSON, YAML, ...) into [`RpcSpec`] and hands the result to
//! `register_spec`.

use crate::scope::Scopes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Declared methods and events with their required scopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcSpec {
    pub version: u32,
    #[serde(default)]
    pub methods: BTreeMap<String, MethodSpec>,
    #[serde(default)]
    pub events: BTreeMap<String, EventSpec>,
}

/// Method entry of a spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSpec {
    #[serde(default)]
    pub scopes: Scopes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Event entry of a spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSpec {
    #[serde(default)]
    pub scopes: Scopes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
