//! Wire messages exchanged over the pub/sub transport.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Liveness status carried by every ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum EntityStatus {
    Goodbye = 0,
    Hello = 1,
}

/// One route exposed by a service version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub identity: String,
    pub url: String,
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default)]
    pub private: bool,
}

/// Rate limit an instance asks gateways to enforce for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApiLimiter {
    pub limit: f64,
    pub burst: usize,
}

/// Identity name to announced limit.
pub type ApiLimiters = HashMap<String, ApiLimiter>;

/// Hello/goodbye announcement for one service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePing {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub push_endpoint: String,
    pub status: EntityStatus,
    #[serde(default)]
    pub routes: HashMap<i32, Vec<RouteInfo>>,
    #[serde(default)]
    pub versions: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub load: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_limiters: Option<ApiLimiters>,
}

impl ServicePing {
    pub fn hello(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            push_endpoint: String::new(),
            status: EntityStatus::Hello,
            routes: HashMap::new(),
            versions: HashMap::new(),
            load: 0.0,
            prefix: None,
            api_limiters: None,
        }
    }

    pub fn goodbye(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            status: EntityStatus::Goodbye,
            ..Self::hello(name, endpoint)
        }
    }

    /// Registry key of the announcing service, namespaced by its prefix.
    pub fn service_key(&self) -> String {
        super::identity::route_key(self.prefix.as_deref(), &self.name)
    }
}

/// Presence announcement between gateway instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPing {
    pub runtime_id: String,
    pub status: EntityStatus,
}
