//! Exchange wire messages and discovery custom events.
//!
//! Node-to-node exchange traffic uses [`ExchangeMessage`]; cluster-wide
//! broadcasts travel through discovery as [`CustomMessage`]. Both use the
//! `MsgPack` named encoding from [`super::codec`].

use std::collections::BTreeMap;

use partex_core::{CacheVersion, ExchangeId, PartitionFullMap, PartitionMap, UpdateCounters};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::CacheConfig;

/// Group id -> partition id -> ordered owners (primary first).
pub type AssignmentChange = BTreeMap<i32, BTreeMap<u32, Vec<String>>>;

// ---------------------------------------------------------------------------
// Exchange messages
// ---------------------------------------------------------------------------

/// Node-to-node exchange message.
///
/// Internally tagged on `"type"` with `SCREAMING_SNAKE_CASE` variant names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeMessage {
    /// Node -> coordinator: the sender's local partition maps.
    PartitionsSingle(PartitionsSinglePayload),
    /// Coordinator -> nodes: the merged partition maps.
    PartitionsFull(PartitionsFullPayload),
    /// New coordinator -> node: please resend your single map.
    PartitionsSingleRequest(PartitionsSingleRequestPayload),
}

impl ExchangeMessage {
    /// Exchange this message belongs to, if any.
    #[must_use]
    pub fn exchange_id(&self) -> Option<&ExchangeId> {
        match self {
            ExchangeMessage::PartitionsSingle(p) => Some(&p.exchange_id),
            ExchangeMessage::PartitionsFull(p) => p.exchange_id.as_ref(),
            ExchangeMessage::PartitionsSingleRequest(p) => Some(&p.exchange_id),
        }
    }
}

/// Per-group partition maps of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionsSinglePayload {
    pub exchange_id: ExchangeId,
    /// Highest cache version the sender has generated or seen.
    pub last_version: Option<CacheVersion>,
    pub client: bool,
    pub partitions: BTreeMap<i32, PartitionMap>,
    pub update_counters: BTreeMap<i32, UpdateCounters>,
    /// Local exchange initialization failure, reported for rollback.
    pub error: Option<String>,
}

/// Coordinator's merged partition maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionsFullPayload {
    /// `None` when attached to a centralized affinity change.
    pub exchange_id: Option<ExchangeId>,
    pub last_version: Option<CacheVersion>,
    pub partitions: BTreeMap<i32, PartitionFullMap>,
    pub update_counters: BTreeMap<i32, UpdateCounters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionsSingleRequestPayload {
    pub exchange_id: ExchangeId,
}

// ---------------------------------------------------------------------------
// Custom discovery events
// ---------------------------------------------------------------------------

/// Cluster-wide message delivered through discovery, in the same order on every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CustomMessage {
    /// Dynamic cache start/stop requests.
    CacheChange(CacheChangeBatch),
    /// Affinity assignment change, either a coordinator's reply to a
    /// centralized exchange or a standalone switch that needs its own exchange.
    AffinityChange(AffinityChangePayload),
    /// Broadcast by the coordinator to roll back a failed cache start.
    CacheChangeFailure(CacheChangeFailurePayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheChangeKind {
    Start,
    Stop,
}

/// One dynamic cache start or stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheChangeRequest {
    pub request_id: Uuid,
    pub cache_name: String,
    pub kind: CacheChangeKind,
    /// Present for starts.
    pub config: Option<CacheConfig>,
    pub initiating_node_id: String,
    /// Start only on the initiating client node; servers already run the cache.
    pub client_start_only: bool,
}

impl CacheChangeRequest {
    #[must_use]
    pub fn start(config: CacheConfig, initiating_node_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            cache_name: config.name.clone(),
            kind: CacheChangeKind::Start,
            config: Some(config),
            initiating_node_id: initiating_node_id.into(),
            client_start_only: false,
        }
    }

    #[must_use]
    pub fn stop(cache_name: impl Into<String>, initiating_node_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            cache_name: cache_name.into(),
            kind: CacheChangeKind::Stop,
            config: None,
            initiating_node_id: initiating_node_id.into(),
            client_start_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheChangeBatch {
    pub requests: Vec<CacheChangeRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffinityChangePayload {
    /// Exchange being answered; `None` for a standalone switch.
    pub exchange_id: Option<ExchangeId>,
    /// Full maps attached by the coordinator of a centralized exchange.
    pub partitions: Option<PartitionsFullPayload>,
    pub assignment_change: AssignmentChange,
}

impl AffinityChangePayload {
    /// A standalone switch starts its own exchange.
    #[must_use]
    pub fn exchange_needed(&self) -> bool {
        self.exchange_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheChangeFailurePayload {
    pub origin_node_id: String,
    pub exchange_id: ExchangeId,
    pub caches: Vec<String>,
    pub reason: String,
    /// Node id -> local failure.
    pub errors: Vec<(String, String)>,
}
