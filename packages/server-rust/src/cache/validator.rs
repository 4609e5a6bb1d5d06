//! Extension points consulted by the exchange: validators and per-cache hooks.

use partex_core::{ExchangeId, TopologyVersion};

use super::config::CacheConfig;
use super::context::CacheContext;
use crate::cluster::ClusterNode;

/// Decides whether a cache may be written to on the topology an exchange produced.
pub trait TopologyValidator: Send + Sync {
    /// `nodes` are the server nodes of the new topology.
    fn validate(&self, nodes: &[ClusterNode]) -> bool;
}

/// Requires a minimum number of server nodes.
#[derive(Debug, Clone, Copy)]
pub struct MinServerNodes(pub usize);

impl TopologyValidator for MinServerNodes {
    fn validate(&self, nodes: &[ClusterNode]) -> bool {
        nodes.len() >= self.0
    }
}

/// Registry-wide validator that can veto a cache with a custom reason.
pub trait CacheValidator: Send + Sync {
    fn validate(&self, cache: &str, nodes: &[ClusterNode]) -> Option<String>;
}

/// Callbacks around cache starts and exchanges.
pub trait CacheExchangeHooks: Send + Sync {
    /// Runs before a cache is started by an exchange; an error fails the start.
    ///
    /// # Errors
    ///
    /// The reason the cache must not start.
    fn before_cache_start(&self, _config: &CacheConfig) -> Result<(), String> {
        Ok(())
    }

    /// Runs once in-flight operations drained, before partition maps are exchanged.
    fn before_exchange(&self, _exch_id: &ExchangeId) {}

    /// Runs for every started cache after a successful exchange.
    fn on_exchange_done(&self, _cache: &CacheContext, _top_ver: TopologyVersion) {}
}

#[derive(Debug, Default)]
pub struct NoopHooks;

impl CacheExchangeHooks for NoopHooks {}
