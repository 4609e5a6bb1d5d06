//! Cache start/stop requests bundled into one exchange.

use crate::cluster::{CacheChangeBatch, CacheChangeKind, CacheChangeRequest, ClusterNode};

/// Cache changes carried by a cache-change custom event.
#[derive(Debug, Clone, Default)]
pub struct ExchangeActions {
    starts: Vec<CacheChangeRequest>,
    stops: Vec<CacheChangeRequest>,
}

impl ExchangeActions {
    #[must_use]
    pub fn from_batch(batch: &CacheChangeBatch) -> Self {
        let (starts, stops) = batch
            .requests
            .iter()
            .cloned()
            .partition(|r| r.kind == CacheChangeKind::Start);
        Self { starts, stops }
    }

    #[must_use]
    pub fn starts(&self) -> &[CacheChangeRequest] {
        &self.starts
    }

    #[must_use]
    pub fn stops(&self) -> &[CacheChangeRequest] {
        &self.stops
    }

    #[must_use]
    pub fn has_starts(&self) -> bool {
        !self.starts.is_empty()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.starts.is_empty() && self.stops.is_empty()
    }

    /// Every request only starts a cache on its initiating client.
    #[must_use]
    pub fn client_only(&self) -> bool {
        !self.starts.is_empty() && self.stops.is_empty() && self.starts.iter().all(|r| r.client_start_only)
    }

    /// `true` if `node` initiated any of the requests.
    #[must_use]
    pub fn initiated_by(&self, node_id: &str) -> bool {
        self.requests().any(|r| r.initiating_node_id == node_id)
    }

    /// Starts the local node takes part in: servers start every cache except
    /// client-only starts, clients start only what they asked for.
    pub fn local_starts<'a>(&'a self, local: &'a ClusterNode) -> impl Iterator<Item = &'a CacheChangeRequest> + 'a {
        self.starts.iter().filter(move |r| {
            if local.client {
                r.initiating_node_id == local.id
            } else {
                !r.client_start_only
            }
        })
    }

    /// Names of the caches this exchange tries to start.
    #[must_use]
    pub fn started_cache_names(&self) -> Vec<String> {
        self.starts.iter().map(|r| r.cache_name.clone()).collect()
    }

    pub fn requests(&self) -> impl Iterator<Item = &CacheChangeRequest> {
        self.starts.iter().chain(self.stops.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;

    fn batch(requests: Vec<CacheChangeRequest>) -> CacheChangeBatch {
        CacheChangeBatch { requests }
    }

    #[test]
    fn splits_starts_and_stops() {
        let actions = ExchangeActions::from_batch(&batch(vec![
            CacheChangeRequest::start(CacheConfig::new("a"), "n1"),
            CacheChangeRequest::stop("b", "n2"),
        ]));
        assert!(actions.has_starts());
        assert_eq!(actions.stops().len(), 1);
        assert_eq!(actions.started_cache_names(), vec!["a"]);
        assert!(actions.initiated_by("n2"));
        assert!(!actions.client_only());
        assert_eq!(actions.requests().count(), 2);
    }

    #[test]
    fn client_only_start_runs_on_initiator_only() {
        let mut req = CacheChangeRequest::start(CacheConfig::new("a"), "c1");
        req.client_start_only = true;
        let actions = ExchangeActions::from_batch(&batch(vec![req]));
        assert!(actions.client_only());

        let server = ClusterNode::server("s1", 1);
        let initiator = ClusterNode::client("c1", 2);
        let other = ClusterNode::client("c2", 3);
        assert_eq!(actions.local_starts(&server).count(), 0);
        assert_eq!(actions.local_starts(&initiator).count(), 1);
        assert_eq!(actions.local_starts(&other).count(), 0);
    }

    #[test]
    fn empty_batch() {
        let actions = ExchangeActions::from_batch(&batch(Vec::new()));
        assert!(actions.is_empty());
        assert!(!actions.client_only());
    }
}
