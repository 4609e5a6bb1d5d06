//! Error taxonomy for partitions, data stores, transport and exchanges.
//!
//! All errors are `Clone`: a completed [`GridFuture`](crate::future::GridFuture)
//! hands the same result to every waiter.

use partex_core::PartitionState;

use crate::future::ReconnectFuture;

/// Errors from the partition data store SPI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create data store for partition {partition}: {reason}")]
    Create { partition: u32, reason: String },
    #[error("data store for partition {partition} is destroyed")]
    Destroyed { partition: u32 },
    #[error("data store failure: {0}")]
    Io(String),
}

/// Errors from local partition operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("partition {partition} cannot move from {from} to {to}")]
    IllegalTransition {
        partition: u32,
        from: PartitionState,
        to: PartitionState,
    },
    #[error("partition {partition} is not renting (state: {state})")]
    NotRenting {
        partition: u32,
        state: PartitionState,
    },
    #[error("timed out after {timeout_ms}ms waiting for partition {partition} to clear")]
    ClearTimeout { partition: u32, timeout_ms: u64 },
    #[error("node is stopping")]
    NodeStopping,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from sending exchange messages or custom discovery events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("node {node_id} left the topology")]
    NodeLeft { node_id: String },
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("client node disconnected from the cluster")]
    ClientDisconnected,
    #[error("message codec failure: {0}")]
    Codec(String),
}

/// Errors that complete an exchange future.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// The local node must reconnect before it can take part in exchanges again.
    #[error("node {node_id} must reconnect: {reason}")]
    NeedReconnect { node_id: String, reason: String },
    #[error("I/O failure during exchange: {0}")]
    Io(String),
    #[error("client node disconnected during exchange")]
    ClientDisconnected,
    #[error("failed to start cache {cache}: {reason}")]
    CacheStart { cache: String, reason: String },
    #[error("cache {cache} failed validation: {reason}")]
    Validation { cache: String, reason: String },
    /// Errors collected from several nodes during one exchange.
    #[error("{message} ({} node errors)", errors.len())]
    Aggregated {
        message: String,
        errors: Vec<(String, String)>,
    },
    /// Rollback broadcast received for a failed cache change.
    #[error("cache change failed for {caches:?}: {reason}")]
    CacheChangeFailed { caches: Vec<String>, reason: String },
    #[error("failed waiting for partition release: {0}")]
    PartitionRelease(String),
    #[error("node is stopping")]
    NodeStopping,
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error("internal exchange failure: {0}")]
    Internal(String),
}

impl From<TransportError> for ExchangeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(msg) => ExchangeError::Io(msg),
            TransportError::ClientDisconnected => ExchangeError::ClientDisconnected,
            TransportError::NodeLeft { node_id } => {
                ExchangeError::Io(format!("node {node_id} left the topology"))
            }
            TransportError::Codec(msg) => ExchangeError::Internal(msg),
        }
    }
}

impl ExchangeError {
    /// `true` for I/O and client-disconnect failures, the errors a reconnect can cure.
    #[must_use]
    pub fn is_reconnect_candidate(&self) -> bool {
        matches!(self, ExchangeError::Io(_) | ExchangeError::ClientDisconnected)
    }
}

/// Conditions a cache operation observes at the gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("cache {cache} is stopped")]
    Stopped { cache: String },
    /// The client node lost the cluster; `reconnect` completes once it is back.
    #[error("client node disconnected, cache {cache} is unavailable until reconnect")]
    Disconnected {
        cache: String,
        reconnect: ReconnectFuture,
    },
}

/// Errors returned by cache operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    /// The last exchange left the cache invalid (e.g. a topology validator failed).
    #[error(transparent)]
    Invalid(ExchangeError),
    #[error("partition {partition} of cache {cache} is not available locally")]
    PartitionUnavailable { cache: String, partition: u32 },
    #[error("cache {0} is not started")]
    NoSuchCache(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_onto_exchange_errors() {
        let io: ExchangeError = TransportError::Io("reset".into()).into();
        assert!(io.is_reconnect_candidate());

        let left: ExchangeError = TransportError::NodeLeft {
            node_id: "n2".into(),
        }
        .into();
        assert!(left.is_reconnect_candidate());

        let codec: ExchangeError = TransportError::Codec("bad frame".into()).into();
        assert!(!codec.is_reconnect_candidate());
    }

    #[test]
    fn aggregated_error_reports_node_count() {
        let err = ExchangeError::Aggregated {
            message: "failed to start caches".into(),
            errors: vec![("a".into(), "x".into()), ("b".into(), "y".into())],
        };
        assert_eq!(err.to_string(), "failed to start caches (2 node errors)");
    }

    #[test]
    fn partition_error_wraps_store_error() {
        let err: PartitionError = StoreError::Destroyed { partition: 3 }.into();
        assert_eq!(err.to_string(), "data store for partition 3 is destroyed");
    }
}
