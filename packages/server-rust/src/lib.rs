//! Partex Server: local partitions, partition map exchange and the cache gateway.
//!
//! Every topology change (node join, leave or failure, cache start or stop)
//! runs one exchange: nodes drain in-flight operations, send their local
//! partition maps to the coordinator and apply the full map it broadcasts.

pub mod affinity;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod exchange;
pub mod future;
pub mod gateway;
pub mod partition;
pub mod sim;
pub mod topology;

pub use cache::{CacheConfig, CacheContext, CacheRegistry};
pub use config::{ExchangeConfig, PartitionConfig};
pub use error::{CacheError, ExchangeError, GatewayError, PartitionError, StoreError, TransportError};
pub use exchange::{ExchangeContext, ExchangeFuture, ExchangeManager, ExecContext};
pub use future::{GridFuture, ReconnectFuture};
pub use gateway::CacheGateway;
pub use partition::{CacheGroup, LocalPartition};
