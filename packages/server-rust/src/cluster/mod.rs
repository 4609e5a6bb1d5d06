//! Cluster plumbing consumed by the exchange.
//!
//! Provides node and membership types, exchange wire messages and their
//! framing, collaborator traits for transport and discovery, and the
//! affinity functions.

pub mod assignment;
pub mod codec;
pub mod messages;
pub mod traits;
pub mod types;

// ---------------------------------------------------------------------------
// Re-exports: flat public API
// ---------------------------------------------------------------------------

pub use assignment::{assignment_diff, ideal_assignment, preserve_owners, Assignment};
pub use messages::{
    AffinityChangePayload, AssignmentChange, CacheChangeBatch, CacheChangeFailurePayload,
    CacheChangeKind, CacheChangeRequest, CustomMessage, ExchangeMessage, PartitionsFullPayload,
    PartitionsSinglePayload, PartitionsSingleRequestPayload,
};
pub use traits::{DiscoveryService, ExchangeTransport, FailureHandler};
pub use types::{
    ClusterNode, DiscoCache, DiscoveryEvent, ATTR_EXCHANGE_COMPRESSION, ATTR_EXCHANGE_ROLLBACK,
};
