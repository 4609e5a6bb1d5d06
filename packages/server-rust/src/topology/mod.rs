//! Per-group partition topologies driven by the exchange.

pub mod client;
pub mod partition;

pub use client::ClientTopology;
pub use partition::PartitionTopology;
