//! Affinity: which nodes own which partitions at each topology version.

pub mod cache;
pub mod manager;

pub use cache::AffinityCache;
pub use manager::AffinityManager;
