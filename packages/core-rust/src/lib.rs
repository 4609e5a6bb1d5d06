//! Partex Core: topology versions, exchange ids, partition maps and cache versions
//! shared by every node taking part in partition exchange.

pub mod hash;
pub mod partition;
pub mod topology;
pub mod version;

pub use partition::{PartitionFullMap, PartitionMap, PartitionState, UpdateCounters};
pub use topology::{EventKind, ExchangeId, TopologyVersion};
pub use version::{CacheVersion, ClockSource, SystemClock, VersionGenerator};
