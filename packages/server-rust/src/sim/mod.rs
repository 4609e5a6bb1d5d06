//! In-process cluster simulation.
//!
//! Wires real [`ExchangeManager`](crate::exchange::ExchangeManager)s
//! together through an in-memory network and a totally ordered discovery
//! service. Used by the `partex-sim` binary and by multi-node tests.

mod cluster;
mod discovery;
mod network;
mod release;

pub use cluster::{wait_until, with_timeout, SimCluster, SimNode};
pub use discovery::{SimDiscovery, SimDiscoveryHandle};
pub use network::{DeliveryMode, Envelope, SimNetwork, SimTransport};
pub use release::{OperationGuard, RecordingFailureHandler, SimReleaseTracker};
