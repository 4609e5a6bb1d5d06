//! Collaborator contracts the exchange depends on.
//!
//! The exchange never talks to sockets or the discovery ring directly; it
//! goes through these traits so the same coordinator logic runs against the
//! in-process [`sim`](crate::sim) cluster and a real network layer.

use super::messages::{CustomMessage, ExchangeMessage};
use super::types::ClusterNode;
use crate::error::TransportError;

// ---------------------------------------------------------------------------
// ExchangeTransport
// ---------------------------------------------------------------------------

/// Point-to-point delivery of exchange messages.
pub trait ExchangeTransport: Send + Sync {
    /// Sends `msg` to `node`, compressing it when `compress` is set.
    ///
    /// # Errors
    ///
    /// [`TransportError::NodeLeft`] if the node is gone; I/O and codec
    /// failures otherwise.
    fn send(&self, node: &ClusterNode, msg: &ExchangeMessage, compress: bool) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// DiscoveryService
// ---------------------------------------------------------------------------

/// Discovery-layer operations used during an exchange.
pub trait DiscoveryService: Send + Sync {
    /// Broadcasts a custom event to every node, including the sender.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be handed to discovery.
    fn send_custom_event(&self, msg: CustomMessage) -> Result<(), TransportError>;

    /// Live membership check, independent of any snapshot.
    fn alive(&self, node_id: &str) -> bool;

    /// `true` if the local node may reconnect after losing the cluster.
    fn reconnect_supported(&self) -> bool;
}

// ---------------------------------------------------------------------------
// FailureHandler
// ---------------------------------------------------------------------------

/// Last-resort reaction to a wedged exchange.
pub trait FailureHandler: Send + Sync {
    /// Stops the local node.
    fn stop_node(&self, reason: &str);
}
