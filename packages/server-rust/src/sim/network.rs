//! In-memory point-to-point network between simulated nodes.
//!
//! Every message is framed with the real codec so compression and
//! serialization are exercised. In [`DeliveryMode::Auto`] frames are
//! delivered on the blocking pool as soon as they are sent; in
//! [`DeliveryMode::Held`] they queue until a test releases them, which is
//! how scenarios reorder or drop traffic.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use partex_core::ExchangeId;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::cluster::{codec, ClusterNode, ExchangeMessage, ExchangeTransport};
use crate::error::TransportError;
use crate::exchange::ExchangeManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Auto,
    Held,
}

/// A framed message in transit.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: ClusterNode,
    pub to: String,
    pub kind: &'static str,
    pub exch_id: Option<ExchangeId>,
    pub compressed: bool,
    frame: Bytes,
}

impl Envelope {
    fn new(from: &ClusterNode, to: &ClusterNode, msg: &ExchangeMessage, frame: Bytes) -> Self {
        let kind = match msg {
            ExchangeMessage::PartitionsSingle(_) => "single",
            ExchangeMessage::PartitionsFull(_) => "full",
            ExchangeMessage::PartitionsSingleRequest(_) => "single-request",
        };
        Self {
            from: from.clone(),
            to: to.id.clone(),
            kind,
            exch_id: msg.exchange_id().cloned(),
            compressed: codec::is_compressed(&frame),
            frame,
        }
    }

    /// Decodes the carried message.
    ///
    /// # Errors
    ///
    /// [`TransportError::Codec`] if the frame is corrupt.
    pub fn message(&self) -> Result<ExchangeMessage, TransportError> {
        codec::decode(&self.frame)
    }
}

struct NetworkState {
    mode: DeliveryMode,
    endpoints: HashMap<String, Weak<ExchangeManager>>,
    held: Vec<Envelope>,
    sent: Vec<Envelope>,
}

/// Shared network all simulated transports send through.
pub struct SimNetwork {
    state: Mutex<NetworkState>,
    runtime: Handle,
}

impl SimNetwork {
    #[must_use]
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetworkState {
                mode: DeliveryMode::Auto,
                endpoints: HashMap::new(),
                held: Vec::new(),
                sent: Vec::new(),
            }),
            runtime,
        })
    }

    pub fn register(&self, node_id: &str, manager: &Arc<ExchangeManager>) {
        self.state
            .lock()
            .endpoints
            .insert(node_id.to_string(), Arc::downgrade(manager));
    }

    /// Detaches a node; later sends to it fail with `NodeLeft`.
    pub fn unregister(&self, node_id: &str) {
        self.state.lock().endpoints.remove(node_id);
    }

    pub fn set_mode(&self, mode: DeliveryMode) {
        self.state.lock().mode = mode;
    }

    /// Every envelope ever sent, in send order.
    #[must_use]
    pub fn sent(&self) -> Vec<Envelope> {
        self.state.lock().sent.clone()
    }

    #[must_use]
    pub fn held(&self) -> Vec<Envelope> {
        self.state.lock().held.clone()
    }

    fn send(&self, from: &ClusterNode, to: &ClusterNode, msg: &ExchangeMessage, compress: bool) -> Result<(), TransportError> {
        let frame = codec::encode(msg, compress)?;
        let envelope = Envelope::new(from, to, msg, frame);

        let mut state = self.state.lock();
        if !state.endpoints.contains_key(&to.id) {
            return Err(TransportError::NodeLeft { node_id: to.id.clone() });
        }
        state.sent.push(envelope.clone());
        let mode = state.mode;
        match mode {
            DeliveryMode::Held => state.held.push(envelope),
            DeliveryMode::Auto => {
                drop(state);
                let target = self.endpoint(&envelope.to);
                self.runtime.spawn_blocking(move || Self::deliver_to(target, &envelope));
            }
        }
        Ok(())
    }

    fn endpoint(&self, node_id: &str) -> Option<Arc<ExchangeManager>> {
        self.state.lock().endpoints.get(node_id).and_then(Weak::upgrade)
    }

    fn deliver_to(target: Option<Arc<ExchangeManager>>, envelope: &Envelope) {
        let Some(manager) = target else {
            debug!(to = %envelope.to, kind = envelope.kind, "dropping message for departed node");
            return;
        };
        match envelope.message() {
            Ok(msg) => manager.on_message(envelope.from.clone(), msg),
            Err(e) => warn!(to = %envelope.to, error = %e, "failed to decode exchange message"),
        }
    }

    /// Delivers held envelopes matching `pred` on the calling thread, in
    /// send order; returns how many were delivered.
    pub fn deliver_matching(&self, pred: impl Fn(&Envelope) -> bool) -> usize {
        let matching: Vec<Envelope> = {
            let mut state = self.state.lock();
            let (matching, rest): (Vec<Envelope>, Vec<Envelope>) =
                std::mem::take(&mut state.held).into_iter().partition(|e| pred(e));
            state.held = rest;
            matching
        };
        for envelope in &matching {
            Self::deliver_to(self.endpoint(&envelope.to), envelope);
        }
        matching.len()
    }

    pub fn deliver_held(&self) -> usize {
        self.deliver_matching(|_| true)
    }

    /// Discards held envelopes matching `pred`.
    pub fn drop_matching(&self, pred: impl Fn(&Envelope) -> bool) -> usize {
        let mut state = self.state.lock();
        let before = state.held.len();
        state.held.retain(|e| !pred(e));
        before - state.held.len()
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimNetwork")
            .field("mode", &state.mode)
            .field("endpoints", &state.endpoints.len())
            .field("held", &state.held.len())
            .finish_non_exhaustive()
    }
}

/// One node's view of the [`SimNetwork`].
#[derive(Debug, Clone)]
pub struct SimTransport {
    network: Arc<SimNetwork>,
    local: ClusterNode,
}

impl SimTransport {
    #[must_use]
    pub fn new(network: Arc<SimNetwork>, local: ClusterNode) -> Self {
        Self { network, local }
    }
}

impl ExchangeTransport for SimTransport {
    fn send(&self, node: &ClusterNode, msg: &ExchangeMessage, compress: bool) -> Result<(), TransportError> {
        self.network.send(&self.local, node, msg, compress)
    }
}
