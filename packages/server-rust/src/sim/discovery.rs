//! Totally ordered discovery for simulated nodes.
//!
//! A single worker applies joins, departures and custom events one at a
//! time, bumps the topology version and hands every live member the event
//! with its own membership snapshot. Members are notified from the worker
//! thread with [`ExecContext::Discovery`], so exchanges never block it. The
//! worker is an OS thread outside the runtime.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use partex_core::{EventKind, TopologyVersion};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::CacheConfig;
use crate::cluster::{CacheChangeKind, ClusterNode, CustomMessage, DiscoCache, DiscoveryEvent, DiscoveryService};
use crate::error::TransportError;
use crate::exchange::{ExchangeManager, ExecContext};

enum Command {
    Join {
        node: ClusterNode,
        manager: Weak<ExchangeManager>,
    },
    Leave {
        node_id: String,
        failed: bool,
    },
    Custom {
        from: String,
        msg: CustomMessage,
    },
}

struct Member {
    node: ClusterNode,
    manager: Weak<ExchangeManager>,
}

#[derive(Default)]
struct DiscoState {
    version: TopologyVersion,
    members: Vec<Member>,
    /// Caches started cluster-wide; joining servers start them too.
    caches: BTreeMap<String, CacheConfig>,
    events: u64,
}

/// Discovery shared by every node of a simulated cluster.
pub struct SimDiscovery {
    state: Arc<Mutex<DiscoState>>,
    tx: mpsc::UnboundedSender<Command>,
}

impl SimDiscovery {
    /// Starts the worker on its own thread; it exits once every handle is dropped.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let state = Arc::new(Mutex::new(DiscoState::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker_state = Arc::clone(&state);
        std::thread::spawn(move || run(&worker_state, rx));
        Arc::new(Self { state, tx })
    }

    fn submit(&self, cmd: Command) -> Result<(), TransportError> {
        self.tx
            .send(cmd)
            .map_err(|_| TransportError::Io("discovery worker stopped".into()))
    }

    /// Adds `node` to the ring.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] if the discovery worker is gone.
    pub fn join(&self, node: ClusterNode, manager: &Arc<ExchangeManager>) -> Result<(), TransportError> {
        self.submit(Command::Join {
            node,
            manager: Arc::downgrade(manager),
        })
    }

    /// Removes a node; `failed` distinguishes a crash from a graceful stop.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] if the discovery worker is gone.
    pub fn leave(&self, node_id: &str, failed: bool) -> Result<(), TransportError> {
        self.submit(Command::Leave {
            node_id: node_id.to_string(),
            failed,
        })
    }

    /// Discovery handle used by `node_id`'s exchange context.
    #[must_use]
    pub fn handle(self: &Arc<Self>, node_id: &str) -> SimDiscoveryHandle {
        SimDiscoveryHandle {
            discovery: Arc::clone(self),
            node_id: node_id.to_string(),
        }
    }

    #[must_use]
    pub fn version(&self) -> TopologyVersion {
        self.state.lock().version
    }

    /// Number of events delivered so far.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.state.lock().events
    }

    /// Live members in join order.
    #[must_use]
    pub fn members(&self) -> Vec<String> {
        self.state.lock().members.iter().map(|m| m.node.id.clone()).collect()
    }

    #[must_use]
    pub fn alive(&self, node_id: &str) -> bool {
        self.state.lock().members.iter().any(|m| m.node.id == node_id)
    }
}

impl std::fmt::Debug for SimDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimDiscovery")
            .field("version", &state.version)
            .field("members", &state.members.len())
            .finish_non_exhaustive()
    }
}

/// Per-node [`DiscoveryService`] backed by [`SimDiscovery`].
#[derive(Debug, Clone)]
pub struct SimDiscoveryHandle {
    discovery: Arc<SimDiscovery>,
    node_id: String,
}

impl DiscoveryService for SimDiscoveryHandle {
    fn send_custom_event(&self, msg: CustomMessage) -> Result<(), TransportError> {
        self.discovery.submit(Command::Custom {
            from: self.node_id.clone(),
            msg,
        })
    }

    fn alive(&self, node_id: &str) -> bool {
        self.discovery.alive(node_id)
    }

    fn reconnect_supported(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

fn run(state: &Mutex<DiscoState>, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Command::Join { node, manager } => on_join(state, node, manager),
            Command::Leave { node_id, failed } => on_leave(state, &node_id, failed),
            Command::Custom { from, msg } => on_custom(state, &from, msg),
        }
    }
    debug!("discovery worker stopped");
}

/// Event plus the members to notify, captured under the state lock.
struct Delivery {
    event: DiscoveryEvent,
    version: TopologyVersion,
    nodes: Vec<ClusterNode>,
    targets: Vec<Weak<ExchangeManager>>,
}

impl Delivery {
    fn capture(state: &mut DiscoState, event: DiscoveryEvent) -> Self {
        state.events += 1;
        Self {
            version: state.version,
            nodes: state.members.iter().map(|m| m.node.clone()).collect(),
            targets: state.members.iter().map(|m| m.manager.clone()).collect(),
            event,
        }
    }

    fn deliver(self) {
        for target in &self.targets {
            let Some(manager) = target.upgrade() else { continue };
            let disco = Arc::new(DiscoCache::new(self.version, self.nodes.clone()));
            manager.on_discovery_event(self.event.clone(), disco, ExecContext::Discovery);
        }
    }
}

fn on_join(state: &Mutex<DiscoState>, node: ClusterNode, manager: Weak<ExchangeManager>) {
    let (delivery, caches) = {
        let mut st = state.lock();
        if st.members.iter().any(|m| m.node.id == node.id) {
            warn!(node = %node.id, "node already joined");
            return;
        }
        st.version = TopologyVersion::new(st.version.major + 1, 0);
        st.members.push(Member {
            node: node.clone(),
            manager: manager.clone(),
        });
        let event = DiscoveryEvent::new(EventKind::NodeJoined, node.clone(), st.version);
        let caches: Vec<CacheConfig> = st.caches.values().cloned().collect();
        (Delivery::capture(&mut st, event), caches)
    };

    if !node.client {
        if let Some(manager) = manager.upgrade() {
            for config in &caches {
                if let Err(e) = manager.registry().start_cache(config, delivery.version) {
                    warn!(node = %node.id, cache = %config.name, error = %e, "joining node failed to start cache");
                }
            }
        }
    }
    info!(node = %node.id, top_ver = %delivery.version, client = node.client, "node joined");
    delivery.deliver();
}

fn on_leave(state: &Mutex<DiscoState>, node_id: &str, failed: bool) {
    let delivery = {
        let mut st = state.lock();
        let Some(pos) = st.members.iter().position(|m| m.node.id == node_id) else {
            debug!(node = node_id, "leave for unknown node");
            return;
        };
        let member = st.members.remove(pos);
        st.version = TopologyVersion::new(st.version.major + 1, 0);
        let kind = if failed { EventKind::NodeFailed } else { EventKind::NodeLeft };
        let event = DiscoveryEvent::new(kind, member.node, st.version);
        Delivery::capture(&mut st, event)
    };
    info!(node = node_id, top_ver = %delivery.version, failed, "node left");
    delivery.deliver();
}

fn on_custom(state: &Mutex<DiscoState>, from: &str, msg: CustomMessage) {
    let delivery = {
        let mut st = state.lock();
        let Some(sender) = st.members.iter().find(|m| m.node.id == from).map(|m| m.node.clone()) else {
            debug!(node = from, "custom event from departed node dropped");
            return;
        };
        let needs_exchange = match &msg {
            CustomMessage::CacheChange(batch) => {
                for req in &batch.requests {
                    match (req.kind, &req.config) {
                        (CacheChangeKind::Start, Some(config)) if !req.client_start_only => {
                            st.caches.insert(req.cache_name.clone(), config.clone());
                        }
                        (CacheChangeKind::Stop, _) => {
                            st.caches.remove(&req.cache_name);
                        }
                        _ => {}
                    }
                }
                true
            }
            CustomMessage::AffinityChange(change) => change.exchange_needed(),
            CustomMessage::CacheChangeFailure(failure) => {
                for cache in &failure.caches {
                    st.caches.remove(cache);
                }
                false
            }
        };
        if needs_exchange {
            st.version = st.version.next_minor();
        }
        let event = DiscoveryEvent::custom(sender, st.version, msg);
        Delivery::capture(&mut st, event)
    };
    delivery.deliver();
}
