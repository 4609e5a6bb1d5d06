//! Partition map exchange: one future per topology change, driven by the
//! manager that routes discovery events and exchange messages to it.

pub mod actions;
pub mod context;
pub mod future;
pub mod manager;
pub mod release;

pub use actions::ExchangeActions;
pub use context::{ExchangeContext, ExecContext, PartitionReleaseTracker};
pub use future::{ExchangeDone, ExchangeFuture, ExchangeKind};
pub use manager::ExchangeManager;
pub use release::{wait_partition_release, STOP_AFTER_TIMEOUTS};

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, OnceLock};

    use parking_lot::Mutex;
    use partex_core::TopologyVersion;
    use tokio::runtime::{Handle, Runtime};

    use super::{ExchangeContext, PartitionReleaseTracker};
    use crate::affinity::AffinityManager;
    use crate::cache::registry::test_support::registry;
    use crate::cluster::{ClusterNode, CustomMessage, DiscoveryService, ExchangeMessage, ExchangeTransport};
    use crate::config::ExchangeConfig;
    use crate::error::{ExchangeError, TransportError};
    use crate::future::GridFuture;
    use crate::sim::RecordingFailureHandler;

    /// Release tracker whose futures the test completes by hand.
    pub struct FixedRelease {
        partition: GridFuture<(), ExchangeError>,
        lock: GridFuture<(), ExchangeError>,
        dumps: AtomicU32,
    }

    impl FixedRelease {
        pub fn released() -> Self {
            Self {
                partition: GridFuture::completed(Ok(())),
                lock: GridFuture::completed(Ok(())),
                dumps: AtomicU32::new(0),
            }
        }

        pub fn stuck() -> Self {
            Self {
                partition: GridFuture::new(),
                lock: GridFuture::new(),
                dumps: AtomicU32::new(0),
            }
        }

        pub fn partition_future(&self) -> GridFuture<(), ExchangeError> {
            self.partition.clone()
        }

        pub fn lock_future(&self) -> GridFuture<(), ExchangeError> {
            self.lock.clone()
        }

        pub fn dump_requests(&self) -> u32 {
            self.dumps.load(Ordering::Relaxed)
        }
    }

    impl PartitionReleaseTracker for FixedRelease {
        fn partition_release_future(&self, _top_ver: TopologyVersion) -> GridFuture<(), ExchangeError> {
            self.partition.clone()
        }

        fn lock_release_future(&self, _top_ver: TopologyVersion) -> GridFuture<(), ExchangeError> {
            self.lock.clone()
        }

        fn remove_explicit_node_locks(&self, _node_id: &str) {}

        fn pending_objects(&self, _top_ver: TopologyVersion) -> Vec<String> {
            self.dumps.fetch_add(1, Ordering::Relaxed);
            vec!["tx-1".to_string()]
        }
    }

    /// Transport that only records what was sent, or fails every send.
    #[derive(Default)]
    pub struct RecordingTransport {
        sent: Mutex<Vec<(String, ExchangeMessage)>>,
        fail: Mutex<Option<TransportError>>,
    }

    impl RecordingTransport {
        pub fn sent(&self) -> Vec<(String, ExchangeMessage)> {
            self.sent.lock().clone()
        }

        pub fn fail_with(&self, err: TransportError) {
            *self.fail.lock() = Some(err);
        }
    }

    impl ExchangeTransport for RecordingTransport {
        fn send(&self, node: &ClusterNode, msg: &ExchangeMessage, _compress: bool) -> Result<(), TransportError> {
            if let Some(err) = self.fail.lock().clone() {
                return Err(err);
            }
            self.sent.lock().push((node.id.clone(), msg.clone()));
            Ok(())
        }
    }

    /// Discovery that keeps custom events instead of broadcasting them.
    #[derive(Default)]
    pub struct NullDiscovery {
        events: Mutex<Vec<CustomMessage>>,
        dead: Mutex<HashSet<String>>,
        reconnect: AtomicBool,
    }

    impl NullDiscovery {
        pub fn events(&self) -> Vec<CustomMessage> {
            self.events.lock().clone()
        }

        pub fn mark_dead(&self, node_id: &str) {
            self.dead.lock().insert(node_id.to_string());
        }

        pub fn set_reconnect_supported(&self, supported: bool) {
            self.reconnect.store(supported, Ordering::Relaxed);
        }
    }

    impl DiscoveryService for NullDiscovery {
        fn send_custom_event(&self, msg: CustomMessage) -> Result<(), TransportError> {
            self.events.lock().push(msg);
            Ok(())
        }

        fn alive(&self, node_id: &str) -> bool {
            !self.dead.lock().contains(node_id)
        }

        fn reconnect_supported(&self) -> bool {
            self.reconnect.load(Ordering::Relaxed)
        }
    }

    fn runtime() -> Handle {
        static RUNTIME: OnceLock<Runtime> = OnceLock::new();
        RUNTIME
            .get_or_init(|| {
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                    .expect("test runtime")
            })
            .handle()
            .clone()
    }

    /// Context plus handles on its recording collaborators.
    pub struct Harness {
        pub ctx: Arc<ExchangeContext>,
        pub transport: Arc<RecordingTransport>,
        pub discovery: Arc<NullDiscovery>,
    }

    impl Harness {
        /// Ids of nodes sent a message of the given kind.
        pub fn sent_to(&self, pred: impl Fn(&ExchangeMessage) -> bool) -> Vec<String> {
            self.transport
                .sent()
                .into_iter()
                .filter(|(_, msg)| pred(msg))
                .map(|(id, _)| id)
                .collect()
        }
    }

    fn build(
        local_node: ClusterNode,
        config: ExchangeConfig,
        release: Arc<FixedRelease>,
        failure: Arc<RecordingFailureHandler>,
    ) -> Harness {
        let registry = Arc::new(registry(&local_node.id, local_node.client));
        let affinity = Arc::new(AffinityManager::new(Arc::clone(&registry), config.late_affinity));
        let transport = Arc::new(RecordingTransport::default());
        let discovery = Arc::new(NullDiscovery::default());
        let ctx = Arc::new(ExchangeContext {
            local_node,
            config: Arc::new(config),
            registry,
            affinity,
            transport: transport.clone(),
            discovery: discovery.clone(),
            release,
            failure,
            runtime: runtime(),
        });
        Harness { ctx, transport, discovery }
    }

    /// Server-node context with a recording transport and null discovery.
    pub fn context(
        local_id: &str,
        config: ExchangeConfig,
        release: Arc<FixedRelease>,
        failure: Arc<RecordingFailureHandler>,
    ) -> Arc<ExchangeContext> {
        build(ClusterNode::server(local_id, 1), config, release, failure).ctx
    }

    /// Server node whose partitions are always released.
    pub fn harness(local_id: &str) -> Harness {
        build(
            ClusterNode::server(local_id, 1),
            ExchangeConfig::default(),
            Arc::new(FixedRelease::released()),
            Arc::new(RecordingFailureHandler::default()),
        )
    }

    /// Client node counterpart of [`harness`].
    pub fn client_harness(local_id: &str) -> Harness {
        build(
            ClusterNode::client(local_id, 1),
            ExchangeConfig::default(),
            Arc::new(FixedRelease::released()),
            Arc::new(RecordingFailureHandler::default()),
        )
    }
}
