//! Background clearing of renting partitions.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error};

use super::local::LocalPartition;
use crate::error::PartitionError;

/// Schedules clearing passes for partitions that could not be evicted inline.
pub trait PartitionEvictor: Send + Sync {
    fn evict_partition_async(&self, part: Arc<LocalPartition>);
}

/// Evictor running clearing passes on a tokio runtime.
///
/// A pass that finds the partition reserved is retried after `poll`; the
/// pass itself runs on the blocking pool since it walks the whole store.
#[derive(Debug, Clone)]
pub struct TaskEvictor {
    handle: Handle,
    poll: Duration,
}

impl TaskEvictor {
    #[must_use]
    pub fn new(handle: Handle, poll: Duration) -> Self {
        Self { handle, poll }
    }
}

impl PartitionEvictor for TaskEvictor {
    fn evict_partition_async(&self, part: Arc<LocalPartition>) {
        let poll = self.poll;
        self.handle.spawn(async move {
            loop {
                let p = Arc::clone(&part);
                match tokio::task::spawn_blocking(move || p.try_clear()).await {
                    Ok(Ok(true)) => break,
                    Ok(Ok(false)) => tokio::time::sleep(poll).await,
                    Ok(Err(PartitionError::NodeStopping)) => {
                        debug!(part = part.id(), "partition clearing aborted, node is stopping");
                        break;
                    }
                    Ok(Err(e)) => {
                        error!(part = part.id(), error = %e, "partition clearing failed");
                        break;
                    }
                    Err(e) => {
                        error!(part = part.id(), error = %e, "partition clearing task panicked");
                        break;
                    }
                }
            }
        });
    }
}
