//! Waiting for in-flight operations to drain before partition maps are exchanged.

use std::time::Instant;

use partex_core::TopologyVersion;
use tracing::{error, info, warn};

use super::context::ExchangeContext;
use crate::error::ExchangeError;
use crate::future::GridFuture;

/// Timeouts tolerated before the node is stopped, when that is enabled.
pub const STOP_AFTER_TIMEOUTS: u32 = 3;

struct ReleaseWait<'a> {
    ctx: &'a ExchangeContext,
    top_ver: TopologyVersion,
    dumps: u32,
    timeouts: u32,
}

impl ReleaseWait<'_> {
    fn wait(&mut self, what: &str, fut: &GridFuture<(), ExchangeError>) -> Result<(), ExchangeError> {
        let timeout = self.ctx.config.release_wait_timeout();
        let started = Instant::now();
        loop {
            match fut.wait_timeout(timeout) {
                Some(Ok(())) => {
                    let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    info!(top_ver = %self.top_ver, what, waited_ms, "released");
                    return Ok(());
                }
                Some(Err(e)) => return Err(ExchangeError::PartitionRelease(e.to_string())),
                None => self.on_timeout(what)?,
            }
        }
    }

    fn on_timeout(&mut self, what: &str) -> Result<(), ExchangeError> {
        self.timeouts += 1;
        if self.dumps < self.ctx.config.dump_threshold {
            self.dumps += 1;
            let pending = self.ctx.release.pending_objects(self.top_ver);
            warn!(
                top_ver = %self.top_ver,
                what,
                timeouts = self.timeouts,
                pending = ?pending,
                "failed to wait for release, dumping pending objects"
            );
        }

        if self.ctx.config.stop_on_release_timeouts && self.timeouts >= STOP_AFTER_TIMEOUTS {
            let reason = format!(
                "{what} release not finished after {} timeouts on topology {}",
                self.timeouts, self.top_ver
            );
            error!(top_ver = %self.top_ver, timeouts = self.timeouts, "exchange is stuck waiting for release, stopping node");
            self.ctx.failure.stop_node(&reason);
            return Err(ExchangeError::PartitionRelease(reason));
        }
        Ok(())
    }
}

/// Blocks until operations and explicit locks from older topologies are released.
///
/// Each wait is polled at twice the network timeout; every timeout dumps the
/// pending objects (up to the configured threshold).
///
/// # Errors
///
/// [`ExchangeError::PartitionRelease`] if a release future fails or the node
/// is stopped after repeated timeouts.
pub fn wait_partition_release(ctx: &ExchangeContext, top_ver: TopologyVersion) -> Result<(), ExchangeError> {
    let mut wait = ReleaseWait {
        ctx,
        top_ver,
        dumps: 0,
        timeouts: 0,
    };
    wait.wait("partition", &ctx.release.partition_release_future(top_ver))?;
    wait.wait("lock", &ctx.release.lock_release_future(top_ver))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::ExchangeConfig;
    use crate::exchange::test_support::{context, FixedRelease};
    use crate::sim::RecordingFailureHandler;

    fn fast_config(stop: bool) -> ExchangeConfig {
        ExchangeConfig {
            network_timeout_ms: 5,
            dump_threshold: 2,
            stop_on_release_timeouts: stop,
            ..ExchangeConfig::default()
        }
    }

    #[test]
    fn completed_futures_pass_through() {
        let failure = Arc::new(RecordingFailureHandler::default());
        let release = Arc::new(FixedRelease::released());
        let ctx = context("n1", fast_config(true), release, failure.clone());
        assert!(wait_partition_release(&ctx, TopologyVersion::new(2, 0)).is_ok());
        assert!(failure.reasons().is_empty());
    }

    #[test]
    fn stuck_release_stops_node_after_repeated_timeouts() {
        let failure = Arc::new(RecordingFailureHandler::default());
        let release = Arc::new(FixedRelease::stuck());
        let ctx = context("n1", fast_config(true), release.clone(), failure.clone());

        let err = wait_partition_release(&ctx, TopologyVersion::new(2, 0)).unwrap_err();
        assert!(matches!(err, ExchangeError::PartitionRelease(_)));
        assert_eq!(failure.reasons().len(), 1);
        // Dumps are capped by the threshold even though three timeouts happened.
        assert_eq!(release.dump_requests(), 2);
    }

    #[test]
    fn release_completed_late_is_observed() {
        let failure = Arc::new(RecordingFailureHandler::default());
        let release = Arc::new(FixedRelease::stuck());
        let ctx = context("n1", fast_config(false), release.clone(), failure.clone());

        let fut = release.partition_future();
        let completer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(40));
            fut.on_done(Ok(()));
        });
        release.lock_future().on_done(Ok(()));

        assert!(wait_partition_release(&ctx, TopologyVersion::new(2, 0)).is_ok());
        completer.join().unwrap();
        assert!(failure.reasons().is_empty());
    }

    #[test]
    fn failed_release_future_fails_the_wait() {
        let failure = Arc::new(RecordingFailureHandler::default());
        let release = Arc::new(FixedRelease::stuck());
        release.partition_future().on_done(Err(ExchangeError::NodeStopping));
        let ctx = context("n1", fast_config(false), release, failure);
        assert!(matches!(
            wait_partition_release(&ctx, TopologyVersion::new(2, 0)),
            Err(ExchangeError::PartitionRelease(_))
        ));
    }
}
