//! Configuration for partition exchange and local partitions.
//!
//! Both structs can be built from code (`Default`), deserialized, or parsed
//! from the command line / `PARTEX_*` environment variables via `clap`.

use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

/// Exchange coordination settings.
#[derive(Debug, Clone, PartialEq, Eq, Args, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExchangeConfig {
    /// Network timeout; partition release is polled at twice this interval.
    #[arg(long, env = "PARTEX_NETWORK_TIMEOUT_MS", default_value_t = 5_000)]
    pub network_timeout_ms: u64,
    /// Maximum number of pending-object dumps per release wait.
    #[arg(long, env = "PARTEX_DUMP_THRESHOLD", default_value_t = 10)]
    pub dump_threshold: u32,
    /// Stop the node after repeated partition-release timeouts.
    #[arg(long, env = "PARTEX_STOP_ON_RELEASE_TIMEOUTS", default_value_t = false)]
    pub stop_on_release_timeouts: bool,
    /// Attempts to resend a full map to a late single-map sender.
    #[arg(long, env = "PARTEX_SEND_RETRY_COUNT", default_value_t = 3)]
    pub send_retry_count: u32,
    #[arg(long, env = "PARTEX_SEND_RETRY_DELAY_MS", default_value_t = 1_000)]
    pub send_retry_delay_ms: u64,
    /// Lets the coordinator compute a data-aware assignment after a server leaves.
    #[arg(long, env = "PARTEX_LATE_AFFINITY", default_value_t = true, action = clap::ArgAction::Set)]
    pub late_affinity: bool,
    /// Advertised to the cluster; rollback needs every node to support it.
    #[arg(long, env = "PARTEX_ROLLBACK_SUPPORTED", default_value_t = true, action = clap::ArgAction::Set)]
    pub rollback_supported: bool,
    /// Compress exchange messages for peers that advertise support.
    #[arg(long, env = "PARTEX_COMPRESS_MESSAGES", default_value_t = true, action = clap::ArgAction::Set)]
    pub compress_messages: bool,
}

impl ExchangeConfig {
    /// Timeout between release-wait polls.
    #[must_use]
    pub fn release_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms.saturating_mul(2))
    }

    #[must_use]
    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            network_timeout_ms: 5_000,
            dump_threshold: 10,
            stop_on_release_timeouts: false,
            send_retry_count: 3,
            send_retry_delay_ms: 1_000,
            late_affinity: true,
            rollback_supported: true,
            compress_messages: true,
        }
    }
}

/// Local partition settings.
#[derive(Debug, Clone, PartialEq, Eq, Args, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartitionConfig {
    /// Cluster-wide budget of deferred deletes, split across a group's partitions.
    #[arg(long, env = "PARTEX_DELETE_HISTORY_SIZE", default_value_t = 200_000)]
    pub delete_history_size: usize,
    /// Deferred-delete queue size for system caches.
    #[arg(long, env = "PARTEX_SYSTEM_DELETE_QUEUE_SIZE", default_value_t = 100)]
    pub system_queue_size: usize,
    /// How long a removed entry is remembered for conflict resolution.
    #[arg(long, env = "PARTEX_REMOVED_ENTRIES_TTL_MS", default_value_t = 10_000)]
    pub removed_entries_ttl_ms: u64,
    /// Backoff between eviction attempts on a reserved partition.
    #[arg(long, env = "PARTEX_EVICT_POLL_INTERVAL_MS", default_value_t = 50)]
    pub evict_poll_interval_ms: u64,
}

/// Lower bound of a partition's deferred-delete queue.
const MIN_DELETE_QUEUE_SIZE: usize = 20;

impl PartitionConfig {
    #[must_use]
    pub fn removed_entries_ttl(&self) -> Duration {
        Duration::from_millis(self.removed_entries_ttl_ms)
    }

    #[must_use]
    pub fn evict_poll_interval(&self) -> Duration {
        Duration::from_millis(self.evict_poll_interval_ms)
    }

    /// Capacity of one partition's deferred-delete queue.
    ///
    /// The history budget is divided evenly across the group's partitions,
    /// floored at 20 and rounded up to a power of two. System caches use a
    /// small fixed queue.
    #[must_use]
    pub fn delete_queue_size(&self, partitions: u32, system: bool) -> usize {
        if system {
            return self.system_queue_size;
        }
        let parts = usize::try_from(partitions.max(1)).unwrap_or(usize::MAX);
        (self.delete_history_size / parts)
            .max(MIN_DELETE_QUEUE_SIZE)
            .next_power_of_two()
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            delete_history_size: 200_000,
            system_queue_size: 100,
            removed_entries_ttl_ms: 10_000,
            evict_poll_interval_ms: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        exchange: ExchangeConfig,
        #[command(flatten)]
        partition: PartitionConfig,
    }

    #[test]
    fn exchange_config_defaults() {
        let config = ExchangeConfig::default();
        assert_eq!(config.network_timeout_ms, 5_000);
        assert_eq!(config.release_wait_timeout(), Duration::from_secs(10));
        assert_eq!(config.dump_threshold, 10);
        assert!(!config.stop_on_release_timeouts);
        assert_eq!(config.send_retry_delay(), Duration::from_secs(1));
        assert!(config.rollback_supported);
    }

    #[test]
    fn cli_defaults_match_code_defaults() {
        let cli = Cli::parse_from(["partex"]);
        assert_eq!(cli.exchange, ExchangeConfig::default());
        assert_eq!(cli.partition, PartitionConfig::default());
    }

    #[test]
    fn cli_overrides() {
        let cli = Cli::parse_from([
            "partex",
            "--network-timeout-ms",
            "250",
            "--late-affinity",
            "false",
            "--delete-history-size",
            "1000",
        ]);
        assert_eq!(cli.exchange.network_timeout_ms, 250);
        assert!(!cli.exchange.late_affinity);
        assert_eq!(cli.partition.delete_history_size, 1000);
    }

    #[test]
    fn delete_queue_size_rounds_to_power_of_two() {
        let config = PartitionConfig::default();
        // 200_000 / 1024 = 195 -> 256
        assert_eq!(config.delete_queue_size(1024, false), 256);
        // floor of 20 -> 32
        assert_eq!(config.delete_queue_size(65_535, false), 32);
        assert_eq!(config.delete_queue_size(1024, true), 100);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ExchangeConfig =
            serde_json::from_str(r#"{"networkTimeoutMs": 100}"#).unwrap();
        assert_eq!(config.network_timeout_ms, 100);
        assert_eq!(config.send_retry_count, 3);
    }
}
