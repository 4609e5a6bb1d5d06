//! Runs a small in-process cluster through joins, a cache start and a node
//! failure, then prints every node's view of the partition owners as JSON.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use partex_core::TopologyVersion;
use partex_server::sim::{wait_until, with_timeout, SimCluster};
use partex_server::{CacheConfig, ExchangeConfig, PartitionConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "In-process partition exchange simulation", long_about = None)]
struct Args {
    /// Server nodes to start
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Cache to start once every server joined
    #[arg(long, default_value = "default")]
    cache: String,

    #[arg(long, default_value_t = 64)]
    partitions: u32,

    #[arg(long, default_value_t = 1)]
    backups: u32,

    /// Kill the last server after the cache started
    #[arg(long)]
    kill_last: bool,

    /// Seconds to wait for each step to settle
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(flatten)]
    exchange: ExchangeConfig,

    #[command(flatten)]
    partition: PartitionConfig,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Partition owners per node, as each node sees them.
fn owners(cluster: &SimCluster, cache: &str, partitions: u32) -> BTreeMap<String, BTreeMap<u32, Vec<String>>> {
    cluster
        .nodes()
        .iter()
        .filter_map(|node| {
            let full = node.full_map(cache)?;
            let view = (0..partitions).map(|p| (p, full.owners(p))).collect();
            Some((node.id().to_string(), view))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    if args.nodes == 0 {
        bail!("--nodes must be at least 1");
    }
    let timeout = Duration::from_secs(args.timeout_secs);

    let cluster = SimCluster::new(tokio::runtime::Handle::current(), args.exchange, args.partition);
    for i in 1..=args.nodes {
        cluster.start_node(&format!("n{i}"))?;
    }
    let joined = TopologyVersion::new(u64::try_from(args.nodes)?, 0);
    if !cluster.wait_for_version(joined, timeout).await {
        bail!("cluster did not settle after joins");
    }
    info!(nodes = args.nodes, top_ver = %cluster.topology_version(), "all servers joined");

    let config = CacheConfig::new(args.cache.clone())
        .with_partitions(args.partitions)
        .with_backups(args.backups);
    let request = cluster.start_cache("n1", config)?;
    with_timeout(timeout, request.wait())
        .await
        .context("cache start timed out")??;
    if !cluster.await_settled(timeout).await {
        bail!("cluster did not settle after cache start");
    }
    info!(cache = %args.cache, top_ver = %cluster.topology_version(), "cache started");

    if args.kill_last && args.nodes > 1 {
        let victim = format!("n{}", args.nodes);
        cluster.kill_node(&victim)?;
        let discovery = cluster.discovery();
        if !wait_until(timeout, || !discovery.alive(&victim)).await || !cluster.await_settled(timeout).await {
            bail!("cluster did not settle after {victim} failed");
        }
        info!(node = %victim, top_ver = %cluster.topology_version(), "node failed and cluster settled");
    }

    let view = owners(&cluster, &args.cache, args.partitions);
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
