//! NAT PBA pool utilization report
//!
//! One-shot operational tool: query a device for Port-Block Allocation pool
//! state, aggregate it, print a utilization report, exit.
//!
//! Run flow:
//! 1. Connect to the device and detect chassis cluster mode
//! 2. List PBA-enabled pools, pick one (auto when only one exists)
//! 3. Guard against oversized pools (--max-blocks cap)
//! 4. Fetch the pool's block records into a snapshot
//! 5. Aggregate and print (text or --json)
//!
//! Usage:
//!   pba-stat -d 192.0.2.1:830
//!   pba-stat -d 192.0.2.1:830 --nat-pool pool1 --port-threshold 1000
//!   pba-stat -d 192.0.2.1:830 --node 0 --trace time

use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod device;
mod report;
mod snapshot;
mod stats;
mod trace;

use device::Device;
use stats::Statistics;
use trace::TimeTrace;

/// Refuse pools with more allocated blocks than this unless overridden -
/// keeps a huge snapshot from exhausting device resources and our memory.
const DEFAULT_MAX_BLOCKS: u64 = 10000;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TraceKind {
    /// Record wall-clock checkpoints and print them after the report
    Time,
}

#[derive(Parser, Debug)]
#[command(name = "pba-stat")]
#[command(version)]
#[command(about = "NAT Port-Block Allocation pool utilization report")]
struct Args {
    /// Device management address (host:port)
    #[arg(short, long)]
    device: String,

    /// NAT pool to report on (required when multiple PBA pools exist)
    #[arg(long)]
    nat_pool: Option<String>,

    /// Only list hosts with at least this many ports in use
    #[arg(long)]
    port_threshold: Option<i64>,

    /// Refuse to aggregate when the pool has more allocated blocks than this
    #[arg(long, default_value_t = DEFAULT_MAX_BLOCKS)]
    max_blocks: u64,

    /// Chassis cluster node to query [0|1], required on clustered devices
    #[arg(long)]
    node: Option<String>,

    /// RPC timeout in seconds
    #[arg(long, default_value_t = DEFAULT_RPC_TIMEOUT_SECS)]
    timeout: u64,

    /// Diagnostic tracing
    #[arg(long, value_enum)]
    trace: Option<TraceKind>,

    /// Emit the report as JSON instead of text
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    // configuration errors surface before any device traffic
    if let Some(threshold) = args.port_threshold {
        if threshold <= 0 {
            bail!("port-threshold must be > 0");
        }
    }

    let mut time_trace = TimeTrace::new(matches!(args.trace, Some(TraceKind::Time)));
    time_trace.mark("start");

    let rpc_timeout = Duration::from_secs(args.timeout);
    let mut device = Device::connect(&args.device, rpc_timeout).await?;

    let cluster_mode = device.cluster_mode().await?;
    debug!("Cluster mode: {}", cluster_mode.as_str());

    let node = if cluster_mode.is_clustered() {
        match args.node.as_deref() {
            Some(node @ ("0" | "1")) => Some(node),
            _ => bail!("Specify chassis cluster node [0|1]"),
        }
    } else {
        if args.node.is_some() {
            warn!("--node ignored: device is standalone");
        }
        None
    };

    let pools = device.list_pba_pools().await?;
    time_trace.mark("nat_pools_info");

    if pools.is_empty() {
        bail!("No PBA enabled pool found");
    }

    let pool_name = match args.nat_pool {
        Some(name) => {
            if !pools.contains_key(&name) {
                bail!(
                    "No such PBA NAT pool: {}, available PBA pools: {}",
                    name,
                    pool_names(&pools)
                );
            }
            name
        }
        None if pools.len() == 1 => pools.keys().next().cloned().unwrap_or_default(),
        None => bail!(
            "More than one PBA enabled pool found: {}. Use --nat-pool [pool-name]",
            pool_names(&pools)
        ),
    };
    let meta = pools[&pool_name];
    info!("Pool: {} (block size {})", pool_name, meta.block_size);

    // capacity guard before the expensive per-block query
    if meta.blocks_used > args.max_blocks {
        bail!(
            "Used blocks {} is above limit of {}, tune --max-blocks according to device resources",
            meta.blocks_used,
            args.max_blocks
        );
    }

    let snapshot = device
        .fetch_snapshot(&pool_name, meta, cluster_mode, node)
        .await?;
    time_trace.mark("fetch_snapshot");

    let Some(statistics) = Statistics::aggregate(&snapshot) else {
        // valid pool, nothing allocated - not an error
        println!("No PBA records in NAT pool: {}", pool_name);
        return Ok(());
    };
    time_trace.mark("aggregate");

    let capacity = stats::capacity(&meta, cluster_mode, statistics.allocated_blocks())?;

    let threshold_hosts = args
        .port_threshold
        .map(|threshold| stats::hosts_over_threshold(&statistics, threshold))
        .transpose()?;
    time_trace.mark("analyze");

    if args.json {
        let doc = json!({
            "pool": pool_name,
            "cluster_mode": cluster_mode,
            "meta": meta,
            "statistics": statistics,
            "capacity": capacity,
            "hosts_over_threshold": threshold_hosts
                .as_deref()
                .map(|hosts| hosts
                    .iter()
                    .map(|(host, ports)| json!({"host": host, "ports_used": ports}))
                    .collect::<Vec<_>>()),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        print!(
            "{}",
            report::render(
                &statistics,
                &capacity,
                &meta,
                cluster_mode,
                threshold_hosts.as_deref(),
                &time_trace,
            )
        );
    }

    Ok(())
}

fn pool_names(pools: &std::collections::BTreeMap<String, snapshot::PoolMeta>) -> String {
    pools.keys().cloned().collect::<Vec<_>>().join(", ")
}
