//! PBA statistics aggregation
//!
//! The core of the tool: folds the flat block records of a `PoolSnapshot`
//! into per-reflexive-IP and per-host maps, then derives cohort statistics
//! (hosts grouped by how many blocks they hold). Two strictly separated
//! passes:
//!
//! 1. Linear fold over the records (counts, sums, unique-host set)
//! 2. Cohort pass over the per-host block counts (histogram, max/avg ports)
//!
//! No I/O anywhere in this module - snapshots come in, `Statistics` goes out.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use anyhow::{bail, Result};
use serde::Serialize;

use crate::snapshot::{ClusterMode, PoolMeta, PoolSnapshot};

/// Ports available to PBA allocation per external IP (the ephemeral range
/// 1024-65535). Protocol-level constant, not configurable.
pub const PBA_PORT_RANGE: u64 = 64512;

/// Aggregated view of one pool snapshot. All maps are ordered so the report
/// is deterministic; IP keys sort numerically, never as strings.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    /// Reflexive IP -> distinct internal hosts first seen under it.
    ///
    /// "First reflexive IP wins": a host is attributed to the reflexive IP of
    /// its first record. Later blocks of the same host under a different
    /// reflexive IP still count toward that IP's block count, not its host
    /// count (assumes address-persistent or pool-paired allocation).
    pub reflexive_ip_host_count: BTreeMap<IpAddr, u64>,
    /// Reflexive IP -> total block records observed for it.
    pub reflexive_ip_block_count: BTreeMap<IpAddr, u64>,
    /// Every distinct internal host seen.
    pub unique_internal_ips: BTreeSet<IpAddr>,
    /// Internal host -> ports used summed over all its blocks.
    pub internal_ip_ports_used: BTreeMap<IpAddr, u64>,
    /// Internal host -> number of blocks it holds.
    pub internal_ip_blocks_used: BTreeMap<IpAddr, u64>,
    /// Block count -> number of hosts holding exactly that many blocks.
    pub blocks_per_host_histogram: BTreeMap<u64, u64>,
    /// Block count -> max ports used by any host in that cohort.
    pub max_ports_by_cohort: BTreeMap<u64, u64>,
    /// Block count -> average ports used in that cohort, rounded
    /// half-away-from-zero.
    pub avg_ports_by_cohort: BTreeMap<u64, u64>,
}

impl Statistics {
    /// Run both aggregation passes over a snapshot.
    ///
    /// Returns `None` for an empty snapshot so callers report "no records"
    /// instead of dividing by zero further down the pipeline.
    pub fn aggregate(snapshot: &PoolSnapshot) -> Option<Self> {
        if snapshot.records.is_empty() {
            return None;
        }

        let mut stats = Statistics {
            reflexive_ip_host_count: BTreeMap::new(),
            reflexive_ip_block_count: BTreeMap::new(),
            unique_internal_ips: BTreeSet::new(),
            internal_ip_ports_used: BTreeMap::new(),
            internal_ip_blocks_used: BTreeMap::new(),
            blocks_per_host_histogram: BTreeMap::new(),
            max_ports_by_cohort: BTreeMap::new(),
            avg_ports_by_cohort: BTreeMap::new(),
        };

        // Pass 1: linear fold over the block records
        for record in &snapshot.records {
            if stats.unique_internal_ips.insert(record.internal_ip) {
                // first time we see this host - attribute it to this reflexive IP
                *stats
                    .reflexive_ip_host_count
                    .entry(record.reflexive_ip)
                    .or_insert(0) += 1;
            }
            *stats
                .reflexive_ip_block_count
                .entry(record.reflexive_ip)
                .or_insert(0) += 1;
            *stats
                .internal_ip_ports_used
                .entry(record.internal_ip)
                .or_insert(0) += record.ports_used;
            *stats
                .internal_ip_blocks_used
                .entry(record.internal_ip)
                .or_insert(0) += 1;
        }

        // Pass 2: cohorts keyed by per-host block count
        for &blocks in stats.internal_ip_blocks_used.values() {
            *stats.blocks_per_host_histogram.entry(blocks).or_insert(0) += 1;
        }

        for &cohort in stats.blocks_per_host_histogram.keys() {
            let mut max_ports = 0u64;
            let mut sum_ports = 0u64;
            let mut hosts = 0u64;
            for (host, &blocks) in &stats.internal_ip_blocks_used {
                if blocks == cohort {
                    let ports = stats.internal_ip_ports_used[host];
                    max_ports = max_ports.max(ports);
                    sum_ports += ports;
                    hosts += 1;
                }
            }
            // cohort came from the histogram, so hosts >= 1 here
            stats.max_ports_by_cohort.insert(cohort, max_ports);
            stats
                .avg_ports_by_cohort
                .insert(cohort, (sum_ports as f64 / hosts as f64).round() as u64);
        }

        Some(stats)
    }

    /// Total allocated blocks across the pool (sum of per-reflexive-IP block
    /// counts - equal to the record count by construction).
    pub fn allocated_blocks(&self) -> u64 {
        self.reflexive_ip_block_count.values().sum()
    }

    /// Total ports in use across all hosts.
    pub fn total_ports_used(&self) -> u64 {
        self.internal_ip_ports_used.values().sum()
    }
}

/// Pool capacity and utilization derived from pool metadata and cluster mode.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CapacityReport {
    /// Blocks one external IP can hold
    pub per_ip_capacity: u64,
    /// Same, divided between nodes for A/A clusters
    pub per_node_capacity: u64,
    /// Pool block total available to one node
    pub total_blocks_per_node: u64,
    /// Blocks currently allocated
    pub allocated_blocks: u64,
    /// allocated / per-node total, percent, 1 decimal
    pub utilization_pct: f64,
}

/// Compute capacity figures for a pool.
///
/// Guarded against zero block size and a zero utilization denominator - both
/// are device-config anomalies that must surface as errors, not panics.
pub fn capacity(
    meta: &PoolMeta,
    cluster_mode: ClusterMode,
    allocated_blocks: u64,
) -> Result<CapacityReport> {
    if meta.block_size == 0 {
        bail!("pool reports block size 0, cannot compute capacity");
    }

    let divisor = cluster_mode.node_divisor();
    let per_ip_capacity = PBA_PORT_RANGE / meta.block_size;
    let per_node_capacity = per_ip_capacity / divisor;
    let total_blocks_per_node = meta.blocks_total / divisor;

    if total_blocks_per_node == 0 {
        bail!(
            "pool reports {} total blocks ({} per node), cannot compute utilization",
            meta.blocks_total,
            total_blocks_per_node
        );
    }

    let utilization_pct =
        ((allocated_blocks as f64 / total_blocks_per_node as f64) * 1000.0).round() / 10.0;

    Ok(CapacityReport {
        per_ip_capacity,
        per_node_capacity,
        total_blocks_per_node,
        allocated_blocks,
        utilization_pct,
    })
}

/// Hosts whose total port usage meets or exceeds the threshold, ascending by
/// numeric IP (10.0.0.2 sorts before 10.0.0.10).
///
/// A non-positive threshold is a configuration error, not "filter nothing".
pub fn hosts_over_threshold(stats: &Statistics, threshold: i64) -> Result<Vec<(IpAddr, u64)>> {
    if threshold <= 0 {
        bail!("port-threshold must be > 0");
    }
    let threshold = threshold as u64;
    Ok(stats
        .internal_ip_ports_used
        .iter()
        .filter(|(_, &ports)| ports >= threshold)
        .map(|(&host, &ports)| (host, ports))
        .collect())
}
