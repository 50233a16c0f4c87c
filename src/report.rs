//! Report rendering
//!
//! Turns `Statistics` plus the derived capacity figures into the sectioned
//! text report. Pure string building - the caller decides where it goes, so
//! the layout is testable without capturing stdout.

use std::fmt::Write;
use std::net::IpAddr;

use crate::snapshot::{ClusterMode, PoolMeta};
use crate::stats::{CapacityReport, Statistics};
use crate::trace::TimeTrace;

const SECTION_RULE: &str = "------------------------------";

fn push_header(out: &mut String, title: &str) {
    out.push_str(SECTION_RULE);
    out.push('\n');
    out.push_str(title);
    out.push('\n');
    out.push_str("--------------->\n");
}

fn push_rule(out: &mut String) {
    out.push_str("----------------\n");
}

fn max_of(values: impl Iterator<Item = u64>) -> u64 {
    values.max().unwrap_or(0)
}

fn min_of(values: impl Iterator<Item = u64>) -> u64 {
    values.min().unwrap_or(0)
}

/// Render the full text report for one aggregated snapshot.
///
/// `threshold_hosts` is `Some` only when `--port-threshold` was given; the
/// trace section appears only when tracing was enabled.
pub fn render(
    stats: &Statistics,
    cap: &CapacityReport,
    meta: &PoolMeta,
    cluster_mode: ClusterMode,
    threshold_hosts: Option<&[(IpAddr, u64)]>,
    trace: &TimeTrace,
) -> String {
    let mut out = String::new();

    // hosts and blocks per reflexive IP
    push_header(&mut out, "NAT-IP : #int-hosts/alloc blk");
    for (reflexive_ip, hosts) in &stats.reflexive_ip_host_count {
        let blocks = stats.reflexive_ip_block_count[reflexive_ip];
        let _ = writeln!(out, "{:<16}: {}/{}", reflexive_ip.to_string(), hosts, blocks);
    }

    push_header(&mut out, "Int-hosts per NAT-IP stats");
    let host_counts = || stats.reflexive_ip_host_count.values().copied();
    let nat_ip_count = stats.reflexive_ip_host_count.len() as f64;
    let _ = writeln!(out, "max             : {}", max_of(host_counts()));
    let _ = writeln!(out, "min             : {}", min_of(host_counts()));
    let _ = writeln!(
        out,
        "avg             : {:.2}",
        host_counts().sum::<u64>() as f64 / nat_ip_count
    );

    push_header(&mut out, "Blk per NAT-IP");
    let _ = writeln!(out, "capacity        : {}", cap.per_ip_capacity);
    if cluster_mode.is_clustered() {
        let _ = writeln!(out, "capacity(node)  : {}", cap.per_node_capacity);
    }
    let block_counts = || stats.reflexive_ip_block_count.values().copied();
    let block_ip_count = stats.reflexive_ip_block_count.len() as f64;
    let _ = writeln!(out, "max used        : {}", max_of(block_counts()));
    let _ = writeln!(out, "min used        : {}", min_of(block_counts()));
    let _ = writeln!(
        out,
        "avg used        : {:.2}",
        block_counts().sum::<u64>() as f64 / block_ip_count
    );

    push_header(&mut out, "PBA pool stats");
    let _ = writeln!(out, "blk size        : {}", meta.block_size);
    let _ = writeln!(out, "maximum blk     : {}", meta.max_blocks_per_host);
    let _ = writeln!(out, "total blk       : {}", meta.blocks_total);
    if cluster_mode.is_clustered() {
        let _ = writeln!(out, "total blk(node) : {}", cap.total_blocks_per_node);
    }
    let _ = writeln!(out, "allocated blk   : {}", cap.allocated_blocks);
    let _ = writeln!(out, "utilization     : {:.1}%", cap.utilization_pct);

    push_header(&mut out, "Int-host stats");
    let unique_hosts = stats.unique_internal_ips.len() as f64;
    let _ = writeln!(out, "unique hosts    : {}", stats.unique_internal_ips.len());
    let _ = writeln!(
        out,
        "avg blk         : {:.2}",
        cap.allocated_blocks as f64 / unique_hosts
    );
    let _ = writeln!(out, "total sess      : {}", stats.total_ports_used());
    let _ = writeln!(
        out,
        "max sess        : {}",
        max_of(stats.internal_ip_ports_used.values().copied())
    );
    let _ = writeln!(
        out,
        "avg sess        : {:.1}",
        stats.total_ports_used() as f64 / unique_hosts
    );

    // cohort tables: hosts, percentage, max/avg sessions per block count
    push_header(&mut out, "Stats per alloc blk cohort");
    for (blocks, hosts) in &stats.blocks_per_host_histogram {
        let _ = writeln!(out, "blk/hosts       : {}/{}", blocks, hosts);
    }
    push_rule(&mut out);
    for (blocks, hosts) in &stats.blocks_per_host_histogram {
        let _ = writeln!(
            out,
            "blk/percent     : {}/{:.1}%",
            blocks,
            *hosts as f64 / unique_hosts * 100.0
        );
    }
    push_rule(&mut out);
    for (blocks, max_ports) in &stats.max_ports_by_cohort {
        let _ = writeln!(out, "blk/max sess    : {}/{}", blocks, max_ports);
    }
    push_rule(&mut out);
    for (blocks, avg_ports) in &stats.avg_ports_by_cohort {
        let _ = writeln!(out, "blk/avg sess    : {}/{}", blocks, avg_ports);
    }

    if let Some(hosts) = threshold_hosts {
        push_header(&mut out, "Hosts >= port-threshold");
        for (host, ports) in hosts {
            let _ = writeln!(out, "{:<16}:{}", host.to_string(), ports);
        }
    }

    if trace.enabled() {
        push_header(&mut out, "Exec time trace");
        for (delta, label) in trace.deltas() {
            let _ = writeln!(out, "{:<7.3} {}", delta, label);
        }
    }

    out.push_str(SECTION_RULE);
    out.push('\n');
    out
}
