//! Pool snapshot types
//!
//! The device hands back three parallel XML lists (internal IPs, reflexive
//! IPs, ports used per block). Index alignment is the only thing tying the
//! three together, so we collapse them into one `Vec<BlockRecord>` the moment
//! they arrive - after `from_columns` succeeds, misalignment cannot exist.

use std::net::IpAddr;

use anyhow::{anyhow, bail, Result};
use serde::Serialize;

/// One allocated port block: internal host, its translated address, and how
/// many ports of the block are in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRecord {
    pub internal_ip: IpAddr,
    pub reflexive_ip: IpAddr,
    pub ports_used: u64,
}

/// PBA parameters of one NAT pool, as configured on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolMeta {
    /// Ports per block
    pub block_size: u64,
    /// Configured per-host block limit
    pub max_blocks_per_host: u64,
    /// Blocks the pool can hand out in total
    pub blocks_total: u64,
    /// Blocks currently allocated (device-reported)
    pub blocks_used: u64,
}

/// Chassis redundancy mode of the queried device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClusterMode {
    Standalone,
    ActivePassive,
    ActiveActive,
}

impl ClusterMode {
    pub fn is_clustered(self) -> bool {
        !matches!(self, ClusterMode::Standalone)
    }

    /// How many ways the pool is split between nodes. A/A divides pool
    /// resources between the two nodes; A/P and standalone do not.
    pub fn node_divisor(self) -> u64 {
        match self {
            ClusterMode::ActiveActive => 2,
            _ => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterMode::Standalone => "standalone",
            ClusterMode::ActivePassive => "active-passive",
            ClusterMode::ActiveActive => "active-active",
        }
    }
}

/// One snapshot of a pool's block allocations. Built once per run, read-only
/// afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub pool_name: String,
    pub meta: PoolMeta,
    pub cluster_mode: ClusterMode,
    pub records: Vec<BlockRecord>,
}

impl PoolSnapshot {
    /// Zip the device's three parallel columns into block records.
    ///
    /// Misaligned columns or unparseable values are ingestion failures and
    /// fail loudly - an empty pool is a valid (empty) snapshot, a torn reply
    /// is not.
    pub fn from_columns(
        pool_name: &str,
        meta: PoolMeta,
        cluster_mode: ClusterMode,
        internal_ips: &[&str],
        reflexive_ips: &[&str],
        ports_used: &[&str],
    ) -> Result<Self> {
        if internal_ips.len() != reflexive_ips.len() || internal_ips.len() != ports_used.len() {
            bail!(
                "malformed device reply: column lengths differ (internal={}, reflexive={}, ports={})",
                internal_ips.len(),
                reflexive_ips.len(),
                ports_used.len()
            );
        }

        let mut records = Vec::with_capacity(internal_ips.len());
        for ((internal, reflexive), ports) in
            internal_ips.iter().zip(reflexive_ips).zip(ports_used)
        {
            records.push(BlockRecord {
                internal_ip: parse_ip(internal)?,
                reflexive_ip: parse_ip(reflexive)?,
                ports_used: ports
                    .parse::<u64>()
                    .map_err(|_| anyhow!("malformed device reply: bad ports-used value {:?}", ports))?,
            });
        }

        Ok(Self {
            pool_name: pool_name.to_string(),
            meta,
            cluster_mode,
            records,
        })
    }
}

fn parse_ip(s: &str) -> Result<IpAddr> {
    s.parse()
        .map_err(|_| anyhow!("malformed device reply: bad IP address {:?}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> PoolMeta {
        PoolMeta {
            block_size: 128,
            max_blocks_per_host: 8,
            blocks_total: 1000,
            blocks_used: 3,
        }
    }

    #[test]
    fn test_from_columns_zips_records() {
        let snap = PoolSnapshot::from_columns(
            "pool1",
            meta(),
            ClusterMode::Standalone,
            &["10.0.0.1", "10.0.0.2"],
            &["203.0.113.1", "203.0.113.2"],
            &["100", "200"],
        )
        .unwrap();

        assert_eq!(snap.records.len(), 2);
        assert_eq!(snap.records[0].internal_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(snap.records[1].reflexive_ip, "203.0.113.2".parse::<IpAddr>().unwrap());
        assert_eq!(snap.records[1].ports_used, 200);
    }

    #[test]
    fn test_misaligned_columns_rejected() {
        let err = PoolSnapshot::from_columns(
            "pool1",
            meta(),
            ClusterMode::Standalone,
            &["10.0.0.1", "10.0.0.2"],
            &["203.0.113.1"],
            &["100", "200"],
        )
        .unwrap_err();
        assert!(err.to_string().contains("column lengths differ"));
    }

    #[test]
    fn test_bad_ip_rejected() {
        let err = PoolSnapshot::from_columns(
            "pool1",
            meta(),
            ClusterMode::Standalone,
            &["not-an-ip"],
            &["203.0.113.1"],
            &["100"],
        )
        .unwrap_err();
        assert!(err.to_string().contains("bad IP address"));
    }

    #[test]
    fn test_bad_ports_value_rejected() {
        let err = PoolSnapshot::from_columns(
            "pool1",
            meta(),
            ClusterMode::Standalone,
            &["10.0.0.1"],
            &["203.0.113.1"],
            &["12x"],
        )
        .unwrap_err();
        assert!(err.to_string().contains("bad ports-used"));
    }

    #[test]
    fn test_empty_columns_are_valid() {
        let snap = PoolSnapshot::from_columns(
            "pool1",
            meta(),
            ClusterMode::Standalone,
            &[],
            &[],
            &[],
        )
        .unwrap();
        assert!(snap.records.is_empty());
    }

    #[test]
    fn test_node_divisor() {
        assert_eq!(ClusterMode::Standalone.node_divisor(), 1);
        assert_eq!(ClusterMode::ActivePassive.node_divisor(), 1);
        assert_eq!(ClusterMode::ActiveActive.node_divisor(), 2);
        assert!(!ClusterMode::Standalone.is_clustered());
        assert!(ClusterMode::ActivePassive.is_clustered());
    }
}
