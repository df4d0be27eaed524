//! `homa.toml` tunables.
//!
//! Every constant named by the protocol design (unscheduled bytes, grant
//! windowing, pacer thresholds, timer cadence, buffer pool geometry) lives
//! here instead of scattered through the modules that consume it, so a
//! deployment can retune the scheduler without recompiling.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MIN_DEFAULT_PORT: u16 = 0x8000;
pub const HOMA_MAX_BPAGES: usize = 4;
pub const HOMA_MAX_HEADER: usize = 88;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HomaConfig {
    // --- buffer pool ---
    #[serde(default = "HomaConfig::default_bpage_size")]
    pub bpage_size: usize,
    #[serde(default = "HomaConfig::default_bpage_lease_usecs")]
    pub bpage_lease_usecs: u64,

    // --- socket table ---
    #[serde(default = "HomaConfig::default_socktab_buckets")]
    pub socktab_buckets: usize,

    // --- rpc tables ---
    #[serde(default = "HomaConfig::default_rpc_buckets")]
    pub rpc_buckets: usize,

    // --- interest ---
    #[serde(default = "HomaConfig::default_poll_usecs")]
    pub poll_usecs: u64,

    // --- peer table ---
    #[serde(default = "HomaConfig::default_peer_idle_secs_max")]
    pub peer_idle_secs_max: u64,
    #[serde(default = "HomaConfig::default_peer_gc_threshold")]
    pub peer_gc_threshold: usize,

    // --- grant scheduler ---
    #[serde(default = "HomaConfig::default_unsched_bytes")]
    pub unsched_bytes: u32,
    #[serde(default = "HomaConfig::default_window")]
    pub window: u32,
    #[serde(default = "HomaConfig::default_max_incoming")]
    pub max_incoming: u32,
    #[serde(default = "HomaConfig::default_max_overcommit")]
    pub max_overcommit: usize,
    #[serde(default = "HomaConfig::default_max_rpcs_per_peer")]
    pub max_rpcs_per_peer: usize,
    #[serde(default = "HomaConfig::default_max_sched_prio")]
    pub max_sched_prio: u8,
    #[serde(default = "HomaConfig::default_grant_fifo_fraction")]
    pub grant_fifo_fraction: u32,
    #[serde(default = "HomaConfig::default_fifo_grant_increment")]
    pub fifo_grant_increment: u32,
    #[serde(default = "HomaConfig::default_grant_recalc_usecs")]
    pub grant_recalc_usecs: u64,

    // --- outgoing / pacer ---
    #[serde(default = "HomaConfig::default_max_gso_size")]
    pub max_gso_size: u32,
    #[serde(default = "HomaConfig::default_link_mbps")]
    pub link_mbps: u64,
    #[serde(default = "HomaConfig::default_max_nic_queue_ns")]
    pub max_nic_queue_ns: u64,
    #[serde(default = "HomaConfig::default_throttle_min_bytes")]
    pub throttle_min_bytes: u32,
    #[serde(default = "HomaConfig::default_pacer_fifo_fraction")]
    pub pacer_fifo_fraction: u32,

    // --- socket (send-memory availability) ---
    #[serde(default = "HomaConfig::default_send_mem_bytes")]
    pub send_mem_bytes: usize,

    // --- timer ---
    #[serde(default = "HomaConfig::default_resend_ticks")]
    pub resend_ticks: u32,
    #[serde(default = "HomaConfig::default_resend_interval")]
    pub resend_interval: u32,
    #[serde(default = "HomaConfig::default_timeout_resends")]
    pub timeout_resends: u32,
    #[serde(default = "HomaConfig::default_request_ack_ticks")]
    pub request_ack_ticks: u32,
    #[serde(default = "HomaConfig::default_reap_limit")]
    pub reap_limit: usize,
    #[serde(default = "HomaConfig::default_dead_buffs_limit")]
    pub dead_buffs_limit: usize,
}

impl HomaConfig {
    fn default_bpage_size() -> usize {
        64 * 1024
    }
    fn default_bpage_lease_usecs() -> u64 {
        10_000
    }
    fn default_socktab_buckets() -> usize {
        1024
    }
    fn default_rpc_buckets() -> usize {
        256
    }
    fn default_poll_usecs() -> u64 {
        50
    }
    fn default_peer_idle_secs_max() -> u64 {
        300
    }
    fn default_peer_gc_threshold() -> usize {
        10_000
    }
    fn default_unsched_bytes() -> u32 {
        60_000
    }
    fn default_window() -> u32 {
        0
    }
    fn default_max_incoming() -> u32 {
        1_000_000
    }
    fn default_max_overcommit() -> usize {
        8
    }
    fn default_max_rpcs_per_peer() -> usize {
        4
    }
    fn default_max_sched_prio() -> u8 {
        6
    }
    fn default_grant_fifo_fraction() -> u32 {
        50
    }
    fn default_fifo_grant_increment() -> u32 {
        10_000
    }
    fn default_grant_recalc_usecs() -> u64 {
        500
    }
    fn default_max_gso_size() -> u32 {
        65_000
    }
    fn default_link_mbps() -> u64 {
        25_000
    }
    fn default_max_nic_queue_ns() -> u64 {
        2_000
    }
    fn default_throttle_min_bytes() -> u32 {
        1_000
    }
    fn default_pacer_fifo_fraction() -> u32 {
        50
    }
    fn default_send_mem_bytes() -> usize {
        16 * 1024 * 1024
    }
    fn default_resend_ticks() -> u32 {
        5
    }
    fn default_resend_interval() -> u32 {
        5
    }
    fn default_timeout_resends() -> u32 {
        5
    }
    fn default_request_ack_ticks() -> u32 {
        2_000
    }
    fn default_reap_limit() -> usize {
        10
    }
    fn default_dead_buffs_limit() -> usize {
        5_000
    }

    /// An example config suitable for printing with `toml::to_string_pretty`.
    pub fn default_example() -> Self {
        Self::default()
    }

    /// Preconditions the rest of the engine assumes hold. Checked once, at
    /// socket-open time, so argument errors surface immediately.
    pub fn validate(&self) -> Result<()> {
        if self.max_sched_prio < 1 {
            return Err(Error::InvalidConfig("max_sched_prio must be >= 1".into()));
        }
        if self.max_overcommit == 0 {
            return Err(Error::InvalidConfig("max_overcommit must be >= 1".into()));
        }
        if self.bpage_size == 0 || !self.bpage_size.is_power_of_two() {
            return Err(Error::InvalidConfig("bpage_size must be a power of two".into()));
        }
        if self.grant_fifo_fraction > 1000 || self.pacer_fifo_fraction > 1000 {
            return Err(Error::InvalidConfig(
                "fifo fractions are expressed in thousandths and must be <= 1000".into(),
            ));
        }
        if self.unsched_bytes as u64 > self.max_incoming as u64 {
            return Err(Error::InvalidConfig(
                "unsched_bytes must not exceed max_incoming".into(),
            ));
        }
        if self.socktab_buckets == 0 || self.rpc_buckets == 0 {
            return Err(Error::InvalidConfig("bucket counts must be >= 1".into()));
        }
        if self.send_mem_bytes == 0 {
            return Err(Error::InvalidConfig("send_mem_bytes must be >= 1".into()));
        }
        Ok(())
    }
}

impl Default for HomaConfig {
    fn default() -> Self {
        Self {
            bpage_size: Self::default_bpage_size(),
            bpage_lease_usecs: Self::default_bpage_lease_usecs(),
            socktab_buckets: Self::default_socktab_buckets(),
            rpc_buckets: Self::default_rpc_buckets(),
            poll_usecs: Self::default_poll_usecs(),
            peer_idle_secs_max: Self::default_peer_idle_secs_max(),
            peer_gc_threshold: Self::default_peer_gc_threshold(),
            unsched_bytes: Self::default_unsched_bytes(),
            window: Self::default_window(),
            max_incoming: Self::default_max_incoming(),
            max_overcommit: Self::default_max_overcommit(),
            max_rpcs_per_peer: Self::default_max_rpcs_per_peer(),
            max_sched_prio: Self::default_max_sched_prio(),
            grant_fifo_fraction: Self::default_grant_fifo_fraction(),
            fifo_grant_increment: Self::default_fifo_grant_increment(),
            grant_recalc_usecs: Self::default_grant_recalc_usecs(),
            max_gso_size: Self::default_max_gso_size(),
            link_mbps: Self::default_link_mbps(),
            max_nic_queue_ns: Self::default_max_nic_queue_ns(),
            throttle_min_bytes: Self::default_throttle_min_bytes(),
            pacer_fifo_fraction: Self::default_pacer_fifo_fraction(),
            send_mem_bytes: Self::default_send_mem_bytes(),
            resend_ticks: Self::default_resend_ticks(),
            resend_interval: Self::default_resend_interval(),
            timeout_resends: Self::default_timeout_resends(),
            request_ack_ticks: Self::default_request_ack_ticks(),
            reap_limit: Self::default_reap_limit(),
            dead_buffs_limit: Self::default_dead_buffs_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(HomaConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_unsched_over_max_incoming() {
        let mut cfg = HomaConfig::default();
        cfg.unsched_bytes = cfg.max_incoming + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_max_overcommit() {
        let mut cfg = HomaConfig::default();
        cfg.max_overcommit = 0;
        assert!(cfg.validate().is_err());
    }
}
