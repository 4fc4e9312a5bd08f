//! Reproducibility tracking: runtime environment snapshots and per-rank seeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Variables that change numerical results or device placement.
const TRACKED_VARS: [&str; 4] = ["PATH", "RUST_LOG", "CUDA_VISIBLE_DEVICES", "WGPU_BACKEND"];

/// Runtime environment stored next to a logged model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub crate_version: String,
    pub backend: String,
    pub packages: BTreeMap<String, String>,
    pub system_info: String,
    pub platform: String,
    pub timestamp: DateTime<Utc>,
    /// Hash of [`TRACKED_VARS`] as `NAME=value` lines.
    pub env_vars_hash: String,
}

impl EnvironmentSnapshot {
    pub fn capture() -> Self {
        let packages = BTreeMap::from([
            ("segtrain-core".to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ]);
        Self {
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            backend: crate::backend::backend_name().to_string(),
            packages,
            system_info: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            platform: std::env::consts::OS.to_string(),
            timestamp: Utc::now(),
            env_vars_hash: Self::compute_env_vars_hash(),
        }
    }

    fn compute_env_vars_hash() -> String {
        let mut hasher = Sha256::new();
        for var in TRACKED_VARS {
            let value = std::env::var(var).unwrap_or_default();
            hasher.update(var.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Seed for `rank`, derived from the run's base seed.
pub fn seed_for(base: u64, rank: usize) -> u64 {
    base.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(rank as u64)
        .rotate_left(17)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_fills_fields() {
        let snap = EnvironmentSnapshot::capture();
        assert_eq!(snap.env_vars_hash.len(), 64);
        assert!(!snap.backend.is_empty());
        assert_eq!(snap.crate_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_seeds_differ_per_rank_and_are_stable() {
        assert_ne!(seed_for(42, 0), seed_for(42, 1));
        assert_eq!(seed_for(42, 3), seed_for(42, 3));
    }
}
