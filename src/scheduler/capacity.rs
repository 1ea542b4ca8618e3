//! Effective capacity under the overcommit policy
//!
//! A node's schedulable capacity depends on the tier being placed: CPU
//! points and storage stretch by the tier's overcommit ratios, memory
//! never does.

use crate::config::{SchedulingConfig, TierPolicy};
use crate::lifecycle::vm::QualityTier;
use crate::registry::node::{Node, ResourceSet};

use super::evaluator::points_per_core;

/// Effective total capacity a node exposes for a tier.
pub fn effective_capacity(node: &Node, policy: &TierPolicy, config: &SchedulingConfig) -> ResourceSet {
    let ppc = points_per_core(node.hardware.benchmark_score, config);
    let physical_points = ppc * node.hardware.physical_cores as f64;

    ResourceSet {
        compute_points: (physical_points * policy.cpu_overcommit_ratio).floor() as u64,
        // Memory is never overcommitted.
        memory_bytes: node.hardware.memory_bytes,
        storage_bytes: (node.hardware.total_storage_bytes() as f64
            * policy.storage_overcommit_ratio)
            .floor() as u64,
    }
}

/// Capacity remaining for a tier after existing reservations.
pub fn remaining_capacity(node: &Node, tier: QualityTier, config: &SchedulingConfig) -> ResourceSet {
    let policy = match config.tiers.get(&tier) {
        Some(p) => *p,
        None => return ResourceSet::default(),
    };
    effective_capacity(node, &policy, config).saturating_sub(&node.resources.reserved)
}

/// Projected compute-point utilization (percent) if `points` more were
/// reserved against the tier's effective capacity.
pub fn projected_utilization_percent(
    node: &Node,
    tier: QualityTier,
    points: u64,
    config: &SchedulingConfig,
) -> f64 {
    let policy = match config.tiers.get(&tier) {
        Some(p) => *p,
        None => return 100.0,
    };
    let total = effective_capacity(node, &policy, config).compute_points;
    if total == 0 {
        return 100.0;
    }
    (node.resources.reserved.compute_points + points) as f64 / total as f64 * 100.0
}

/// The node's authoritative total, as written at registration: effective
/// capacity at the most permissive tier the node is eligible for.
pub fn registration_totals(node: &Node, config: &SchedulingConfig) -> ResourceSet {
    // Burstable stretches furthest; reservations from stricter tiers are
    // still bounded per-placement by that tier's own effective capacity.
    let policy = config.tier_policy(QualityTier::Burstable);
    effective_capacity(node, &policy, config)
}
