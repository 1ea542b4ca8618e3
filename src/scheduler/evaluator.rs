//! Performance evaluation - benchmark score to compute points and tiers
//!
//! A node's benchmark score maps to compute points per physical core
//! relative to the configured baseline, capped by the performance
//! multiplier, and determines which quality tiers the node may host.

use chrono::Utc;

use crate::config::SchedulingConfig;
use crate::lifecycle::vm::QualityTier;
use crate::registry::node::PerformanceEvaluation;

/// Compute points one physical core is worth.
///
/// `min(benchmark, baseline * maxMultiplier) / baseline`, so a node twice
/// as fast as baseline earns 2.0 points per core, and outliers cannot run
/// away past the cap.
pub fn points_per_core(benchmark: f64, config: &SchedulingConfig) -> f64 {
    let capped = benchmark.min(config.baseline_benchmark * config.max_performance_multiplier);
    (capped / config.baseline_benchmark).max(0.0)
}

/// Tiers a node with this benchmark may host.
pub fn eligible_tiers(benchmark: f64, config: &SchedulingConfig) -> Vec<QualityTier> {
    let mut tiers: Vec<QualityTier> = config
        .tiers
        .iter()
        .filter(|(_, policy)| benchmark >= policy.minimum_benchmark)
        .map(|(tier, _)| *tier)
        .collect();
    tiers.sort();
    tiers
}

/// Full evaluation record stored on the node at registration.
pub fn evaluate(benchmark: f64, config: &SchedulingConfig) -> PerformanceEvaluation {
    PerformanceEvaluation {
        benchmark_score: benchmark,
        points_per_core: points_per_core(benchmark, config),
        eligible_tiers: eligible_tiers(benchmark, config),
        evaluated_at: Utc::now(),
    }
}
