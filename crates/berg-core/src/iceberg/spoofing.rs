//! Spoofing probability for cancelled levels.
//!
//! A spoofed wall is parked to intimidate and pulled as price approaches.
//! Three independent signals, combined by fixed weights:
//!
//! - **Duration** (30%): walls that live seconds are almost always fake;
//!   walls that survive past five minutes are positional.
//! - **Cancellation context** (50%): pulling the order while price moved
//!   toward it, from close range, with little executed, is the classic
//!   spoof exit. Meaningful execution is real money and relieves suspicion.
//! - **Execution pattern** (20%): genuine icebergs refill busily; a level
//!   that barely refilled and held dust volume looks decorative.

use crate::iceberg::registry::IcebergLevel;

const WEIGHT_DURATION: f64 = 0.3;
const WEIGHT_CANCELLATION: f64 = 0.5;
const WEIGHT_EXECUTION: f64 = 0.2;

/// Probability in [0, 1] that `level` was a spoof rather than real
/// liquidity. Meaningful for cancelled levels; callable on any.
pub fn spoofing_probability(level: &IcebergLevel, now_ms: i64) -> f64 {
    let score = duration_score(level, now_ms) * WEIGHT_DURATION
        + cancellation_score(level) * WEIGHT_CANCELLATION
        + execution_score(level, now_ms) * WEIGHT_EXECUTION;
    score.clamp(0.0, 1.0)
}

fn duration_score(level: &IcebergLevel, now_ms: i64) -> f64 {
    let lifetime_s = level.survival_seconds(now_ms);
    if lifetime_s < 5.0 {
        1.0
    } else if lifetime_s < 60.0 {
        0.7
    } else if lifetime_s < 300.0 {
        0.3
    } else {
        0.0
    }
}

fn cancellation_score(level: &IcebergLevel) -> f64 {
    let Some(ctx) = &level.cancellation_context else {
        // Still active or context unknown: nothing to judge.
        return 0.0;
    };

    let mut score = 0.0;
    if ctx.moving_towards_level {
        score += 0.6;
    }
    if ctx.distance_from_level_pct.abs() < 0.5 {
        score += 0.3;
    }
    if ctx.volume_executed_pct < 10.0 {
        score += 0.1;
    }
    // Real execution relieves suspicion: past 30% filled, scale the score
    // down by up to 0.6.
    if ctx.volume_executed_pct > 30.0 {
        let relief = ((ctx.volume_executed_pct - 30.0) / 100.0 * 2.0).min(0.6);
        score -= relief;
    }
    score.clamp(0.0, 1.0)
}

fn execution_score(level: &IcebergLevel, now_ms: i64) -> f64 {
    let freq = level.refill_frequency(now_ms);
    let mut score = if freq > 10.0 {
        0.0
    } else if freq < 1.0 {
        0.5
    } else {
        0.5 * (1.0 - (freq - 1.0) / 9.0)
    };

    // Dust accumulation looks decorative rather than absorptive.
    if level.total_hidden_volume < rust_decimal::Decimal::new(1, 1) {
        score += 0.3;
    }
    score.min(1.0)
}
