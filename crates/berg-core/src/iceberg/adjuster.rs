//! Crypto-aware refill confidence adjustment.
//!
//! High flow toxicity near a refill means two opposite things depending on
//! who is trading. In traditional markets a toxic tape is uniformly bad for
//! a resting wall; in crypto the cohort mix disambiguates:
//!
//! - **Whale attack** — institutions hammering the level. The wall is
//!   likelier to fail: confidence is penalized.
//! - **Panic absorption** — retail liquidations flowing into a stable wall.
//!   The strongest accumulation signal there is: confidence gets a bonus.
//! - **Mixed flow** — no dominant cohort on a toxic tape: a small
//!   conservative penalty.
//!
//! An additional penalty applies when the mid price has drifted into the
//! wall (adverse selection against the resting order).

/// Flow conditions at the moment of a refill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowContext {
    /// Current VPIN; `None` when the toxicity gauge is unreliable.
    pub vpin: Option<f64>,
    /// Share of recent volume from whale-sized trades, 0..=1.
    pub whale_pct: f64,
    /// Share of recent volume from minnow-sized trades, 0..=1.
    pub minnow_pct: f64,
    /// |mid − level| in basis points.
    pub price_drift_bps: f64,
    /// True when the drift pushes through the wall (mid below a bid level
    /// or above an ask level).
    pub drift_opposes: bool,
}

impl FlowContext {
    /// A context that leaves confidence untouched.
    pub fn inert() -> Self {
        Self {
            vpin: None,
            whale_pct: 0.0,
            minnow_pct: 0.0,
            price_drift_bps: 0.0,
            drift_opposes: false,
        }
    }
}

/// VPIN below this is too quiet to reinterpret.
const VPIN_FLOOR: f64 = 0.5;
/// Toxicity floor for the whale-attack rule.
const WHALE_ATTACK_VPIN: f64 = 0.7;
/// Toxicity floor for the panic-absorption rule.
const PANIC_VPIN: f64 = 0.8;
/// Toxicity floor for the mixed-flow rule.
const MIXED_VPIN: f64 = 0.6;
/// A cohort dominates above this volume share.
const DOMINANCE: f64 = 0.6;

const WHALE_ATTACK_PENALTY: f64 = 0.25;
const PANIC_BONUS: f64 = 0.10;
const MIXED_PENALTY: f64 = 0.05;
/// Drift penalty saturates at 10%.
const MAX_DRIFT_PENALTY: f64 = 0.10;

/// Adjust a base detection confidence for the surrounding flow.
///
/// Returns the adjusted confidence clamped to [0, 1]. Absent or quiet VPIN
/// leaves the base value untouched (a non-signal is never a penalty).
pub fn adjust_confidence(base: f64, ctx: &FlowContext) -> f64 {
    debug_assert!(
        ctx.whale_pct + ctx.minnow_pct <= 1.0 + 1e-9,
        "cohort shares exceed the total: whale={} minnow={}",
        ctx.whale_pct,
        ctx.minnow_pct,
    );

    let Some(vpin) = ctx.vpin else {
        return base.clamp(0.0, 1.0);
    };
    if vpin < VPIN_FLOOR {
        return base.clamp(0.0, 1.0);
    }

    let mut adjusted = base;

    if ctx.whale_pct > DOMINANCE && vpin > WHALE_ATTACK_VPIN {
        adjusted *= 1.0 - WHALE_ATTACK_PENALTY;
    } else if ctx.minnow_pct > DOMINANCE && vpin > PANIC_VPIN {
        adjusted *= 1.0 + PANIC_BONUS;
    } else if vpin > MIXED_VPIN {
        adjusted *= 1.0 - MIXED_PENALTY;
    }

    if ctx.drift_opposes {
        let drift_penalty = (ctx.price_drift_bps / 100.0).min(MAX_DRIFT_PENALTY).max(0.0);
        adjusted *= 1.0 - drift_penalty;
    }

    adjusted.clamp(0.0, 1.0)
}
