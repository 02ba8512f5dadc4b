use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub sync: SyncConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Steady-state EMA weight on a new offset sample.
    pub alpha: f64,
    /// Fast-attack EMA weight used for the first samples after (re)sync.
    pub alpha_fast: f64,
    /// Samples processed with the fast-attack weight before steady state.
    pub fast_attack_samples: u32,
    /// Adaptive beacon interval bounds and growth step.
    pub interval_min_ms: u32,
    pub interval_max_ms: u32,
    pub interval_step_ms: u32,
    /// Quality score at or above which the interval may grow.
    pub quality_grow_threshold: u8,
    /// Quality score below which the interval resets to minimum.
    pub quality_shrink_threshold: u8,
    /// Drift-rate samples only accepted for intervals in this range.
    pub drift_interval_min_ms: u32,
    pub drift_interval_max_ms: u32,
    /// Paired-report round trips above this are logged as suspect.
    pub rtt_warn_us: i64,
    /// Paired-report round trips above this are rejected as corrupt.
    pub rtt_max_us: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler poll period. Transitions fire on phase change, not on the
    /// poll edge, so jitter here cannot duplicate or drop a transition.
    pub tick_interval_ms: u32,
    /// Future-dating margin for mode-change proposals. Must cover one full
    /// communication round trip plus jitter budget.
    pub proposal_margin_us: u64,
    /// Unacknowledged proposals are dropped after this long.
    pub proposal_ack_timeout_us: u64,
    /// Held epoch expires after this long without any inbound message while
    /// the link is down. Coasting on extrapolation is bounded, not unlimited.
    pub epoch_expiry_us: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            sync: SyncConfig {
                alpha: 0.1,
                alpha_fast: 0.3,
                fast_attack_samples: 10,
                interval_min_ms: 10_000,
                interval_max_ms: 60_000,
                interval_step_ms: 10_000,
                quality_grow_threshold: 75,
                quality_shrink_threshold: 50,
                drift_interval_min_ms: 100,
                drift_interval_max_ms: 120_000,
                rtt_warn_us: 500_000,  // 500ms - possible link congestion
                rtt_max_us: 10_000_000, // 10s - corrupt/overflow
            },
            scheduler: SchedulerConfig {
                tick_interval_ms: 20,
                proposal_margin_us: 2_000_000,     // 2s, covers RTT + jitter
                proposal_ack_timeout_us: 1_000_000, // 1s
                epoch_expiry_us: 120_000_000,       // 2 min disconnect safety
            },
        }
    }
}
