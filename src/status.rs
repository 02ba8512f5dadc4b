use serde::{Deserialize, Serialize};

/// Read-only diagnostic snapshot shared with external consumers.
///
/// Updated only from the controller's single-writer paths; everything here is
/// observational. External writes never flow back into the core.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NodeStatus {
    /// Filtered remote-minus-local clock offset (microseconds).
    pub filtered_offset_us: i64,

    /// Filtered drift rate (parts per billion).
    pub drift_rate_ppb: i64,

    /// Sync quality score 0-100, from drift prediction error.
    pub quality: u8,

    /// Current adaptive beacon interval (milliseconds).
    pub beacon_interval_ms: u32,

    /// Last measured paired-report round trip (microseconds), 0 if none yet.
    pub last_rtt_us: i64,

    /// Sync state machine label: "UNSYNCED", "CONNECTED", "SYNCED",
    /// "DEGRADED", "FROZEN".
    pub sync_state: String,

    /// True while this node's actuator is in its active window.
    pub phase_active: bool,

    /// True once the filter has converged enough to schedule against.
    pub phase_lock_ready: bool,

    /// Currently held cycle epoch (reference-clock microseconds), 0 if none.
    pub epoch_us: u64,

    /// Currently held cycle period (microseconds), 0 if none.
    pub cycle_period_us: u64,

    /// True while a mode change is armed and awaiting its boundary.
    pub mode_change_armed: bool,

    /// Local capture time of the last accepted inbound message.
    pub last_message_us: u64,
}

impl Default for NodeStatus {
    fn default() -> Self {
        NodeStatus {
            filtered_offset_us: 0,
            drift_rate_ppb: 0,
            quality: 0,
            beacon_interval_ms: 0,
            last_rtt_us: 0,
            sync_state: "UNSYNCED".to_string(),
            phase_active: false,
            phase_lock_ready: false,
            epoch_us: 0,
            cycle_period_us: 0,
            mode_change_armed: false,
            last_message_us: 0,
        }
    }
}
