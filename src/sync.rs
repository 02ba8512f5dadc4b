//! Filtered clock synchronization.
//!
//! Estimates the remote node's clock as a function of the local one from
//! periodic one-way beacons, corrected occasionally by a paired four-timestamp
//! round trip that removes systematic one-way-delay bias.
//!
//! Two properties are deliberate and load-bearing:
//! - No sample is ever applied at full weight. Blending is always partial
//!   (EMA), bounding the effect of any one outlier.
//! - Corrections flow only into the offset estimate, never into an in-flight
//!   activation schedule. Earlier designs that fed per-cycle corrections back
//!   into the schedule diverged; the scheduler only ever reads this filter.

use log::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::messages::{Beacon, PairedTimestampReport};

/// Fixed capacity of the raw sample ring. Static size, no allocation.
pub const SAMPLE_RING_CAPACITY: usize = 8;

/// Drift-rate samples smoothed by a median over this many entries, so a
/// single jittery measurement cannot swing the rate.
const DRIFT_WINDOW: usize = 5;

// Quality tiers from |drift prediction error|. Quality measures how well the
// drift model PREDICTS, never raw drift magnitude: a large but stable offset
// trend is excellent, a small but erratic one is not. (Measuring magnitude
// here once permanently defeated interval adaptation.)
const QUALITY_EXCELLENT: u8 = 95; // < 1ms prediction error
const QUALITY_GOOD: u8 = 75; // < 5ms
const QUALITY_FAIR: u8 = 50; // < 15ms
const QUALITY_POOR: u8 = 25; // < 30ms
const QUALITY_FAILED: u8 = 0;

/// Minimum quality updates before the beacon interval may grow.
const INTERVAL_GROW_MIN_SAMPLES: u32 = 3;

/// Clock sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No connection established.
    Unsynced,
    /// Link up, awaiting the first valid sample.
    Connected,
    /// Filter has data and prediction error is acceptable.
    Synced,
    /// Prediction error above threshold; beacons narrow back to minimum.
    Degraded,
    /// Link lost. State preserved, extrapolation continues.
    Frozen,
}

impl SyncState {
    pub fn label(&self) -> &'static str {
        match self {
            SyncState::Unsynced => "UNSYNCED",
            SyncState::Connected => "CONNECTED",
            SyncState::Synced => "SYNCED",
            SyncState::Degraded => "DEGRADED",
            SyncState::Frozen => "FROZEN",
        }
    }
}

/// One raw one-way offset measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OffsetSample {
    /// remote_time - local_time at receipt, microseconds.
    pub offset_us: i64,
    /// Local capture time of the measurement.
    pub local_rx_us: u64,
}

/// Immutable snapshot of the filter for readers outside the message path.
#[derive(Debug, Clone, Copy)]
pub struct ClockSnapshot {
    pub state: SyncState,
    pub filtered_offset_us: i64,
    pub drift_rate_ppb: i64,
    pub quality: u8,
    pub beacon_interval_ms: u32,
    pub last_update_us: u64,
    pub last_rtt_us: i64,
}

/// Owns all mutable clock state. Mutated only on the message-receipt path;
/// every other consumer reads a [`ClockSnapshot`].
pub struct ClockSynchronizer {
    config: SyncConfig,
    state: SyncState,

    // Offset filter
    filtered_offset_us: f64,
    have_offset: bool,
    sample_count: u32,

    // Drift model
    drift_rate_us_per_s: f64,
    drift_valid: bool,
    drift_window: [f64; DRIFT_WINDOW],
    drift_window_len: usize,
    drift_window_next: usize,

    // Raw sample ring
    ring: [OffsetSample; SAMPLE_RING_CAPACITY],
    ring_len: usize,
    ring_next: usize,

    // Sequence tracking (reorder/duplicate rejection)
    last_sequence: u32,
    have_sequence: bool,

    last_update_us: u64,

    // Quality / adaptive interval
    quality: u8,
    quality_samples: u32,
    beacon_interval_ms: u32,

    last_rtt_us: i64,
}

impl ClockSynchronizer {
    pub fn new(config: SyncConfig) -> Self {
        let interval = config.interval_min_ms;
        ClockSynchronizer {
            config,
            state: SyncState::Unsynced,
            filtered_offset_us: 0.0,
            have_offset: false,
            sample_count: 0,
            drift_rate_us_per_s: 0.0,
            drift_valid: false,
            drift_window: [0.0; DRIFT_WINDOW],
            drift_window_len: 0,
            drift_window_next: 0,
            ring: [OffsetSample::default(); SAMPLE_RING_CAPACITY],
            ring_len: 0,
            ring_next: 0,
            last_sequence: 0,
            have_sequence: false,
            last_update_us: 0,
            quality: 0,
            quality_samples: 0,
            beacon_interval_ms: interval,
            last_rtt_us: 0,
        }
    }

    // ========================================================================
    // LINK LIFECYCLE
    // ========================================================================

    pub fn on_connection(&mut self) {
        if self.state == SyncState::Unsynced {
            self.state = SyncState::Connected;
            info!("[SYNC] Link up, awaiting first beacon");
        }
    }

    /// Freeze on link loss. State is preserved, never reset: the filter keeps
    /// extrapolating from the last known offset and drift until a new beacon.
    pub fn on_link_loss(&mut self) {
        match self.state {
            SyncState::Synced | SyncState::Degraded => {
                self.state = SyncState::Frozen;
                self.quality = self.quality.min(QUALITY_POOR);
                warn!(
                    "[SYNC] Link lost, frozen (offset {:.0}us, drift {:+.1}us/s)",
                    self.filtered_offset_us, self.drift_rate_us_per_s
                );
            }
            _ => {}
        }
    }

    /// Reset the adaptive interval to minimum for aggressive resync. The
    /// filter itself is untouched.
    pub fn force_resync(&mut self) {
        self.beacon_interval_ms = self.config.interval_min_ms;
        info!(
            "[SYNC] Forced resync, interval reset to {}ms",
            self.beacon_interval_ms
        );
    }

    // ========================================================================
    // SAMPLE INGEST
    // ========================================================================

    /// Process a one-way beacon captured at `local_rx_us`.
    pub fn on_beacon(&mut self, beacon: &Beacon, local_rx_us: u64) -> Result<(), SyncError> {
        if self.have_sequence && beacon.sequence <= self.last_sequence {
            debug!(
                "[SYNC] Dropping stale beacon seq {} (last {})",
                beacon.sequence, self.last_sequence
            );
            return Err(SyncError::StaleOrDuplicateMessage {
                received: beacon.sequence,
                last_accepted: self.last_sequence,
            });
        }

        let raw_offset_us = local_rx_us as i64 - beacon.reference_time_us as i64;
        // One-way samples read local - remote; the filter stores remote -
        // local, so flip the sign here and nowhere else.
        let raw_offset_us = -raw_offset_us;

        self.last_sequence = beacon.sequence;
        self.have_sequence = true;

        self.apply_sample(raw_offset_us, local_rx_us);
        Ok(())
    }

    /// Process a paired timestamp report (reference role). T4 is our own
    /// capture time. The four-timestamp formula cancels symmetric path delay,
    /// correcting the bias a pure one-way filter cannot see. A genuinely
    /// asymmetric path still biases the estimate by half the asymmetry; that
    /// residual is a known, unresolved error source.
    pub fn on_paired_report(
        &mut self,
        report: &PairedTimestampReport,
        local_rx_t4_us: u64,
    ) -> Result<(), SyncError> {
        let t1 = report.beacon_ref_time_us as i64;
        let t2 = report.local_rx_time_us as i64;
        let t3 = report.local_tx_time_us as i64;
        let t4 = local_rx_t4_us as i64;

        // Signed throughout: unsigned wraparound here once produced RTTs in
        // the hundreds of millennia.
        let rtt = (t4 - t1) - (t3 - t2);
        if rtt < 0 {
            warn!("[SYNC] Paired report with negative RTT ({}us), dropped", rtt);
            return Ok(());
        }
        if rtt > self.config.rtt_max_us {
            warn!("[SYNC] Paired report RTT too large ({}us), dropped", rtt);
            return Ok(());
        }
        if rtt > self.config.rtt_warn_us {
            warn!("[SYNC] Paired report RTT unusually high ({}us), link congestion?", rtt);
        }

        let offset_us = ((t2 - t1) + (t3 - t4)) / 2;
        self.last_rtt_us = rtt;

        debug!(
            "[SYNC] Paired sample: offset {:+}us rtt {}us (seq {})",
            offset_us, rtt, report.sequence
        );
        self.apply_sample(offset_us, local_rx_t4_us);
        Ok(())
    }

    /// Blend one raw offset sample into the filter and update the drift
    /// model, prediction-error quality, and adaptive interval.
    fn apply_sample(&mut self, raw_offset_us: i64, local_rx_us: u64) {
        self.push_ring(OffsetSample {
            offset_us: raw_offset_us,
            local_rx_us,
        });

        if !self.have_offset {
            self.filtered_offset_us = raw_offset_us as f64;
            self.have_offset = true;
            self.sample_count = 1;
            self.last_update_us = local_rx_us;
            self.quality = QUALITY_FAIR;
            self.enter_synced("first sample");
            info!("[SYNC] Filter bootstrapped: offset {:+}us", raw_offset_us);
            return;
        }

        let old_filtered = self.filtered_offset_us;

        let alpha = if self.sample_count < self.config.fast_attack_samples {
            self.config.alpha_fast
        } else {
            self.config.alpha
        };
        self.filtered_offset_us =
            alpha * raw_offset_us as f64 + (1.0 - alpha) * self.filtered_offset_us;
        self.sample_count = self.sample_count.saturating_add(1);

        let elapsed_us = local_rx_us.saturating_sub(self.last_update_us);
        let elapsed_ms = elapsed_us / 1000;
        if elapsed_ms >= self.config.drift_interval_min_ms as u64
            && elapsed_ms <= self.config.drift_interval_max_ms as u64
        {
            let elapsed_s = elapsed_us as f64 / 1_000_000.0;
            let actual_drift_us = self.filtered_offset_us - old_filtered;

            // Quality first, against the rate predicted BEFORE this sample.
            if self.drift_valid {
                let predicted_drift_us = self.drift_rate_us_per_s * elapsed_s;
                let prediction_error_us = (actual_drift_us - predicted_drift_us).abs();
                self.update_quality(prediction_error_us);
            }

            self.push_drift_sample(actual_drift_us / elapsed_s);
        }

        self.last_update_us = local_rx_us;

        debug!(
            "[SYNC] Sample {:+}us -> filtered {:+.0}us drift {:+.2}us/s q{}",
            raw_offset_us, self.filtered_offset_us, self.drift_rate_us_per_s, self.quality
        );

        if self.state == SyncState::Frozen || self.state == SyncState::Connected {
            self.enter_synced("beacon after freeze/connect");
        }
    }

    fn enter_synced(&mut self, why: &str) {
        if self.state != SyncState::Synced {
            info!("[SYNC] -> SYNCED ({})", why);
            self.state = SyncState::Synced;
        }
    }

    fn push_ring(&mut self, sample: OffsetSample) {
        self.ring[self.ring_next] = sample;
        self.ring_next = (self.ring_next + 1) % SAMPLE_RING_CAPACITY;
        if self.ring_len < SAMPLE_RING_CAPACITY {
            self.ring_len += 1;
        }
    }

    fn push_drift_sample(&mut self, rate_us_per_s: f64) {
        self.drift_window[self.drift_window_next] = rate_us_per_s;
        self.drift_window_next = (self.drift_window_next + 1) % DRIFT_WINDOW;
        if self.drift_window_len < DRIFT_WINDOW {
            self.drift_window_len += 1;
        }

        // Median over the window rejects a single jittery measurement.
        let mut sorted = [0.0f64; DRIFT_WINDOW];
        sorted[..self.drift_window_len].copy_from_slice(&self.drift_window[..self.drift_window_len]);
        let slice = &mut sorted[..self.drift_window_len];
        slice.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.drift_rate_us_per_s = slice[slice.len() / 2];
        self.drift_valid = true;
    }

    fn update_quality(&mut self, prediction_error_us: f64) {
        let err = prediction_error_us.abs();
        self.quality = if err < 1_000.0 {
            QUALITY_EXCELLENT
        } else if err < 5_000.0 {
            QUALITY_GOOD
        } else if err < 15_000.0 {
            QUALITY_FAIR
        } else if err < 30_000.0 {
            QUALITY_POOR
        } else {
            QUALITY_FAILED
        };
        self.quality_samples = self.quality_samples.saturating_add(1);

        // Degraded is an overlay on Synced, entered and left on the same
        // thresholds that drive the interval.
        if self.quality < self.config.quality_shrink_threshold {
            if self.state == SyncState::Synced {
                warn!("[SYNC] Quality degraded ({}%)", self.quality);
                self.state = SyncState::Degraded;
            }
        } else if self.state == SyncState::Degraded
            && self.quality >= self.config.quality_grow_threshold
        {
            self.enter_synced("quality recovered");
        }

        self.adjust_interval();
    }

    /// Grow the beacon interval by a fixed step while prediction holds, snap
    /// back to minimum when it does not. Bounded both ends.
    fn adjust_interval(&mut self) {
        if self.quality >= self.config.quality_grow_threshold
            && self.quality_samples >= INTERVAL_GROW_MIN_SAMPLES
        {
            if self.beacon_interval_ms < self.config.interval_max_ms {
                self.beacon_interval_ms = (self.beacon_interval_ms
                    + self.config.interval_step_ms)
                    .min(self.config.interval_max_ms);
                info!(
                    "[SYNC] Beacon interval grown to {}ms (quality {}%)",
                    self.beacon_interval_ms, self.quality
                );
            }
        } else if self.quality < self.config.quality_shrink_threshold
            && self.beacon_interval_ms > self.config.interval_min_ms
        {
            self.beacon_interval_ms = self.config.interval_min_ms;
            warn!(
                "[SYNC] Beacon interval reset to {}ms (quality {}%)",
                self.beacon_interval_ms, self.quality
            );
        }
    }

    // ========================================================================
    // READ SIDE
    // ========================================================================

    /// Remote-equivalent time for a local instant, extrapolating between
    /// updates: `local + filtered_offset + drift * (local - last_update)`.
    ///
    /// Returns [`SyncError::NotSynchronized`] before the first valid beacon,
    /// or when the offset would push the result below zero. Never wraps.
    pub fn get_synchronized_time(&self, local_time_us: u64) -> Result<u64, SyncError> {
        if !self.have_offset {
            return Err(SyncError::NotSynchronized);
        }

        let offset = self.extrapolated_offset_us(local_time_us);
        let sync = local_time_us as i64 + offset;
        if sync < 0 {
            warn!(
                "[SYNC] Underflow guard: local {}us offset {:+}us",
                local_time_us, offset
            );
            return Err(SyncError::NotSynchronized);
        }
        Ok(sync as u64)
    }

    fn extrapolated_offset_us(&self, local_time_us: u64) -> i64 {
        let mut offset = self.filtered_offset_us;
        if self.drift_valid && local_time_us > self.last_update_us {
            let elapsed_s = (local_time_us - self.last_update_us) as f64 / 1_000_000.0;
            offset += self.drift_rate_us_per_s * elapsed_s;
        }
        offset as i64
    }

    pub fn get_quality(&self) -> u8 {
        self.quality
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn beacon_interval_ms(&self) -> u32 {
        self.beacon_interval_ms
    }

    pub fn ring_len(&self) -> usize {
        self.ring_len
    }

    /// Raw samples still held in the ring, oldest first.
    pub fn recent_samples(&self) -> Vec<OffsetSample> {
        let mut out = Vec::with_capacity(self.ring_len);
        for i in 0..self.ring_len {
            let idx =
                (self.ring_next + SAMPLE_RING_CAPACITY - self.ring_len + i) % SAMPLE_RING_CAPACITY;
            out.push(self.ring[idx]);
        }
        out
    }

    /// Converged enough for the scheduler to start: filter out of fast
    /// attack, and a recent sample within twice the adaptive interval.
    pub fn is_phase_lock_ready(&self, now_us: u64) -> bool {
        if !self.have_offset || self.sample_count < self.config.fast_attack_samples {
            return false;
        }
        let stale_bound_us = 2 * self.beacon_interval_ms as u64 * 1000;
        now_us.saturating_sub(self.last_update_us) <= stale_bound_us
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            state: self.state,
            filtered_offset_us: self.filtered_offset_us as i64,
            drift_rate_ppb: (self.drift_rate_us_per_s * 1000.0) as i64,
            quality: self.quality,
            beacon_interval_ms: self.beacon_interval_ms,
            last_update_us: self.last_update_us,
            last_rtt_us: self.last_rtt_us,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
