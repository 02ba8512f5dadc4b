//! Coordination controller, one per node.
//!
//! Owns the clock filter and the phase scheduler and wires them to the
//! transport and the actuator through the trait seams. The reference node is
//! the timebase: its synchronized time is its own local clock, it emits
//! beacons at the adaptive interval, and it consumes paired reports to score
//! sync quality. The follower tracks the reference through the offset filter
//! and echoes every beacon with a paired timestamp report.
//!
//! All mutation happens on the single `poll` path; everything else reads the
//! shared [`NodeStatus`] snapshot.

use anyhow::Result;
use log::{debug, info, warn};
use std::sync::{Arc, RwLock};

use crate::config::SystemConfig;
use crate::error::SyncError;
use crate::messages::{Beacon, EpochAnnounce, Message, PairedTimestampReport, PatternParams};
use crate::scheduler::{PhaseScheduler, Role};
use crate::status::NodeStatus;
use crate::sync::{ClockSynchronizer, SyncState};
use crate::traits::{ActuatorDriver, CoordinationChannel, Direction, LocalClock};

pub struct CoordinationController<C, N, A>
where
    C: LocalClock,
    N: CoordinationChannel,
    A: ActuatorDriver,
{
    clock: C,
    channel: N,
    actuator: A,
    config: SystemConfig,

    role: Role,
    direction: Direction,

    sync: ClockSynchronizer,
    scheduler: PhaseScheduler,

    // Reference-side beacon emission
    beacon_sequence: u32,
    last_beacon_tx_us: u64,

    // Link watchdog
    last_inbound_us: u64,
    have_inbound: bool,
    link_lost: bool,

    status_shared: Arc<RwLock<NodeStatus>>,
}

impl<C, N, A> CoordinationController<C, N, A>
where
    C: LocalClock,
    N: CoordinationChannel,
    A: ActuatorDriver,
{
    pub fn new(
        clock: C,
        channel: N,
        actuator: A,
        role: Role,
        direction: Direction,
        config: SystemConfig,
    ) -> Self {
        let sync = ClockSynchronizer::new(config.sync.clone());
        let scheduler = PhaseScheduler::new(role, config.scheduler.clone());
        CoordinationController {
            clock,
            channel,
            actuator,
            config,
            role,
            direction,
            sync,
            scheduler,
            beacon_sequence: 0,
            last_beacon_tx_us: 0,
            last_inbound_us: 0,
            have_inbound: false,
            link_lost: false,
            status_shared: Arc::new(RwLock::new(NodeStatus::default())),
        }
    }

    pub fn status_handle(&self) -> Arc<RwLock<NodeStatus>> {
        Arc::clone(&self.status_shared)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// This node's position on the shared timeline. The reference IS the
    /// timebase; the follower answers through the filter.
    fn sync_now(&self, local_now_us: u64) -> Result<u64, SyncError> {
        match self.role {
            Role::Reference => Ok(local_now_us),
            Role::Follower => self.sync.get_synchronized_time(local_now_us),
        }
    }

    // ========================================================================
    // PUBLIC COMMANDS
    // ========================================================================

    /// Publish a new cycle epoch. Reference role only; the follower never
    /// originates the timeline. The start instant is future-dated by the
    /// proposal margin so the announcement can land before the pattern
    /// begins.
    pub fn start_cycle(&mut self, cycle_period_us: u64, params: PatternParams) -> Result<()> {
        let now = self.clock.now_us();
        let start = now + self.config.scheduler.proposal_margin_us;
        let announce = self.scheduler.publish_epoch(start, cycle_period_us, params)?;
        self.channel.send(&Message::Epoch(announce).encode())?;
        Ok(())
    }

    /// Negotiate a parameter change through the two-phase handshake. Nothing
    /// changes until the peer acknowledges and the boundary is crossed.
    /// Refused while the link is down or this node has no timeline yet.
    pub fn request_mode_change(
        &mut self,
        new_cycle_period_us: u64,
        new_params: PatternParams,
    ) -> Result<()> {
        if self.link_lost {
            return Err(SyncError::LinkLost.into());
        }
        let now = self.clock.now_us();
        let now_sync = self.sync_now(now)?;
        let proposal =
            self.scheduler
                .propose_mode_change(new_cycle_period_us, new_params, now_sync);
        self.channel.send(&Message::Proposal(proposal).encode())?;
        Ok(())
    }

    /// Snap the beacon interval back to minimum for aggressive resync.
    pub fn force_resync(&mut self) {
        self.sync.force_resync();
    }

    /// Whether this node is converged enough to schedule against. The
    /// reference is trivially ready; the follower needs a settled filter and
    /// a fresh beacon.
    pub fn is_phase_lock_ready(&self) -> bool {
        match self.role {
            Role::Reference => true,
            Role::Follower => self.sync.is_phase_lock_ready(self.clock.now_us()),
        }
    }

    // ========================================================================
    // POLL
    // ========================================================================

    /// One bounded scheduling pass: drain inbound frames, run the watchdogs,
    /// emit any due beacon, tick the scheduler, refresh shared status.
    /// Called at the tick interval; never blocks.
    pub fn poll(&mut self) -> Result<()> {
        while let Some((payload, rx_us)) = self.channel.recv()? {
            self.handle_frame(&payload, rx_us);
        }

        let now = self.clock.now_us();
        self.run_watchdogs(now)?;

        if self.role == Role::Reference {
            self.emit_beacon_if_due(now)?;
        }

        let sync_time = self.sync_now(now).ok();
        if let Some(transition) = self.scheduler.tick(sync_time) {
            self.actuator.set_phase(
                transition.active,
                self.direction,
                transition.params.intensity,
            );
        }

        self.update_status(now);
        Ok(())
    }

    fn handle_frame(&mut self, payload: &[u8], rx_us: u64) {
        let message = match Message::decode(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("[CTRL] Dropping bad frame: {}", e);
                return;
            }
        };

        if !self.have_inbound {
            self.sync.on_connection();
        }
        self.have_inbound = true;
        self.last_inbound_us = rx_us;
        if self.link_lost {
            info!("[CTRL] Link restored");
            self.link_lost = false;
            self.sync.force_resync();
        }

        match message {
            Message::Beacon(beacon) => self.handle_beacon(&beacon, rx_us),
            Message::Report(report) => self.handle_report(&report, rx_us),
            Message::Epoch(announce) => {
                self.scheduler.adopt_epoch(&announce);
            }
            Message::Proposal(proposal) => {
                let now_sync = match self.sync_now(rx_us) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("[CTRL] Proposal while unsynchronized: {}", e);
                        return;
                    }
                };
                match self.scheduler.on_proposal(&proposal, now_sync) {
                    Ok(()) => {
                        let ack = Message::ProposalAck {
                            proposal_id: proposal.proposal_id,
                        };
                        if let Err(e) = self.channel.send(&ack.encode()) {
                            warn!("[CTRL] Failed to send ack: {}", e);
                        }
                    }
                    Err(e) => warn!("[CTRL] {}", e),
                }
            }
            Message::ProposalAck { proposal_id } => {
                self.scheduler.on_proposal_ack(proposal_id);
            }
            Message::ProposalCancel { proposal_id } => {
                self.scheduler.on_proposal_cancel(proposal_id);
            }
        }
    }

    /// Follower: blend the one-way sample, echo a paired report so the
    /// reference can score round-trip quality.
    fn handle_beacon(&mut self, beacon: &Beacon, rx_us: u64) {
        if self.role != Role::Follower {
            debug!("[CTRL] Ignoring beacon in reference role");
            return;
        }
        match self.sync.on_beacon(beacon, rx_us) {
            Ok(()) => {}
            Err(e) => {
                debug!("[CTRL] Beacon dropped: {}", e);
                return;
            }
        }
        let report = PairedTimestampReport {
            beacon_ref_time_us: beacon.reference_time_us,
            local_rx_time_us: rx_us,
            local_tx_time_us: self.clock.now_us(),
            sequence: beacon.sequence,
        };
        if let Err(e) = self.channel.send(&Message::Report(report).encode()) {
            warn!("[CTRL] Failed to send paired report: {}", e);
        }
    }

    fn handle_report(&mut self, report: &PairedTimestampReport, rx_t4_us: u64) {
        if self.role != Role::Reference {
            debug!("[CTRL] Ignoring paired report in follower role");
            return;
        }
        if let Err(e) = self.sync.on_paired_report(report, rx_t4_us) {
            debug!("[CTRL] Paired report dropped: {}", e);
        }
    }

    fn emit_beacon_if_due(&mut self, now: u64) -> Result<()> {
        let interval_us = self.sync.beacon_interval_ms() as u64 * 1000;
        if self.last_beacon_tx_us != 0 && now.saturating_sub(self.last_beacon_tx_us) < interval_us
        {
            return Ok(());
        }
        self.beacon_sequence = self.beacon_sequence.wrapping_add(1);
        let beacon = Beacon {
            reference_time_us: self.clock.now_us(),
            sequence: self.beacon_sequence,
        };
        self.channel.send(&Message::Beacon(beacon).encode())?;
        self.last_beacon_tx_us = now;

        // Re-announce the epoch with each beacon so a follower that missed
        // the original announcement can rejoin mid-pattern.
        if let (Some(epoch), Some(params)) = (
            self.scheduler.current_epoch(),
            self.scheduler.current_params(),
        ) {
            let announce = EpochAnnounce {
                epoch_us: epoch.epoch_us,
                cycle_period_us: epoch.cycle_period_us,
                params,
            };
            self.channel.send(&Message::Epoch(announce).encode())?;
        }
        Ok(())
    }

    /// Silence watchdog: freeze sync past twice the beacon interval ceiling,
    /// expire the held epoch past the disconnect safety timeout, drop a
    /// proposal whose ack never came (and tell the peer it is off).
    fn run_watchdogs(&mut self, now: u64) -> Result<()> {
        if self.have_inbound {
            let silent_us = now.saturating_sub(self.last_inbound_us);
            // Keyed to the ceiling, not this node's own adaptive interval:
            // the sender's cadence may legitimately sit anywhere below the
            // cap while our local interval is still at the minimum.
            let freeze_bound_us = 2 * self.config.sync.interval_max_ms as u64 * 1000;
            if !self.link_lost && silent_us > freeze_bound_us {
                self.link_lost = true;
                self.sync.on_link_loss();
            }
            if self.link_lost && silent_us > self.config.scheduler.epoch_expiry_us {
                self.scheduler.expire_epoch();
            }
        }

        if let Ok(now_sync) = self.sync_now(now) {
            if let Some(dropped_id) = self.scheduler.check_proposal_timeout(now_sync) {
                let cancel = Message::ProposalCancel {
                    proposal_id: dropped_id,
                };
                self.channel.send(&cancel.encode())?;
            }
        }
        Ok(())
    }

    fn update_status(&mut self, now: u64) {
        let snap = self.sync.snapshot();
        if let Ok(mut status) = self.status_shared.write() {
            status.filtered_offset_us = snap.filtered_offset_us;
            status.drift_rate_ppb = snap.drift_rate_ppb;
            status.quality = snap.quality;
            status.beacon_interval_ms = snap.beacon_interval_ms;
            status.last_rtt_us = snap.last_rtt_us;
            status.sync_state = match self.role {
                // The reference is its own timebase; its filter state only
                // describes the peer's clock.
                Role::Reference => SyncState::Synced.label().to_string(),
                Role::Follower => snap.state.label().to_string(),
            };
            status.phase_active = self.scheduler.is_active();
            status.phase_lock_ready = match self.role {
                Role::Reference => true,
                Role::Follower => self.sync.is_phase_lock_ready(now),
            };
            if let Some(epoch) = self.scheduler.current_epoch() {
                status.epoch_us = epoch.epoch_us;
                status.cycle_period_us = epoch.cycle_period_us;
            } else {
                status.epoch_us = 0;
                status.cycle_period_us = 0;
            }
            status.mode_change_armed = self.scheduler.is_mode_change_armed();
            status.last_message_us = if self.have_inbound {
                self.last_inbound_us
            } else {
                0
            };
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
