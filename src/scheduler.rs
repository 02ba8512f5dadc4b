//! Deterministic phase scheduling over synchronized time.
//!
//! Both nodes evaluate the SAME epoch and the SAME position formula; the
//! follower is active exactly when the reference's position is in the second
//! half-cycle. Antiphase is a property of the comparison, not of an added
//! offset. This is the single canonical formulation: past designs that mixed
//! a comparison form and an added-half-cycle form across code paths kept
//! producing off-by-half bugs, so every phase decision funnels through
//! [`compute_phase`].
//!
//! Parameter changes commit via two-phase handshake: propose a future-dated
//! epoch, peer validates and acknowledges, both sides arm, both swap
//! atomically when synchronized time crosses the boundary. A late swap is
//! never "caught up" mid-activation; it simply takes effect at the next
//! evaluation, which is what bounds the overlap risk.

use log::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{RejectReason, SyncError};
use crate::messages::{EpochAnnounce, ModeChangeProposal, PatternParams};

/// Which end of the timing relationship this node is. Supplied externally at
/// session start; this core never elects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Reference,
    Follower,
}

/// Reference-clock instant the current cycle began, plus the period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleEpoch {
    pub epoch_us: u64,
    pub cycle_period_us: u64,
}

impl CycleEpoch {
    pub fn half_cycle_us(&self) -> u64 {
        self.cycle_period_us / 2
    }
}

/// Activation predicate for the non-overlap invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Inactive,
}

/// The canonical phase formula. `pos = (t - epoch) mod period`; reference is
/// active while `pos < half`, follower exactly when `pos >= half`. Before the
/// epoch instant the pattern has not started and both sides are inactive.
pub fn compute_phase(role: Role, sync_time_us: u64, epoch: &CycleEpoch) -> Phase {
    if epoch.cycle_period_us == 0 || sync_time_us < epoch.epoch_us {
        return Phase::Inactive;
    }
    let pos = (sync_time_us - epoch.epoch_us) % epoch.cycle_period_us;
    let reference_active = pos < epoch.half_cycle_us();
    let active = match role {
        Role::Reference => reference_active,
        Role::Follower => !reference_active,
    };
    if active {
        Phase::Active
    } else {
        Phase::Inactive
    }
}

/// One actuator command, emitted at most once per detected change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub active: bool,
    pub params: PatternParams,
}

struct PendingProposal {
    proposal: ModeChangeProposal,
    sent_at_sync_us: u64,
}

struct ArmedChange {
    proposal_id: u32,
    epoch: CycleEpoch,
    params: PatternParams,
}

pub struct PhaseScheduler {
    role: Role,
    config: SchedulerConfig,

    current: Option<(CycleEpoch, PatternParams)>,
    armed: Option<ArmedChange>,
    pending: Option<PendingProposal>,
    next_proposal_id: u32,

    /// Last drive command emitted; transitions fire on state equality
    /// comparison, so tick jitter cannot duplicate or drop one.
    last_drive: Option<bool>,
}

impl PhaseScheduler {
    pub fn new(role: Role, config: SchedulerConfig) -> Self {
        PhaseScheduler {
            role,
            config,
            current: None,
            armed: None,
            pending: None,
            next_proposal_id: 0,
            last_drive: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_epoch(&self) -> Option<CycleEpoch> {
        self.current.map(|(e, _)| e)
    }

    pub fn current_params(&self) -> Option<PatternParams> {
        self.current.map(|(_, p)| p)
    }

    pub fn is_mode_change_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.last_drive.unwrap_or(false)
    }

    // ========================================================================
    // EPOCH PUBLICATION / ADOPTION
    // ========================================================================

    /// Set a new cycle epoch locally and build the announcement to broadcast.
    /// Reference role only: a follower broadcasting an epoch would fork the
    /// timeline, so the call is refused outright.
    pub fn publish_epoch(
        &mut self,
        start_time_us: u64,
        cycle_period_us: u64,
        params: PatternParams,
    ) -> Result<EpochAnnounce, SyncError> {
        if self.role != Role::Reference {
            warn!("[SCHED] Refusing to publish an epoch in follower role");
            return Err(SyncError::NotReference);
        }
        let announce = EpochAnnounce {
            epoch_us: start_time_us,
            cycle_period_us,
            params,
        };
        self.adopt_epoch(&announce);
        Ok(announce)
    }

    /// Adopt an announced epoch. Adoption is monotonic: an epoch older than
    /// the one already held is never adopted. Returns whether it was taken.
    pub fn adopt_epoch(&mut self, announce: &EpochAnnounce) -> bool {
        if let Some((held, _)) = self.current {
            if announce.epoch_us < held.epoch_us {
                debug!(
                    "[SCHED] Ignoring stale epoch {}us (holding {}us)",
                    announce.epoch_us, held.epoch_us
                );
                return false;
            }
        }
        self.current = Some((
            CycleEpoch {
                epoch_us: announce.epoch_us,
                cycle_period_us: announce.cycle_period_us,
            },
            announce.params,
        ));
        info!(
            "[SCHED] Epoch adopted: {}us period {}us",
            announce.epoch_us, announce.cycle_period_us
        );
        true
    }

    /// Drop the held epoch (disconnect safety timeout). The next tick coasts
    /// to inactive; nothing else is reset.
    pub fn expire_epoch(&mut self) {
        if self.current.take().is_some() {
            warn!("[SCHED] Epoch expired, coasting to inactive");
        }
        self.armed = None;
        self.pending = None;
    }

    // ========================================================================
    // TICK
    // ========================================================================

    /// Bounded, non-blocking poll. Pass `None` while not synchronized: the
    /// scheduler holds its last commanded state rather than guess.
    ///
    /// Applies an armed mode change the moment synchronized time crosses its
    /// epoch (one atomic swap, never partial), then recomputes the drive
    /// state and returns a transition only if it changed.
    pub fn tick(&mut self, sync_time_us: Option<u64>) -> Option<Transition> {
        let now = match sync_time_us {
            Some(t) => t,
            None => return None,
        };

        let due = matches!(&self.armed, Some(a) if now >= a.epoch.epoch_us);
        if due {
            if let Some(armed) = self.armed.take() {
                self.current = Some((armed.epoch, armed.params));
                info!(
                    "[SCHED] Mode change {} applied at {}us (period {}us)",
                    armed.proposal_id, now, armed.epoch.cycle_period_us
                );
            }
        }

        let drive = match self.current {
            Some((epoch, params)) => self.drive_state(now, &epoch, &params),
            None => false,
        };

        if self.last_drive == Some(drive) {
            return None;
        }
        self.last_drive = Some(drive);
        let params = self.current_params().unwrap_or_default();
        debug!("[SCHED] Transition -> {}", if drive { "ACTIVE" } else { "INACTIVE" });
        Some(Transition {
            active: drive,
            params,
        })
    }

    /// Drive command within our own half-cycle: on for `half * duty%`, then
    /// coast. Duty shaping only ever shortens the window [`compute_phase`]
    /// grants, so it cannot create overlap.
    fn drive_state(&self, sync_time_us: u64, epoch: &CycleEpoch, params: &PatternParams) -> bool {
        if compute_phase(self.role, sync_time_us, epoch) != Phase::Active {
            return false;
        }
        let pos = (sync_time_us - epoch.epoch_us) % epoch.cycle_period_us;
        let pos_in_half = match self.role {
            Role::Reference => pos,
            Role::Follower => pos - epoch.half_cycle_us(),
        };
        let on_window = epoch.half_cycle_us() * params.duty_percent.min(100) as u64 / 100;
        pos_in_half < on_window
    }

    // ========================================================================
    // MODE-CHANGE TWO-PHASE COMMIT
    // ========================================================================

    /// Build a future-dated proposal. The epoch is `now + margin`, where the
    /// margin covers a full communication round trip plus jitter budget. A
    /// newer proposal supersedes any unacknowledged one (last-proposal-wins).
    pub fn propose_mode_change(
        &mut self,
        new_cycle_period_us: u64,
        new_params: PatternParams,
        now_sync_us: u64,
    ) -> ModeChangeProposal {
        if let Some(old) = self.pending.take() {
            info!(
                "[SCHED] Proposal {} superseded before ack",
                old.proposal.proposal_id
            );
        }
        self.next_proposal_id += 1;
        let proposal = ModeChangeProposal {
            proposal_id: self.next_proposal_id,
            proposed_epoch_us: now_sync_us + self.config.proposal_margin_us,
            new_cycle_period_us,
            new_params,
        };
        self.pending = Some(PendingProposal {
            proposal,
            sent_at_sync_us: now_sync_us,
        });
        info!(
            "[SCHED] Proposing mode change {}: epoch {}us period {}us",
            proposal.proposal_id, proposal.proposed_epoch_us, new_cycle_period_us
        );
        proposal
    }

    /// Validate and arm an inbound proposal. On success the caller sends the
    /// acknowledgement. Rejection keeps the current pattern untouched.
    pub fn on_proposal(
        &mut self,
        proposal: &ModeChangeProposal,
        now_sync_us: u64,
    ) -> Result<(), SyncError> {
        if proposal.proposed_epoch_us <= now_sync_us {
            warn!(
                "[SCHED] Rejecting proposal {}: epoch {}us not in the future (now {}us)",
                proposal.proposal_id, proposal.proposed_epoch_us, now_sync_us
            );
            return Err(SyncError::ProposalRejected {
                reason: RejectReason::NotInFuture,
            });
        }
        if let Some(armed) = &self.armed {
            if proposal.proposed_epoch_us < armed.epoch.epoch_us {
                warn!(
                    "[SCHED] Rejecting proposal {}: older than armed change {}",
                    proposal.proposal_id, armed.proposal_id
                );
                return Err(SyncError::ProposalRejected {
                    reason: RejectReason::Superseded,
                });
            }
        }
        self.arm(proposal);
        Ok(())
    }

    /// Peer acknowledged our pending proposal: arm it locally.
    pub fn on_proposal_ack(&mut self, proposal_id: u32) -> bool {
        match &self.pending {
            Some(p) if p.proposal.proposal_id == proposal_id => {
                let proposal = p.proposal;
                self.pending = None;
                self.arm(&proposal);
                true
            }
            _ => {
                debug!("[SCHED] Ack for unknown proposal {}, ignored", proposal_id);
                false
            }
        }
    }

    /// Explicit cancel prior to the epoch. Once the boundary is crossed the
    /// swap has happened and is not revocable.
    pub fn on_proposal_cancel(&mut self, proposal_id: u32) {
        if let Some(armed) = &self.armed {
            if armed.proposal_id == proposal_id {
                info!("[SCHED] Armed change {} cancelled", proposal_id);
                self.armed = None;
            }
        }
        if let Some(p) = &self.pending {
            if p.proposal.proposal_id == proposal_id {
                self.pending = None;
            }
        }
    }

    /// Drop a pending proposal whose acknowledgement never arrived. Returns
    /// the dropped proposal id so the caller can notify the peer.
    pub fn check_proposal_timeout(&mut self, now_sync_us: u64) -> Option<u32> {
        let timed_out = match &self.pending {
            Some(p) => now_sync_us.saturating_sub(p.sent_at_sync_us)
                > self.config.proposal_ack_timeout_us,
            None => false,
        };
        if timed_out {
            if let Some(p) = self.pending.take() {
                warn!(
                    "[SCHED] Proposal {} dropped: {}",
                    p.proposal.proposal_id,
                    RejectReason::AckTimeout
                );
                return Some(p.proposal.proposal_id);
            }
        }
        None
    }

    fn arm(&mut self, proposal: &ModeChangeProposal) {
        self.armed = Some(ArmedChange {
            proposal_id: proposal.proposal_id,
            epoch: CycleEpoch {
                epoch_us: proposal.proposed_epoch_us,
                cycle_period_us: proposal.new_cycle_period_us,
            },
            params: proposal.new_params,
        });
        info!(
            "[SCHED] Mode change {} armed for {}us",
            proposal.proposal_id, proposal.proposed_epoch_us
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;

    fn scheduler(role: Role) -> PhaseScheduler {
        let _ = env_logger::builder().is_test(true).try_init();
        PhaseScheduler::new(role, SystemConfig::default().scheduler)
    }

    fn epoch(epoch_us: u64, cycle_period_us: u64) -> CycleEpoch {
        CycleEpoch {
            epoch_us,
            cycle_period_us,
        }
    }

    #[test]
    fn test_basic_antiphase() {
        // cycle 1000ms, epoch 0: at 200ms reference is active, at 700ms the
        // follower is.
        let e = epoch(0, 1_000_000);
        assert_eq!(compute_phase(Role::Reference, 200_000, &e), Phase::Active);
        assert_eq!(compute_phase(Role::Follower, 200_000, &e), Phase::Inactive);
        assert_eq!(compute_phase(Role::Reference, 700_000, &e), Phase::Inactive);
        assert_eq!(compute_phase(Role::Follower, 700_000, &e), Phase::Active);
    }

    #[test]
    fn test_exactly_one_side_active_at_boundaries() {
        let e = epoch(0, 1_000_000);
        for t in [0u64, 499_999, 500_000, 999_999, 1_000_000, 1_500_000] {
            let r = compute_phase(Role::Reference, t, &e);
            let f = compute_phase(Role::Follower, t, &e);
            assert_ne!(r, f, "both sides agree at t={}", t);
        }
    }

    #[test]
    fn test_never_both_active_randomized() {
        let e = epoch(123_456, 2_000_000);
        let mut t = 123_456u64;
        // Walk an irregular comb of instants across many cycles.
        for i in 0..10_000u64 {
            t += 137 + (i * 7919) % 911;
            let r = compute_phase(Role::Reference, t, &e);
            let f = compute_phase(Role::Follower, t, &e);
            assert!(
                !(r == Phase::Active && f == Phase::Active),
                "overlap at t={}",
                t
            );
        }
    }

    #[test]
    fn test_inactive_before_epoch() {
        let e = epoch(5_000_000, 1_000_000);
        assert_eq!(compute_phase(Role::Reference, 4_999_999, &e), Phase::Inactive);
        assert_eq!(compute_phase(Role::Follower, 4_999_999, &e), Phase::Inactive);
    }

    #[test]
    fn test_follower_cannot_publish_epoch() {
        let mut sched = scheduler(Role::Follower);
        let err = sched
            .publish_epoch(1_000_000, 1_000_000, PatternParams::default())
            .unwrap_err();
        assert_eq!(err, SyncError::NotReference);
        assert!(sched.current_epoch().is_none());
    }

    #[test]
    fn test_epoch_adoption_is_monotonic() {
        let mut sched = scheduler(Role::Follower);
        assert!(sched.adopt_epoch(&EpochAnnounce {
            epoch_us: 10_000,
            cycle_period_us: 1_000_000,
            params: PatternParams::default(),
        }));
        // Older epoch never adopted.
        assert!(!sched.adopt_epoch(&EpochAnnounce {
            epoch_us: 9_999,
            cycle_period_us: 500_000,
            params: PatternParams::default(),
        }));
        assert_eq!(sched.current_epoch().unwrap().cycle_period_us, 1_000_000);
        // Newer one is.
        assert!(sched.adopt_epoch(&EpochAnnounce {
            epoch_us: 20_000,
            cycle_period_us: 500_000,
            params: PatternParams::default(),
        }));
    }

    #[test]
    fn test_tick_fires_once_per_transition() {
        let mut sched = scheduler(Role::Reference);
        sched
            .publish_epoch(
                0,
                1_000_000,
                PatternParams {
                    intensity: 80,
                    duty_percent: 100,
                },
            )
            .unwrap();

        // First tick inside the active half commands ON.
        let t = sched.tick(Some(10_000)).expect("initial transition");
        assert!(t.active);
        assert_eq!(t.params.intensity, 80);

        // Jittered re-polls inside the same phase stay quiet.
        assert!(sched.tick(Some(11_000)).is_none());
        assert!(sched.tick(Some(480_000)).is_none());

        // Crossing the half-cycle commands OFF exactly once, even if the
        // poll lands late.
        let t = sched.tick(Some(503_713)).expect("off transition");
        assert!(!t.active);
        assert!(sched.tick(Some(700_000)).is_none());
    }

    #[test]
    fn test_duty_shapes_drive_within_active_half() {
        let mut sched = scheduler(Role::Reference);
        // 50% duty of the 500ms half: drive for 250ms, coast for 250ms.
        sched
            .publish_epoch(
                0,
                1_000_000,
                PatternParams {
                    intensity: 60,
                    duty_percent: 50,
                },
            )
            .unwrap();
        assert!(sched.tick(Some(100_000)).unwrap().active);
        let t = sched.tick(Some(300_000)).expect("duty coast");
        assert!(!t.active);
        // No further transition at the half boundary: already coasting.
        assert!(sched.tick(Some(600_000)).is_none());
    }

    #[test]
    fn test_tick_holds_phase_when_not_synchronized() {
        let mut sched = scheduler(Role::Follower);
        sched.adopt_epoch(&EpochAnnounce {
            epoch_us: 0,
            cycle_period_us: 1_000_000,
            params: PatternParams {
                intensity: 60,
                duty_percent: 100,
            },
        });
        assert!(sched.tick(Some(700_000)).unwrap().active);
        // Sync lost: hold, do not guess.
        assert!(sched.tick(None).is_none());
        assert!(sched.is_active());
    }

    #[test]
    fn test_proposal_round_trip_and_atomic_swap() {
        let mut reference = scheduler(Role::Reference);
        let mut follower = scheduler(Role::Follower);
        let announce = reference
            .publish_epoch(
                0,
                1_000_000,
                PatternParams {
                    intensity: 60,
                    duty_percent: 100,
                },
            )
            .unwrap();
        follower.adopt_epoch(&announce);

        let now = 10_000_000u64;
        let proposal = reference.propose_mode_change(
            500_000,
            PatternParams {
                intensity: 90,
                duty_percent: 100,
            },
            now,
        );
        assert_eq!(proposal.proposed_epoch_us, now + 2_000_000);

        // Follower validates, arms, acks; reference arms on the ack.
        follower.on_proposal(&proposal, now + 50_000).unwrap();
        assert!(follower.is_mode_change_armed());
        assert!(reference.on_proposal_ack(proposal.proposal_id));
        assert!(reference.is_mode_change_armed());

        // Before the boundary both still run the old period.
        reference.tick(Some(now + 100_000));
        assert_eq!(reference.current_epoch().unwrap().cycle_period_us, 1_000_000);

        // Crossing the boundary swaps atomically on both sides.
        reference.tick(Some(proposal.proposed_epoch_us + 1));
        follower.tick(Some(proposal.proposed_epoch_us + 1));
        assert_eq!(reference.current_epoch().unwrap().cycle_period_us, 500_000);
        assert_eq!(follower.current_epoch().unwrap().cycle_period_us, 500_000);
        assert!(!reference.is_mode_change_armed());
        assert_eq!(reference.current_params().unwrap().intensity, 90);
    }

    #[test]
    fn test_proposal_rejected_when_not_in_future() {
        let mut sched = scheduler(Role::Follower);
        let proposal = ModeChangeProposal {
            proposal_id: 1,
            proposed_epoch_us: 1_000_000,
            new_cycle_period_us: 500_000,
            new_params: PatternParams::default(),
        };
        let err = sched.on_proposal(&proposal, 1_000_000).unwrap_err();
        assert_eq!(
            err,
            SyncError::ProposalRejected {
                reason: RejectReason::NotInFuture
            }
        );
        assert!(!sched.is_mode_change_armed());
    }

    #[test]
    fn test_newer_proposal_supersedes_older_armed_rejected() {
        let mut sched = scheduler(Role::Follower);
        let newer = ModeChangeProposal {
            proposal_id: 2,
            proposed_epoch_us: 8_000_000,
            new_cycle_period_us: 500_000,
            new_params: PatternParams::default(),
        };
        let older = ModeChangeProposal {
            proposal_id: 1,
            proposed_epoch_us: 6_000_000,
            new_cycle_period_us: 750_000,
            new_params: PatternParams::default(),
        };
        sched.on_proposal(&newer, 1_000_000).unwrap();
        let err = sched.on_proposal(&older, 1_000_000).unwrap_err();
        assert_eq!(
            err,
            SyncError::ProposalRejected {
                reason: RejectReason::Superseded
            }
        );
        // A newer one replaces the armed change (last-proposal-wins).
        let newest = ModeChangeProposal {
            proposal_id: 3,
            proposed_epoch_us: 9_000_000,
            new_cycle_period_us: 250_000,
            new_params: PatternParams::default(),
        };
        sched.on_proposal(&newest, 1_000_000).unwrap();
        sched.tick(Some(9_000_001));
        assert_eq!(sched.current_epoch().unwrap().cycle_period_us, 250_000);
    }

    #[test]
    fn test_unacknowledged_proposal_times_out_without_effect() {
        let mut sched = scheduler(Role::Reference);
        sched
            .publish_epoch(0, 1_000_000, PatternParams::default())
            .unwrap();
        let proposal =
            sched.propose_mode_change(500_000, PatternParams::default(), 1_000_000);

        // No ack within the timeout: dropped, current pattern untouched.
        let dropped = sched.check_proposal_timeout(1_000_000 + 1_000_001);
        assert_eq!(dropped, Some(proposal.proposal_id));
        assert!(!sched.is_mode_change_armed());
        // A late ack is now meaningless.
        assert!(!sched.on_proposal_ack(proposal.proposal_id));
        assert_eq!(sched.current_epoch().unwrap().cycle_period_us, 1_000_000);
    }

    #[test]
    fn test_cancel_disarms_before_boundary() {
        let mut sched = scheduler(Role::Follower);
        let proposal = ModeChangeProposal {
            proposal_id: 5,
            proposed_epoch_us: 4_000_000,
            new_cycle_period_us: 500_000,
            new_params: PatternParams::default(),
        };
        sched.on_proposal(&proposal, 1_000_000).unwrap();
        sched.on_proposal_cancel(5);
        assert!(!sched.is_mode_change_armed());
        sched.tick(Some(4_000_001));
        assert!(sched.current_epoch().is_none());
    }

    #[test]
    fn test_expire_epoch_coasts_inactive() {
        let mut sched = scheduler(Role::Reference);
        sched
            .publish_epoch(
                0,
                1_000_000,
                PatternParams {
                    intensity: 60,
                    duty_percent: 100,
                },
            )
            .unwrap();
        assert!(sched.tick(Some(10_000)).unwrap().active);

        sched.expire_epoch();
        let t = sched.tick(Some(20_000)).expect("coast transition");
        assert!(!t.active);
    }
}
