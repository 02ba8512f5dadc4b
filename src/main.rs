//! Two-node coordination simulator.
//!
//! Runs a reference and a follower controller in one process over a simulated
//! lossy link with configurable delay, jitter, clock skew and drift, and
//! reports sync quality and actuator overlap. Useful for tuning filter and
//! scheduler parameters without hardware.

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use antiphase::config::SystemConfig;
use antiphase::controller::CoordinationController;
use antiphase::messages::PatternParams;
use antiphase::scheduler::Role;
use antiphase::traits::{ActuatorDriver, CoordinationChannel, Direction, LocalClock};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Simulated run length in seconds.
    #[arg(long, default_value_t = 120)]
    duration_secs: u64,

    /// Frame loss probability per send, 0.0-1.0.
    #[arg(long, default_value_t = 0.05)]
    loss: f64,

    /// Base one-way link delay in microseconds.
    #[arg(long, default_value_t = 3_000)]
    delay_us: u64,

    /// Additional uniform delivery jitter in microseconds.
    #[arg(long, default_value_t = 2_000)]
    jitter_us: u64,

    /// Reference clock drift in ppm against the virtual timeline.
    #[arg(long, default_value_t = 20.0, allow_hyphen_values = true)]
    drift_reference_ppm: f64,

    /// Follower clock drift in ppm against the virtual timeline.
    #[arg(long, default_value_t = -30.0, allow_hyphen_values = true)]
    drift_follower_ppm: f64,

    /// Initial follower clock skew in milliseconds.
    #[arg(long, default_value_t = 1_500)]
    skew_ms: u64,

    /// Cycle period in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    period_ms: u64,

    /// Actuator intensity, 0-100.
    #[arg(long, default_value_t = 70)]
    intensity: u8,

    /// Drive duty as a percentage of the half-cycle.
    #[arg(long, default_value_t = 80)]
    duty: u8,

    /// Propose halving the period this many seconds in (0 disables).
    #[arg(long, default_value_t = 0)]
    mode_change_at_secs: u64,

    /// RNG seed for reproducible runs.
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

const REFERENCE: usize = 0;
const FOLLOWER: usize = 1;

/// In-flight frames per direction; overflow drops rather than blocks.
const LINK_QUEUE_CAP: usize = 64;

struct World {
    virtual_us: u64,
    rng: StdRng,
    loss: f64,
    base_delay_us: u64,
    jitter_us: u64,
    skew_us: [f64; 2],
    drift_ppm: [f64; 2],
    queues: [VecDeque<(Vec<u8>, u64)>; 2],
    driving: [bool; 2],
}

impl World {
    fn local_time_at(&self, node: usize, virtual_us: u64) -> u64 {
        let scaled = virtual_us as f64 * (1.0 + self.drift_ppm[node] / 1_000_000.0);
        (scaled + self.skew_us[node]).max(0.0) as u64
    }
}

#[derive(Clone)]
struct SimClock {
    world: Arc<Mutex<World>>,
    node: usize,
}

impl LocalClock for SimClock {
    fn now_us(&self) -> u64 {
        let w = self.world.lock().unwrap();
        w.local_time_at(self.node, w.virtual_us)
    }
}

struct SimLink {
    world: Arc<Mutex<World>>,
    node: usize,
}

impl CoordinationChannel for SimLink {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut w = self.world.lock().unwrap();
        let loss = w.loss;
        let jitter_max = w.jitter_us;
        if w.rng.random::<f64>() < loss {
            return Ok(());
        }
        let jitter = if jitter_max > 0 {
            w.rng.random_range(0..=jitter_max)
        } else {
            0
        };
        let deliver_at = w.virtual_us + w.base_delay_us + jitter;
        let peer = 1 - self.node;
        if w.queues[peer].len() >= LINK_QUEUE_CAP {
            warn!("[SIM] Link queue full, dropping frame");
            return Ok(());
        }
        w.queues[peer].push_back((payload.to_vec(), deliver_at));
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        let mut w = self.world.lock().unwrap();
        let now = w.virtual_us;
        let ready = w.queues[self.node].iter().position(|(_, at)| *at <= now);
        match ready {
            Some(idx) => {
                let (frame, at) = w.queues[self.node].remove(idx).expect("position was valid");
                let capture = w.local_time_at(self.node, at);
                Ok(Some((frame, capture)))
            }
            None => Ok(None),
        }
    }
}

struct SimActuator {
    world: Arc<Mutex<World>>,
    node: usize,
    name: &'static str,
}

impl ActuatorDriver for SimActuator {
    fn set_phase(&mut self, active: bool, direction: Direction, intensity: u8) {
        let mut w = self.world.lock().unwrap();
        w.driving[self.node] = active;
        info!(
            "[SIM] t={}ms {} -> {} ({:?}, intensity {})",
            w.virtual_us / 1000,
            self.name,
            if active { "ACTIVE" } else { "inactive" },
            direction,
            intensity
        );
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let world = Arc::new(Mutex::new(World {
        virtual_us: 0,
        rng: StdRng::seed_from_u64(args.seed),
        loss: args.loss,
        base_delay_us: args.delay_us,
        jitter_us: args.jitter_us,
        skew_us: [0.0, args.skew_ms as f64 * 1000.0],
        drift_ppm: [args.drift_reference_ppm, args.drift_follower_ppm],
        queues: [VecDeque::new(), VecDeque::new()],
        driving: [false, false],
    }));

    let config = SystemConfig::default();
    let tick_us = config.scheduler.tick_interval_ms as u64 * 1000;

    let mut reference = CoordinationController::new(
        SimClock {
            world: Arc::clone(&world),
            node: REFERENCE,
        },
        SimLink {
            world: Arc::clone(&world),
            node: REFERENCE,
        },
        SimActuator {
            world: Arc::clone(&world),
            node: REFERENCE,
            name: "reference",
        },
        Role::Reference,
        Direction::Forward,
        config.clone(),
    );
    let mut follower = CoordinationController::new(
        SimClock {
            world: Arc::clone(&world),
            node: FOLLOWER,
        },
        SimLink {
            world: Arc::clone(&world),
            node: FOLLOWER,
        },
        SimActuator {
            world: Arc::clone(&world),
            node: FOLLOWER,
            name: "follower ",
        },
        Role::Follower,
        Direction::Reverse,
        config,
    );

    let params = PatternParams {
        intensity: args.intensity,
        duty_percent: args.duty,
    };
    let period_us = args.period_ms * 1000;
    reference.start_cycle(period_us, params)?;
    info!(
        "[SIM] Starting: period {}ms, duty {}%, loss {:.0}%, drift {:+.0}/{:+.0}ppm",
        args.period_ms,
        args.duty,
        args.loss * 100.0,
        args.drift_reference_ppm,
        args.drift_follower_ppm
    );

    let follower_status = follower.status_handle();
    let end_us = args.duration_secs * 1_000_000;
    let mut overlap_us = 0u64;
    let mut next_report_us = 0u64;
    let mut mode_change_sent = args.mode_change_at_secs == 0;

    loop {
        let now_us = {
            let mut w = world.lock().unwrap();
            w.virtual_us += tick_us;
            w.virtual_us
        };
        if now_us > end_us {
            break;
        }

        reference.poll()?;
        follower.poll()?;

        if !mode_change_sent && now_us >= args.mode_change_at_secs * 1_000_000 {
            mode_change_sent = true;
            info!("[SIM] Requesting period change to {}ms", args.period_ms / 2);
            reference.request_mode_change(period_us / 2, params)?;
        }

        {
            let w = world.lock().unwrap();
            if w.driving[REFERENCE] && w.driving[FOLLOWER] {
                overlap_us += tick_us;
            }
        }

        if now_us >= next_report_us {
            next_report_us = now_us + 10_000_000;
            let status = follower_status.read().expect("status lock poisoned");
            info!(
                "[SIM] t={}s follower {}",
                now_us / 1_000_000,
                serde_json::to_string(&*status)?
            );
        }
    }

    let status = follower_status.read().expect("status lock poisoned");
    info!(
        "[SIM] Done: state {}, quality {}%, offset {:+}us, drift {:+}ppb, interval {}ms",
        status.sync_state,
        status.quality,
        status.filtered_offset_us,
        status.drift_rate_ppb,
        status.beacon_interval_ms
    );
    if overlap_us > 0 {
        error!("[SIM] Actuators overlapped for {}ms", overlap_us / 1000);
    } else {
        info!("[SIM] No actuator overlap observed");
    }
    if status.quality < 50 {
        warn!("[SIM] Final sync quality below fair");
    }
    Ok(())
}
