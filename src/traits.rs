use anyhow::Result;

/// Motor direction for a bilateral pair. Left and right units run opposite
/// directions so the felt motion alternates sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Source of the node's free-running local clock, in microseconds since boot.
/// Must be monotonic; wall-clock steps would corrupt the offset filter.
#[cfg_attr(test, mockall::automock)]
pub trait LocalClock {
    fn now_us(&self) -> u64;
}

/// Transport-owned message channel between the two nodes.
///
/// `recv` returns Ok(Some((payload, capture_time_us))) when a frame is
/// available. The capture timestamp must be taken as close to the physical
/// receipt event as the transport allows; sync accuracy is bounded by that
/// latency. Returns Ok(None) when nothing is pending (never blocks).
#[cfg_attr(test, mockall::automock)]
pub trait CoordinationChannel {
    fn send(&mut self, payload: &[u8]) -> Result<()>;
    fn recv(&mut self) -> Result<Option<(Vec<u8>, u64)>>;
}

/// Hardware-owned actuator. Called at most once per detected phase
/// transition, from the scheduler's tick context.
#[cfg_attr(test, mockall::automock)]
pub trait ActuatorDriver {
    fn set_phase(&mut self, active: bool, direction: Direction, intensity: u8);
}
