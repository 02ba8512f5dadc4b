use thiserror::Error;

/// Why an inbound mode-change proposal was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Proposed epoch is not strictly in the future of our synchronized clock.
    NotInFuture,
    /// A proposal with a newer epoch is already armed or pending.
    Superseded,
    /// Acknowledgement never arrived within the timeout window.
    AckTimeout,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NotInFuture => write!(f, "epoch not in the future"),
            RejectReason::Superseded => write!(f, "superseded by newer proposal"),
            RejectReason::AckTimeout => write!(f, "acknowledgement timed out"),
        }
    }
}

/// Recoverable local conditions of the sync/scheduling core.
///
/// None of these unwind scheduling. The worst case is graceful degradation
/// toward extrapolated, lower-confidence timing; the scheduler holds its last
/// phase rather than guess.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No valid beacon received yet, or the clock-underflow guard fired.
    #[error("not synchronized")]
    NotSynchronized,

    /// Sequence number not newer than the last accepted one.
    #[error("stale or duplicate message (seq {received}, last accepted {last_accepted})")]
    StaleOrDuplicateMessage { received: u32, last_accepted: u32 },

    /// A mode-change proposal was refused.
    #[error("proposal rejected: {reason}")]
    ProposalRejected { reason: RejectReason },

    /// No message within the adaptive interval's upper bound. State is frozen,
    /// never reset.
    #[error("link lost, extrapolating from frozen state")]
    LinkLost,

    /// Operation reserved for the reference role; the follower never
    /// originates the timeline.
    #[error("not the timing reference")]
    NotReference,

    /// Frame shorter than its declared layout.
    #[error("truncated message ({got} bytes, need {need})")]
    Truncated { got: usize, need: usize },

    /// CRC trailer did not match the frame contents.
    #[error("checksum mismatch (calculated {calculated:#06x}, received {received:#06x})")]
    ChecksumMismatch { calculated: u16, received: u16 },

    /// First byte is not a known message discriminant.
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),
}
