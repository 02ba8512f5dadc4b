//! Coordination message set and wire codec.
//!
//! Frame layout: one discriminant byte, a fixed-size big-endian body, and a
//! CRC-16/CCITT trailer computed over everything before it. The transport
//! delivers whole frames; anything shorter than its declared layout or with a
//! bad trailer is dropped by the caller.

use byteorder::{BigEndian, ByteOrder};

use crate::error::SyncError;

/// CRC-16/CCITT polynomial, same integrity check on every frame.
const CRC16_POLY: u16 = 0x1021;

const TYPE_BEACON: u8 = 0x01;
const TYPE_REPORT: u8 = 0x02;
const TYPE_EPOCH: u8 = 0x03;
const TYPE_PROPOSAL: u8 = 0x04;
const TYPE_ACK: u8 = 0x05;
const TYPE_CANCEL: u8 = 0x06;

/// One-way timestamped message from the reference node, once per adaptive
/// interval. The sequence number makes adoption monotonic: a beacon whose
/// sequence is not newer than the last accepted one is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub reference_time_us: u64,
    pub sequence: u32,
}

/// Round-trip echo from the follower. T1 is echoed from the beacon that
/// prompted it; the reference supplies its own receipt time T4 and computes
/// the bias-corrected offset `((T2-T1)+(T3-T4))/2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairedTimestampReport {
    pub beacon_ref_time_us: u64,
    pub local_rx_time_us: u64,
    pub local_tx_time_us: u64,
    pub sequence: u32,
}

/// Actuator pattern parameters carried with an epoch or a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternParams {
    /// Actuator intensity, 0-100.
    pub intensity: u8,
    /// Active drive time as a percentage of the half-cycle (25-50 typical).
    pub duty_percent: u8,
}

impl Default for PatternParams {
    fn default() -> Self {
        PatternParams {
            intensity: 60,
            duty_percent: 50,
        }
    }
}

/// Reference-published cycle start. Adoption is monotonic on `epoch_us`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochAnnounce {
    pub epoch_us: u64,
    pub cycle_period_us: u64,
    pub params: PatternParams,
}

/// Future-dated parameter change, applied by both nodes at `proposed_epoch_us`
/// once acknowledged. A newer proposal supersedes an unacknowledged one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChangeProposal {
    pub proposal_id: u32,
    pub proposed_epoch_us: u64,
    pub new_cycle_period_us: u64,
    pub new_params: PatternParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Beacon(Beacon),
    Report(PairedTimestampReport),
    Epoch(EpochAnnounce),
    Proposal(ModeChangeProposal),
    ProposalAck { proposal_id: u32 },
    ProposalCancel { proposal_id: u32 },
}

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC16_POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        match self {
            Message::Beacon(b) => {
                buf.push(TYPE_BEACON);
                push_u64(&mut buf, b.reference_time_us);
                push_u32(&mut buf, b.sequence);
            }
            Message::Report(r) => {
                buf.push(TYPE_REPORT);
                push_u64(&mut buf, r.beacon_ref_time_us);
                push_u64(&mut buf, r.local_rx_time_us);
                push_u64(&mut buf, r.local_tx_time_us);
                push_u32(&mut buf, r.sequence);
            }
            Message::Epoch(e) => {
                buf.push(TYPE_EPOCH);
                push_u64(&mut buf, e.epoch_us);
                push_u64(&mut buf, e.cycle_period_us);
                buf.push(e.params.intensity);
                buf.push(e.params.duty_percent);
            }
            Message::Proposal(p) => {
                buf.push(TYPE_PROPOSAL);
                push_u32(&mut buf, p.proposal_id);
                push_u64(&mut buf, p.proposed_epoch_us);
                push_u64(&mut buf, p.new_cycle_period_us);
                buf.push(p.new_params.intensity);
                buf.push(p.new_params.duty_percent);
            }
            Message::ProposalAck { proposal_id } => {
                buf.push(TYPE_ACK);
                push_u32(&mut buf, *proposal_id);
            }
            Message::ProposalCancel { proposal_id } => {
                buf.push(TYPE_CANCEL);
                push_u32(&mut buf, *proposal_id);
            }
        }
        let crc = crc16(&buf);
        let mut trailer = [0u8; 2];
        BigEndian::write_u16(&mut trailer, crc);
        buf.extend_from_slice(&trailer);
        buf
    }

    pub fn decode(frame: &[u8]) -> Result<Message, SyncError> {
        if frame.len() < 3 {
            return Err(SyncError::Truncated {
                got: frame.len(),
                need: 3,
            });
        }

        let (body, trailer) = frame.split_at(frame.len() - 2);
        let received = BigEndian::read_u16(trailer);
        let calculated = crc16(body);
        if received != calculated {
            return Err(SyncError::ChecksumMismatch {
                calculated,
                received,
            });
        }

        let kind = body[0];
        let payload = &body[1..];
        match kind {
            TYPE_BEACON => {
                need(payload, 12)?;
                Ok(Message::Beacon(Beacon {
                    reference_time_us: BigEndian::read_u64(&payload[0..8]),
                    sequence: BigEndian::read_u32(&payload[8..12]),
                }))
            }
            TYPE_REPORT => {
                need(payload, 28)?;
                Ok(Message::Report(PairedTimestampReport {
                    beacon_ref_time_us: BigEndian::read_u64(&payload[0..8]),
                    local_rx_time_us: BigEndian::read_u64(&payload[8..16]),
                    local_tx_time_us: BigEndian::read_u64(&payload[16..24]),
                    sequence: BigEndian::read_u32(&payload[24..28]),
                }))
            }
            TYPE_EPOCH => {
                need(payload, 18)?;
                Ok(Message::Epoch(EpochAnnounce {
                    epoch_us: BigEndian::read_u64(&payload[0..8]),
                    cycle_period_us: BigEndian::read_u64(&payload[8..16]),
                    params: PatternParams {
                        intensity: payload[16],
                        duty_percent: payload[17],
                    },
                }))
            }
            TYPE_PROPOSAL => {
                need(payload, 22)?;
                Ok(Message::Proposal(ModeChangeProposal {
                    proposal_id: BigEndian::read_u32(&payload[0..4]),
                    proposed_epoch_us: BigEndian::read_u64(&payload[4..12]),
                    new_cycle_period_us: BigEndian::read_u64(&payload[12..20]),
                    new_params: PatternParams {
                        intensity: payload[20],
                        duty_percent: payload[21],
                    },
                }))
            }
            TYPE_ACK => {
                need(payload, 4)?;
                Ok(Message::ProposalAck {
                    proposal_id: BigEndian::read_u32(&payload[0..4]),
                })
            }
            TYPE_CANCEL => {
                need(payload, 4)?;
                Ok(Message::ProposalCancel {
                    proposal_id: BigEndian::read_u32(&payload[0..4]),
                })
            }
            other => Err(SyncError::UnknownMessageType(other)),
        }
    }
}

fn need(payload: &[u8], len: usize) -> Result<(), SyncError> {
    if payload.len() < len {
        Err(SyncError::Truncated {
            got: payload.len(),
            need: len,
        })
    } else {
        Ok(())
    }
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 8];
    BigEndian::write_u64(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    let mut tmp = [0u8; 4];
    BigEndian::write_u32(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_roundtrip() {
        let msg = Message::Beacon(Beacon {
            reference_time_us: 123_456_789_012,
            sequence: 42,
        });
        let frame = msg.encode();
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_report_roundtrip() {
        let msg = Message::Report(PairedTimestampReport {
            beacon_ref_time_us: 1_000_000,
            local_rx_time_us: 1_020_000,
            local_tx_time_us: 1_020_500,
            sequence: 7,
        });
        let frame = msg.encode();
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_epoch_roundtrip() {
        let msg = Message::Epoch(EpochAnnounce {
            epoch_us: 5_000_000,
            cycle_period_us: 2_000_000,
            params: PatternParams {
                intensity: 85,
                duty_percent: 40,
            },
        });
        let frame = msg.encode();
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_proposal_and_control_roundtrip() {
        let msg = Message::Proposal(ModeChangeProposal {
            proposal_id: 3,
            proposed_epoch_us: 9_000_000,
            new_cycle_period_us: 500_000,
            new_params: PatternParams {
                intensity: 100,
                duty_percent: 25,
            },
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);

        let ack = Message::ProposalAck { proposal_id: 3 };
        assert_eq!(Message::decode(&ack.encode()).unwrap(), ack);

        let cancel = Message::ProposalCancel { proposal_id: 3 };
        assert_eq!(Message::decode(&cancel.encode()).unwrap(), cancel);
    }

    #[test]
    fn test_corrupt_trailer_rejected() {
        let mut frame = Message::Beacon(Beacon {
            reference_time_us: 1,
            sequence: 1,
        })
        .encode();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            Message::decode(&frame),
            Err(SyncError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_flipped_body_bit_rejected() {
        let mut frame = Message::Epoch(EpochAnnounce {
            epoch_us: 77,
            cycle_period_us: 88,
            params: PatternParams::default(),
        })
        .encode();
        frame[5] ^= 0x01;
        assert!(matches!(
            Message::decode(&frame),
            Err(SyncError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let frame = Message::Beacon(Beacon {
            reference_time_us: 1,
            sequence: 1,
        })
        .encode();
        assert!(matches!(
            Message::decode(&frame[..2]),
            Err(SyncError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = vec![0x7Fu8, 0, 0, 0, 0, 0];
        let n = buf.len();
        let crc = crc16(&buf[..n - 2]);
        BigEndian::write_u16(&mut buf[n - 2..], crc);
        assert!(matches!(
            Message::decode(&buf),
            Err(SyncError::UnknownMessageType(0x7F))
        ));
    }

    #[test]
    fn test_crc_known_vector() {
        // CRC-16/CCITT-FALSE of "123456789" is 0x29B1.
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }
}
