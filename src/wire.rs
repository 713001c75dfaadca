//! The on-wire message framing: the 1-byte header that makes every message
//! self-describing, target addressing, and the per-class byte overhead used to
//! size payloads against the packet budget.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Hard upper bound for one packed blob. The host transport replicates at most
/// this many bytes per tick.
pub const MAX_PACKET_LEN: usize = 512;

/// Payload length prefix width.
pub const LEN_PREFIX_LEN: usize = 2;

/// Wire size of a complete ack message: header, addressed slot, start id,
/// ack mask.
pub const ACK_WIRE_LEN: usize = 6;

const CLASS_MASK: u8 = 0b0000_0011;
const TARGET_KIND_SHIFT: u8 = 2;

/// Delivery class of an application message, as chosen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// Fire and forget. No retransmission, no ordering, possible duplication.
    Unreliable,
    /// Retransmitted until every addressed peer acknowledges. No ordering
    /// relative to other messages.
    Reliable,
    /// Reliable, and delivered in assigned order within its send-group.
    ReliableSequenced,
}

/// Low two header bits: what kind of message follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageClass {
    Unreliable = 0,
    Reliable = 1,
    ReliableSequenced = 2,
    Ack = 3,
}

impl From<Reliability> for MessageClass {
    fn from(value: Reliability) -> Self {
        match value {
            Reliability::Unreliable => MessageClass::Unreliable,
            Reliability::Reliable => MessageClass::Reliable,
            Reliability::ReliableSequenced => MessageClass::ReliableSequenced,
        }
    }
}

/// Header bits 2-3: how the message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TargetKind {
    All = 0,
    Master = 1,
    Single = 2,
    Multiple = 3,
}

/// A message's resolved addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    Master,
    Single(u8),
    Multiple(u64),
}

impl Target {
    pub fn kind(&self) -> TargetKind {
        match self {
            Target::All => TargetKind::All,
            Target::Master => TargetKind::Master,
            Target::Single(_) => TargetKind::Single,
            Target::Multiple(_) => TargetKind::Multiple,
        }
    }

    /// Bytes this addressing occupies after the header byte.
    pub fn addressing_len(&self, mask_bytes: usize) -> usize {
        match self {
            Target::All | Target::Master => 0,
            Target::Single(_) => 1,
            Target::Multiple(_) => mask_bytes,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut, mask_bytes: usize) {
        match *self {
            Target::All | Target::Master => {}
            Target::Single(slot) => buf.put_u8(slot),
            Target::Multiple(mask) => {
                // lowest slots in the first byte
                for i in 0..mask_bytes {
                    buf.put_u8((mask >> (i * 8)) as u8);
                }
            }
        }
    }

    pub fn try_deser(
        kind: TargetKind,
        mask_bytes: usize,
        buf: &mut impl Buf,
    ) -> anyhow::Result<Target> {
        match kind {
            TargetKind::All => Ok(Target::All),
            TargetKind::Master => Ok(Target::Master),
            TargetKind::Single => Ok(Target::Single(buf.try_get_u8()?)),
            TargetKind::Multiple => {
                let mut mask = 0u64;
                for i in 0..mask_bytes {
                    mask |= (buf.try_get_u8()? as u64) << (i * 8);
                }
                Ok(Target::Multiple(mask))
            }
        }
    }
}

pub fn pack_header(class: MessageClass, kind: TargetKind) -> u8 {
    u8::from(class) | (u8::from(kind) << TARGET_KIND_SHIFT)
}

pub fn unpack_header(header: u8) -> anyhow::Result<(MessageClass, TargetKind)> {
    if header >> 4 != 0 {
        bail!("header byte {:#04x} has unused bits set", header);
    }
    let class = MessageClass::try_from(header & CLASS_MASK)
        .map_err(|_| anyhow!("invalid message class in header {:#04x}", header))?;
    let kind = TargetKind::try_from((header >> TARGET_KIND_SHIFT) & CLASS_MASK)
        .map_err(|_| anyhow!("invalid target kind in header {:#04x}", header))?;
    Ok((class, kind))
}

/// Width of the multiple-target slot mask for a given connection table size.
pub fn mask_bytes(total_connections: usize) -> usize {
    (total_connections - 1) / 8 + 1
}

/// Per-message wire overhead before the payload: header byte, addressing,
/// reliable id, sequence index, length prefix.
pub fn message_overhead(class: MessageClass, addressing_len: usize) -> usize {
    let class_overhead = match class {
        MessageClass::Unreliable => 0,
        MessageClass::Reliable => 2,
        MessageClass::ReliableSequenced => 3,
        MessageClass::Ack => 4,
    };
    1 + addressing_len + class_overhead + if class == MessageClass::Ack { 0 } else { LEN_PREFIX_LEN }
}

/// Largest payload that can still be framed into one packet for the given
/// class and number of addressed peers (0 meaning all/master).
pub fn max_payload_len(
    max_packet_len: usize,
    reliability: Reliability,
    target_count: usize,
    mask_bytes: usize,
) -> usize {
    let addressing_len = match target_count {
        0 => 0,
        1 => 1,
        _ => mask_bytes,
    };
    max_packet_len - message_overhead(reliability.into(), addressing_len)
}
