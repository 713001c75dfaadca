//! Reliable messaging for hosts whose only transport primitive is a small,
//! per-peer synchronized byte blob: each peer owns one blob of at most a few
//! hundred bytes, may rewrite it once per update tick, and every rewrite is
//! broadcast to all other peers. Delivery of a given rewrite is not guaranteed,
//! and a rewrite overwrites whatever the previous tick carried.
//!
//! ## Design goals
//!
//! * Provide *message* semantics (defined-length chunks of data) on top of the
//!   blob primitive, with three delivery classes:
//!   * unreliable - fire and forget, no ordering, no retransmission
//!   * reliable - guaranteed eventual delivery, no cross-message ordering
//!   * reliable-sequenced - guaranteed delivery in assigned order within a
//!     send-group
//! * Addressing per message: all peers, the current master, a single peer, or an
//!   arbitrary set of peers - several differently-addressed messages share one
//!   packed blob, and every receiver walks the full packet, consuming what is
//!   addressed to it and skipping the rest byte-exactly
//! * Strictly bounded memory: all in-flight bookkeeping lives in fixed-capacity
//!   ring buffers. When a ring is full, sends fail fast instead of queueing
//! * Single-threaded cooperative operation: the host drives the protocol with
//!   one outbound preparation call per tick and inbound deserialization calls as
//!   blobs arrive; nothing blocks, nothing runs concurrently
//!
//! ## Packet layout
//!
//! A packet is the content of one blob: a sequence of self-describing messages,
//! packed until the byte budget is exhausted. All multi-byte integers are
//! big-endian except the multiple-target slot mask, which is little-endian byte
//! order (lowest slots in the first byte).
//!
//! ```ascii
//! 0:  header (u8):
//!     * bits 0-1: message class (0 unreliable, 1 reliable, 2 sequenced, 3 ack)
//!     * bits 2-3: target kind (0 all, 1 master, 2 single, 3 multiple)
//! 1:  addressing:
//!     * all/master: absent
//!     * single: target connection slot (u8)
//!     * multiple: slot mask, ceil(total_connections / 8) bytes
//! *:  reliable/sequenced only: message id (u16)
//! *:  sequenced only: intra-group sequence index (u8)
//! *:  unreliable/reliable/sequenced: payload length (u16), then payload
//! *:  ack only: start id (u16), ack mask (u16). Acks are always
//!     single-targeted; the addressing byte names the connection whose sends
//!     are being acknowledged.
//! ```
//!
//! Message ids live in a modulo-65536 space and are compared with half-range
//! wraparound semantics; acks are cumulative-selective (a start id plus a
//! bitmask of received offsets), flushed opportunistically at the front of the
//! next outgoing packet.

mod binding;
mod codec;
mod listener;
mod manager;
mod socket;
pub mod testkit;
mod wire;

pub use binding::{HostBinding, HostEvent, TickDriver};
pub use codec::{f32_to_half_bits, half_bits_to_f32, var_u32_len, WireRead, WireWrite};
pub use listener::NetworkListener;
pub use manager::{NetConfig, NetworkManager, PeerId};
pub use socket::{RELIABLE_RING_CAPACITY, UNRELIABLE_RING_CAPACITY};
pub use wire::{Reliability, MAX_PACKET_LEN};
