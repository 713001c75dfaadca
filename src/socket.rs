//! The per-connection reliability engine: outgoing ring buffers with
//! retransmission-until-acked, cumulative selective acknowledgement, receive
//! deduplication, and in-order replay of sequenced groups.
//!
//! All bookkeeping is fixed-capacity. The reliable classes share one ring of
//! [`RELIABLE_RING_CAPACITY`] in-flight messages, unreliable messages get a
//! ring of [`UNRELIABLE_RING_CAPACITY`], and the per-remote-slot receive state
//! (dedup window, ack accumulator, sequence reorder buffer) is sized by the
//! connection table. When a ring is full, sends fail; nothing ever grows.

use bytes::BufMut;
use tracing::{debug, error, trace, warn};

use crate::wire::{self, MessageClass, Reliability, Target, ACK_WIRE_LEN};

/// In-flight capacity shared by the reliable and reliable-sequenced classes.
/// This also bounds the receive dedup window and the sequence reorder buffer.
pub const RELIABLE_RING_CAPACITY: usize = 16;

/// In-flight capacity of the unreliable class; entries only live until the
/// next packing pass, so the ring can be deeper.
pub const UNRELIABLE_RING_CAPACITY: usize = 32;

/// Message ids wrap modulo this space.
const ID_SPACE: i32 = 65536;
const ID_SPACE_HALF: i32 = 32768;

/// Expected-ack mask sentinel for master-targeted messages: the master's slot
/// can change while the message is in flight, so the ack test is deferred to
/// receipt time. The local slot never appears in a connection mask, so no
/// legitimate target set can collide with this value.
const MASTER_ACK_SENTINEL: u64 = u64::MAX;

/// Compares two ids in the wrapping id space. Positive means `id` is newer
/// than `reference`; the tie at exactly half the space resolves to positive.
pub(crate) fn id_diff(id: u16, reference: u16) -> i32 {
    let id = id as i32 + if (id as i32) < ID_SPACE_HALF { ID_SPACE } else { 0 };
    let reference = reference as i32 + if (reference as i32) < ID_SPACE_HALF { ID_SPACE } else { 0 };
    id - reference
}

pub(crate) struct SocketConfig {
    pub max_packet_len: usize,
    pub total_connections: usize,
}

struct ReliableMessage {
    id: u16,
    sequence: Option<u8>,
    frame: Vec<u8>,
    /// Bit per connection slot that still has to ack, or
    /// [`MASTER_ACK_SENTINEL`]. Zero means complete.
    expected_acks: u64,
    failed: bool,
}

struct UnreliableMessage {
    id: u16,
    frame: Vec<u8>,
    cancelled: bool,
}

pub(crate) struct Socket {
    config: SocketConfig,
    mask_bytes: usize,
    /// All remote slots currently bound, maintained by the manager.
    connections_mask: u64,

    reliable: [Option<ReliableMessage>; RELIABLE_RING_CAPACITY],
    reliable_start_id: u16,
    reliable_start_index: usize,
    reliable_count: usize,
    /// Bit per buffered offset that still awaits acks.
    reliable_expect_mask: u32,
    /// Bit per buffered offset already placed in a packet this round; resets
    /// once it catches up with the expect mask.
    reliable_attempts_mask: u32,
    update_reliable: bool,

    /// Target set of the current sequenced send-group; 0 when no group is
    /// open. A differing target set or a full ring starts a new group.
    sequence_targets: u64,
    sequence_next: usize,

    unreliable: [Option<UnreliableMessage>; UNRELIABLE_RING_CAPACITY],
    unreliable_start_index: usize,
    unreliable_count: usize,
    unreliable_next_id: u16,

    // per remote slot: ack accumulator
    ack_start_ids: Vec<u16>,
    ack_masks: Vec<u32>,

    // per remote slot: receive dedup window
    recv_start_ids: Vec<Option<u16>>,
    recv_masks: Vec<u32>,

    // per remote slot: sequence reorder state
    seq_expected: Vec<usize>,
    seq_buffers: Vec<[Option<(u16, Vec<u8>)>; RELIABLE_RING_CAPACITY]>,
    /// Sequence offsets satisfied by messages this peer was not a target of.
    seq_skip_masks: Vec<u32>,

    packet: Vec<u8>,
    completions: Vec<(u16, bool)>,
}

impl Socket {
    pub fn new(config: SocketConfig) -> Socket {
        assert!(config.total_connections >= 2 && config.total_connections <= 64);
        assert!(config.max_packet_len >= ACK_WIRE_LEN && config.max_packet_len <= wire::MAX_PACKET_LEN);

        let n = config.total_connections;
        let mask_bytes = wire::mask_bytes(n);
        let max_packet_len = config.max_packet_len;
        Socket {
            config,
            mask_bytes,
            connections_mask: 0,
            reliable: std::array::from_fn(|_| None),
            reliable_start_id: 0,
            reliable_start_index: 0,
            reliable_count: 0,
            reliable_expect_mask: 0,
            reliable_attempts_mask: 0,
            update_reliable: false,
            sequence_targets: 0,
            sequence_next: 0,
            unreliable: std::array::from_fn(|_| None),
            unreliable_start_index: 0,
            unreliable_count: 0,
            unreliable_next_id: 0,
            ack_start_ids: vec![0; n],
            ack_masks: vec![0; n],
            recv_start_ids: vec![None; n],
            recv_masks: vec![0; n],
            seq_expected: vec![0; n],
            seq_buffers: (0..n).map(|_| std::array::from_fn(|_| None)).collect(),
            seq_skip_masks: vec![0; n],
            packet: Vec::with_capacity(max_packet_len),
            completions: Vec::new(),
        }
    }

    pub fn set_connections_mask(&mut self, mask: u64) {
        self.connections_mask = mask;
    }

    /// Send-complete notifications produced since the last drain, in
    /// completion order.
    pub fn drain_completions(&mut self) -> Vec<(u16, bool)> {
        std::mem::take(&mut self.completions)
    }

    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    // ------------------------------------------------------------------
    // send path
    // ------------------------------------------------------------------

    /// Buffers a message for sending. Returns the assigned message id, or
    /// `None` if the ring for this class is full or the framed message cannot
    /// fit a packet.
    pub fn send(&mut self, reliability: Reliability, target: Target, payload: &[u8]) -> Option<u16> {
        let class = MessageClass::from(reliability);
        let frame_len =
            wire::message_overhead(class, target.addressing_len(self.mask_bytes)) + payload.len();
        if frame_len > self.config.max_packet_len {
            error!(
                "framed message of {} bytes exceeds the packet budget of {}",
                frame_len, self.config.max_packet_len
            );
            return None;
        }

        let expected = match target {
            Target::All => self.connections_mask,
            Target::Master => MASTER_ACK_SENTINEL,
            Target::Single(slot) => 1u64 << slot,
            Target::Multiple(mask) => mask,
        };

        match reliability {
            Reliability::Unreliable => {
                if self.unreliable_count >= UNRELIABLE_RING_CAPACITY {
                    debug!("unreliable ring is full - rejecting send");
                    return None;
                }
                let id = self.unreliable_next_id;
                self.unreliable_next_id = self.unreliable_next_id.wrapping_add(1);
                let frame = build_frame(class, target, self.mask_bytes, None, None, payload);
                let index =
                    (self.unreliable_start_index + self.unreliable_count) % UNRELIABLE_RING_CAPACITY;
                self.unreliable[index] = Some(UnreliableMessage { id, frame, cancelled: false });
                self.unreliable_count += 1;
                trace!("buffered unreliable message {} ({} bytes)", id, payload.len());
                Some(id)
            }
            Reliability::Reliable | Reliability::ReliableSequenced => {
                if expected == 0 {
                    debug!("reliable send without any addressed peer - rejecting");
                    return None;
                }
                if self.update_reliable {
                    self.update_reliable_state();
                }
                if self.reliable_count >= RELIABLE_RING_CAPACITY {
                    debug!("reliable ring is full - rejecting send");
                    return None;
                }

                let id = self.reliable_start_id.wrapping_add(self.reliable_count as u16);
                let sequence = if reliability == Reliability::ReliableSequenced {
                    if self.sequence_targets == 0
                        || self.sequence_targets != expected
                        || self.sequence_next >= RELIABLE_RING_CAPACITY
                    {
                        self.sequence_targets = expected;
                        self.sequence_next = 0;
                    }
                    let seq = self.sequence_next as u8;
                    self.sequence_next += 1;
                    Some(seq)
                } else {
                    None
                };

                let frame = build_frame(class, target, self.mask_bytes, Some(id), sequence, payload);
                let index = (self.reliable_start_index + self.reliable_count) % RELIABLE_RING_CAPACITY;
                self.reliable[index] = Some(ReliableMessage {
                    id,
                    sequence,
                    frame,
                    expected_acks: expected,
                    failed: false,
                });
                self.reliable_expect_mask |= 1u32 << self.reliable_count;
                self.reliable_count += 1;
                trace!("buffered reliable message {} ({} bytes)", id, payload.len());
                Some(id)
            }
        }
    }

    /// Withdraws a message that has not completed yet; it finishes as failed.
    /// Cancelling an id that is not in flight is a caller error and a no-op.
    pub fn cancel_send(&mut self, message_id: u16) {
        for offset in 0..self.reliable_count {
            let index = (self.reliable_start_index + offset) % RELIABLE_RING_CAPACITY;
            if let Some(state) = self.reliable[index].as_mut() {
                if state.id == message_id && state.expected_acks != 0 {
                    debug!("cancelling reliable message {}", message_id);
                    state.expected_acks = 0;
                    state.failed = true;
                    self.update_reliable = true;
                    return;
                }
            }
        }
        for offset in 0..self.unreliable_count {
            let index = (self.unreliable_start_index + offset) % UNRELIABLE_RING_CAPACITY;
            if let Some(state) = self.unreliable[index].as_mut() {
                if state.id == message_id && !state.cancelled {
                    debug!("cancelling unreliable message {}", message_id);
                    state.cancelled = true;
                    return;
                }
            }
        }
        warn!("cancel requested for message {} which is not in flight", message_id);
    }

    /// Packs the next outgoing blob: pending acks first, then unreliable and
    /// reliable messages interleaved, under the byte budget. Invoked at most
    /// once per outgoing tick; the result stays valid until the next call.
    pub fn prepare_send_stream(&mut self) {
        if self.update_reliable {
            self.update_reliable_state();
        }
        self.packet.clear();
        let max_len = self.config.max_packet_len;

        for slot in 0..self.config.total_connections {
            let mask = self.ack_masks[slot];
            if mask == 0 {
                continue;
            }
            if self.packet.len() + ACK_WIRE_LEN > max_len {
                break;
            }
            self.packet
                .put_u8(wire::pack_header(MessageClass::Ack, wire::TargetKind::Single));
            self.packet.put_u8(slot as u8);
            self.packet.put_u16(self.ack_start_ids[slot]);
            self.packet.put_u16(mask as u16);
            self.ack_masks[slot] = 0;
        }

        let mut send_unreliable = false;
        let mut reliable_send_index = 0;
        let mut prev_sequence = -1i32;
        let mut send_sequenced = true;
        while self.unreliable_count > 0 || reliable_send_index < self.reliable_count {
            if send_unreliable && self.unreliable_count > 0 {
                // one packing attempt per unreliable message, placed or not
                let index = self.unreliable_start_index;
                if let Some(state) = self.unreliable[index].take() {
                    let placed =
                        !state.cancelled && Self::try_add(&mut self.packet, max_len, &state.frame);
                    self.completions.push((state.id, placed));
                }
                self.unreliable_start_index = (index + 1) % UNRELIABLE_RING_CAPACITY;
                self.unreliable_count -= 1;
            } else if reliable_send_index < self.reliable_count {
                let bit = 1u32 << reliable_send_index;
                if self.reliable_expect_mask & bit != 0 {
                    let index =
                        (self.reliable_start_index + reliable_send_index) % RELIABLE_RING_CAPACITY;
                    if let Some(state) = self.reliable[index].as_ref() {
                        let mut send_this = true;
                        if let Some(sequence) = state.sequence {
                            if send_sequenced {
                                // a sequence at or below the previous one means
                                // the next group started; only one group goes
                                // out per tick
                                if sequence as i32 > prev_sequence {
                                    prev_sequence = sequence as i32;
                                } else {
                                    send_sequenced = false;
                                }
                            }
                            send_this = send_sequenced;
                        }
                        if send_this && self.reliable_attempts_mask & bit == 0 {
                            Self::try_add(&mut self.packet, max_len, &state.frame);
                        }
                        self.reliable_attempts_mask |= bit;
                    }
                }
                reliable_send_index += 1;
            }
            send_unreliable = !send_unreliable;
        }
        if self.reliable_attempts_mask == self.reliable_expect_mask {
            self.reliable_attempts_mask = 0;
        }

        trace!("packed {} bytes", self.packet.len());
    }

    fn try_add(packet: &mut Vec<u8>, max_packet_len: usize, frame: &[u8]) -> bool {
        if packet.len() + frame.len() > max_packet_len {
            return false;
        }
        packet.extend_from_slice(frame);
        true
    }

    /// Re-derives the expect mask and compacts fully-acked messages off the
    /// ring head, emitting their completions in id order.
    fn update_reliable_state(&mut self) {
        self.update_reliable = false;

        let mut completed_head = 0;
        self.reliable_expect_mask = 0;
        let mut head_run = true;
        for offset in 0..self.reliable_count {
            let index = (self.reliable_start_index + offset) % RELIABLE_RING_CAPACITY;
            let complete = self.reliable[index]
                .as_ref()
                .map(|state| state.expected_acks == 0)
                .unwrap_or(true);
            if complete {
                if head_run {
                    completed_head += 1;
                }
            } else {
                head_run = false;
                self.reliable_expect_mask |= 1u32 << offset;
            }
        }
        self.reliable_attempts_mask &= self.reliable_expect_mask;

        if completed_head > 0 {
            for _ in 0..completed_head {
                if let Some(state) = self.reliable[self.reliable_start_index].take() {
                    trace!("message {} complete (failed: {})", state.id, state.failed);
                    self.completions.push((state.id, !state.failed));
                }
                self.reliable_start_index = (self.reliable_start_index + 1) % RELIABLE_RING_CAPACITY;
            }
            self.reliable_start_id = self.reliable_start_id.wrapping_add(completed_head as u16);
            self.reliable_count -= completed_head;
            self.reliable_attempts_mask >>= completed_head;
            self.reliable_expect_mask >>= completed_head;
        }
    }

    // ------------------------------------------------------------------
    // ack processing
    // ------------------------------------------------------------------

    /// Applies a selective ack received from `sender_slot`: a start id plus a
    /// bitmask of acked offsets. Applying the same ack twice has no effect
    /// beyond the first application.
    pub fn on_received_ack(&mut self, sender_slot: usize, start_id: u16, mask: u32, sender_is_master: bool) {
        // align the ack mask with the local ring start
        let diff = id_diff(start_id, self.reliable_start_id);
        let mut mask = if diff > 0 {
            if diff >= 32 { 0 } else { mask << diff }
        } else if diff < 0 {
            if -diff >= 32 { 0 } else { mask >> -diff }
        } else {
            mask
        };

        for offset in 0..self.reliable_count {
            if mask == 0 {
                break;
            }
            if mask & 1 != 0 {
                let index = (self.reliable_start_index + offset) % RELIABLE_RING_CAPACITY;
                if let Some(state) = self.reliable[index].as_mut() {
                    if state.expected_acks == MASTER_ACK_SENTINEL {
                        if sender_is_master {
                            state.expected_acks = 0;
                        }
                    } else {
                        state.expected_acks &= !(1u64 << sender_slot);
                    }
                }
            }
            mask >>= 1;
        }

        self.update_reliable = true;
    }

    // ------------------------------------------------------------------
    // connection lifecycle
    // ------------------------------------------------------------------

    /// A remote slot was released: nothing addressed to it can be acked any
    /// more, and all per-slot receive state is reset for the next occupant.
    pub fn on_connection_release(&mut self, slot: usize) {
        let clear = !(1u64 << slot);
        for state in self.reliable.iter_mut().flatten() {
            if state.expected_acks != MASTER_ACK_SENTINEL && state.expected_acks != 0 {
                state.expected_acks &= clear;
                if state.expected_acks == 0 {
                    // the departed peer was the last outstanding target
                    state.failed = true;
                }
            }
        }
        self.update_reliable = true;

        self.ack_start_ids[slot] = 0;
        self.ack_masks[slot] = 0;
        self.recv_start_ids[slot] = None;
        self.recv_masks[slot] = 0;
        self.seq_expected[slot] = 0;
        self.reset_sequence_group(slot);
    }

    /// The master peer left: in-flight master-targeted messages can never be
    /// acked by the peer they were meant for, so they complete as failed.
    pub fn on_master_leave(&mut self) {
        for state in self.reliable.iter_mut().flatten() {
            if state.expected_acks == MASTER_ACK_SENTINEL {
                state.expected_acks = 0;
                state.failed = true;
            }
        }
        self.update_reliable = true;
    }

    // ------------------------------------------------------------------
    // receive path
    // ------------------------------------------------------------------

    /// A reliable (unordered) message arrived; returns whether this is a new
    /// delivery rather than a retransmission.
    pub fn on_receive_reliable(&mut self, slot: usize, id: u16) -> bool {
        self.is_new_message(slot, id, true)
    }

    /// A reliable-sequenced message arrived. Returns the messages that became
    /// deliverable, in sequence order (empty if this was a duplicate or is
    /// buffered ahead of a gap).
    pub fn on_receive_sequenced(
        &mut self,
        slot: usize,
        id: u16,
        sequence: u8,
        payload: &[u8],
    ) -> Vec<(u16, Vec<u8>)> {
        let mut out = Vec::new();
        if !self.is_new_message(slot, id, true) {
            return out;
        }
        let seq = sequence as usize;
        if seq >= RELIABLE_RING_CAPACITY {
            warn!("sequenced message {} with out-of-range sequence {} - dropping", id, sequence);
            return out;
        }

        let mut expected = self.seq_expected[slot];
        if seq < expected {
            // a sequence below the expectation starts a new group
            self.reset_sequence_group(slot);
            expected = 0;
        }

        if seq == expected {
            out.push((id, payload.to_vec()));
            expected = self.drain_ready(slot, seq + 1, &mut out);
        } else {
            trace!("buffering sequenced message {} (sequence {}, expected {})", id, seq, expected);
            self.seq_buffers[slot][seq] = Some((id, payload.to_vec()));
        }
        self.seq_expected[slot] = expected;
        out
    }

    /// A sequenced message passed by that this peer is not a target of. The
    /// group's sequence still advances, so the offset is marked satisfied;
    /// no ack is accumulated because the sender does not expect one from us.
    /// Returns buffered messages that became deliverable by the advance.
    pub fn on_sequenced_elsewhere(&mut self, slot: usize, id: u16, sequence: u8) -> Vec<(u16, Vec<u8>)> {
        let mut out = Vec::new();
        if !self.is_new_message(slot, id, false) {
            return out;
        }
        let seq = sequence as usize;
        if seq >= RELIABLE_RING_CAPACITY {
            warn!("sequenced message {} with out-of-range sequence {} - dropping", id, sequence);
            return out;
        }

        let mut expected = self.seq_expected[slot];
        if seq < expected {
            self.reset_sequence_group(slot);
            expected = 0;
        }

        if seq == expected {
            expected = self.drain_ready(slot, seq + 1, &mut out);
        } else {
            self.seq_skip_masks[slot] |= 1u32 << seq;
        }
        self.seq_expected[slot] = expected;
        out
    }

    /// Walks the reorder buffer from `from`, collecting contiguous buffered
    /// messages and passing over skip-marked offsets. Returns the new
    /// expectation.
    fn drain_ready(&mut self, slot: usize, from: usize, out: &mut Vec<(u16, Vec<u8>)>) -> usize {
        let mut expected = from;
        while expected < RELIABLE_RING_CAPACITY {
            if self.seq_skip_masks[slot] & (1u32 << expected) != 0 {
                self.seq_skip_masks[slot] &= !(1u32 << expected);
                expected += 1;
                continue;
            }
            match self.seq_buffers[slot][expected].take() {
                Some(entry) => {
                    out.push(entry);
                    expected += 1;
                }
                None => break,
            }
        }
        expected
    }

    fn reset_sequence_group(&mut self, slot: usize) {
        self.seq_skip_masks[slot] = 0;
        for entry in self.seq_buffers[slot].iter_mut() {
            *entry = None;
        }
    }

    /// Two independent bookkeeping updates for an inbound reliable id:
    /// records the id in the slot's ack accumulator (unless `record_ack` is
    /// off), and tests/updates the sliding dedup window. Returns whether this
    /// is a genuinely new delivery.
    fn is_new_message(&mut self, slot: usize, id: u16, record_ack: bool) -> bool {
        if record_ack {
            self.record_ack(slot, id);
        }

        let start_id = self.recv_start_ids[slot].unwrap_or(id);
        let mut offset = id_diff(id, start_id);
        if offset <= -(RELIABLE_RING_CAPACITY as i32) {
            // older than anything the window still covers
            return false;
        }

        let mut mask = self.recv_masks[slot];
        let mut start_id = start_id;
        if offset < 0 {
            // id is older than the window start but still inside the span
            let shift = (-offset) as u32;
            mask = if shift >= 32 { 0 } else { mask << shift };
            start_id = id;
            offset = 0;
        } else if offset >= RELIABLE_RING_CAPACITY as i32 {
            // far ahead: the window slides forward; retransmissions older
            // than the new window may be misclassified as new
            let new_offset = RELIABLE_RING_CAPACITY as i32 - 1;
            let new_start = id.wrapping_sub(new_offset as u16);
            let shift = id_diff(new_start, start_id);
            mask = if shift < RELIABLE_RING_CAPACITY as i32 { mask >> shift } else { 0 };
            start_id = new_start;
            offset = new_offset;
        }

        let bit = 1u32 << offset as u32;
        if mask & bit == 0 {
            self.recv_masks[slot] = mask | bit;
            self.recv_start_ids[slot] = Some(start_id);
            true
        } else {
            trace!("duplicate delivery of message {} from slot {}", id, slot);
            false
        }
    }

    /// Records an id as seen so the next packing pass acks it.
    fn record_ack(&mut self, slot: usize, id: u16) {
        let mut mask = self.ack_masks[slot];
        let start = if mask == 0 {
            self.ack_start_ids[slot] = id;
            id
        } else {
            let mut start = self.ack_start_ids[slot];
            let behind = id_diff(start, id);
            if behind > 0 {
                // this id is older than the accumulator start
                mask = if behind >= 32 { 0 } else { mask << behind };
                start = id;
                self.ack_start_ids[slot] = id;
            }
            start
        };

        let offset = id_diff(id, start);
        if (0..32).contains(&offset) {
            self.ack_masks[slot] = mask | (1u32 << offset);
        } else {
            // accumulator window exhausted; restart at this id - earlier
            // unflushed acks are re-recorded when the peer retransmits
            trace!("ack accumulator for slot {} restarted at {}", slot, id);
            self.ack_start_ids[slot] = id;
            self.ack_masks[slot] = 1;
        }
    }
}

fn build_frame(
    class: MessageClass,
    target: Target,
    mask_bytes: usize,
    id: Option<u16>,
    sequence: Option<u8>,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame =
        Vec::with_capacity(wire::message_overhead(class, target.addressing_len(mask_bytes)) + payload.len());
    frame.put_u8(wire::pack_header(class, target.kind()));
    target.ser(&mut frame, mask_bytes);
    if let Some(id) = id {
        frame.put_u16(id);
    }
    if let Some(sequence) = sequence {
        frame.put_u8(sequence);
    }
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    frame
}
