//! Inbound half: rebuild fragmented messages from out-of-order, duplicated
//! fragments.
//!
//! Each reassembly is keyed by `(sender, APS sequence)` and occupies one pool
//! slot. Only fragments inside the current window are accepted; a window
//! slides once every fragment in it has arrived and a fragment from the next
//! window shows up. Completed messages stay in the pool as `Acked` so late
//! duplicates are re-acknowledged instead of delivered twice.
//!
//! # Slot lifecycle
//!
//! ```text
//! Available -> InUse -> Acked -----------> Available (evicted, oldest first)
//!                 |  \-> PayloadTooLarge -> Available (oversize response sent)
//!                 \----------------------> Available (timeout or abort)
//! ```

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::frame::{ApsFrame, NodeId, WindowAck, APS_OPTION_RETRY};
use super::mask::WindowMask;
use super::pool::{PoolSlot, SlotId, SlotPool};
use super::stats::FragmentationStats;
use super::transport::Transport;

/// State of an incoming reassembly slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// Free for a new message.
    Available,
    /// Collecting fragments.
    InUse,
    /// Delivered; kept to absorb duplicates.
    Acked,
    /// Collecting fragments of a message that does not fit the buffer.
    PayloadTooLarge,
}

/// Result of feeding one incoming frame to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum IncomingOutcome<'a> {
    /// Not a fragment; continue with the normal receive path.
    NotFragmented,
    /// Fragment consumed. Nothing to hand to the application yet.
    Consumed,
    /// The last missing fragment arrived. The frame's retry option has been
    /// cleared and this is the whole message.
    Reassembled(&'a [u8]),
}

#[derive(Debug)]
struct IncomingMessage {
    status: ReceiveStatus,
    source: NodeId,
    sequence: u8,
    /// Learned from fragment 0.
    fragments_expected: Option<u8>,
    fragments_received: usize,
    /// Captured when the reassembly starts.
    window_size: u8,
    window_base: usize,
    window_offset: usize,
    mask: WindowMask,
    /// Length shared by every non-final fragment of the current window.
    fragment_len: usize,
    /// Index of a stored fragment shorter than `fragment_len`.
    tail: Option<usize>,
    buffer: Box<[u8]>,
    /// End of the furthest fragment stored so far.
    length: usize,
    acked_age: u32,
    deadline: Option<Instant>,
}

enum Store {
    Accepted { new: bool, slid: bool },
    OutOfWindow,
    LengthMismatch,
    /// Fragments stored before fragment 0 do not fit the count it carries.
    CountMismatch,
}

impl IncomingMessage {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            status: ReceiveStatus::Available,
            source: NodeId::new(0),
            sequence: 0,
            fragments_expected: None,
            fragments_received: 0,
            window_size: 0,
            window_base: 0,
            window_offset: 0,
            mask: WindowMask::default(),
            fragment_len: 0,
            tail: None,
            buffer: vec![0; capacity].into_boxed_slice(),
            length: 0,
            acked_age: 0,
            deadline: None,
        }
    }

    fn start(&mut self, source: NodeId, sequence: u8, fragment_len: usize, window_size: u8, deadline: Instant) {
        self.status = ReceiveStatus::InUse;
        self.source = source;
        self.sequence = sequence;
        self.fragments_expected = None;
        self.fragments_received = 0;
        self.window_size = window_size;
        self.window_base = 0;
        self.window_offset = 0;
        self.mask = WindowMask::for_window(window_size, 0, None);
        self.fragment_len = fragment_len;
        self.tail = None;
        self.length = 0;
        self.deadline = Some(deadline);
    }

    fn release(&mut self) {
        self.status = ReceiveStatus::Available;
        self.deadline = None;
    }

    fn collecting(&self) -> bool {
        matches!(
            self.status,
            ReceiveStatus::InUse | ReceiveStatus::PayloadTooLarge
        )
    }

    fn is_last(&self, index: usize) -> bool {
        self.fragments_expected
            .is_some_and(|expected| index + 1 == expected as usize)
    }

    fn is_complete(&self) -> bool {
        self.fragments_expected
            .is_some_and(|expected| self.fragments_received == expected as usize)
    }

    fn payload(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    fn store(&mut self, index: usize, count: u8, data: &[u8]) -> Store {
        let window_size = self.window_size;
        let window = window_size as usize;
        let mut slid = false;

        // Every fragment of this window is in and the sender moved on
        if self.mask.is_complete()
            && index >= self.window_base + window
            && index < self.window_base + 2 * window
            && self
                .fragments_expected
                .is_some_and(|expected| index < expected as usize)
        {
            self.window_base += window;
            self.window_offset += window * self.fragment_len;
            self.mask = WindowMask::for_window(window_size, self.window_base, self.fragments_expected);
            self.tail = None;
            // The final fragment may be short, so it cannot set the length
            if !self.is_last(index) {
                self.fragment_len = data.len();
            }
            slid = true;
        }

        if index < self.window_base || index >= self.window_base + window {
            return Store::OutOfWindow;
        }
        if self
            .fragments_expected
            .is_some_and(|expected| index >= expected as usize)
        {
            return Store::OutOfWindow;
        }
        if index == 0 && self.fragments_expected.is_none() && !self.learn_count(count) {
            return Store::CountMismatch;
        }
        if !self.fit_length(index, data.len()) {
            return Store::LengthMismatch;
        }

        let offset = index - self.window_base;
        let new = self.mask.set(offset);
        if new {
            self.fragments_received += 1;
            let start = self.window_offset + offset * self.fragment_len;
            self.copy_in(start, data);
        }

        Store::Accepted { new, slid }
    }

    /// Adopt the fragment count carried by fragment 0.
    ///
    /// Everything stored so far is in the first window. Fails if any of it
    /// lies past the count, or a short fragment is not the last one.
    fn learn_count(&mut self, count: u8) -> bool {
        let count = count as usize;
        let window = self.window_size as usize;
        if count == 0 || (count..window).any(|offset| self.mask.is_set(offset)) {
            return false;
        }
        if self.tail.is_some_and(|tail| tail + 1 != count) {
            return false;
        }
        self.fragments_expected = Some(count as u8);
        if count < window {
            self.mask.narrow(self.window_size, 0, count as u8);
        }
        true
    }

    /// Check a fragment length against the window's fragment length.
    ///
    /// The first fragment of a reassembly may be the short final one. When a
    /// longer fragment with a lower index arrives, the stored one is moved to
    /// its real position and the longer length is adopted.
    fn fit_length(&mut self, index: usize, len: usize) -> bool {
        if len == self.fragment_len {
            return self.tail.map_or(true, |tail| index < tail);
        }

        if len < self.fragment_len {
            // Only the final fragment may be short
            return match (self.tail, self.fragments_expected) {
                (Some(tail), _) => tail == index,
                (None, Some(_)) if self.is_last(index) => {
                    self.tail = Some(index);
                    true
                }
                (None, Some(_)) => false,
                (None, None) => {
                    let stored_above = (index..self.window_size as usize)
                        .any(|offset| self.mask.is_set(offset));
                    if !stored_above {
                        self.tail = Some(index);
                    }
                    !stored_above
                }
            };
        }

        if self.window_base != 0 || self.tail.is_some() || self.fragments_received != 1 {
            return false;
        }
        let Some(stored) = (0..self.window_size as usize).find(|&offset| self.mask.is_set(offset))
        else {
            return false;
        };
        let stored_is_last = self
            .fragments_expected
            .map_or(true, |expected| stored + 1 == expected as usize);
        if stored <= index || !stored_is_last {
            return false;
        }

        let old_len = self.fragment_len;
        self.fragment_len = len;
        self.tail = Some(stored);
        if self.status == ReceiveStatus::InUse {
            let from = stored * old_len;
            let to = stored * len;
            if to + old_len > self.buffer.len() {
                self.overflow();
            } else {
                self.buffer.copy_within(from..from + old_len, to);
                self.length = to + old_len;
            }
        }
        true
    }

    fn copy_in(&mut self, start: usize, data: &[u8]) {
        let end = start + data.len();
        if end > self.buffer.len() {
            self.overflow();
        } else if self.status == ReceiveStatus::InUse {
            self.buffer[start..end].copy_from_slice(data);
            self.length = self.length.max(end);
        }
    }

    fn overflow(&mut self) {
        if self.status == ReceiveStatus::InUse {
            warn!(
                "Message seq {} from {} exceeds {} byte buffer",
                self.sequence,
                self.source,
                self.buffer.len()
            );
        }
        self.status = ReceiveStatus::PayloadTooLarge;
    }
}

impl PoolSlot for IncomingMessage {
    fn is_free(&self) -> bool {
        self.status == ReceiveStatus::Available
    }
}

enum Completion {
    Pending,
    Deliver(usize),
    Oversize,
}

/// Owned form of [`IncomingOutcome`], pointing at the slot instead of
/// borrowing its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Received {
    NotFragmented,
    Consumed,
    Complete(SlotId),
}

/// Inbound reassembly over a fixed pool of slots.
#[derive(Debug)]
pub struct Reassembler {
    pool: SlotPool<IncomingMessage>,
    window_size: u8,
    max_transmit_retries: u8,
    next_acked_age: u32,
    stats: FragmentationStats,
}

impl Reassembler {
    /// Create a reassembler with `slots` concurrent messages of up to
    /// `buffer_capacity` bytes each.
    pub fn new(slots: usize, buffer_capacity: usize, window_size: u8, max_transmit_retries: u8) -> Self {
        Self {
            pool: SlotPool::new(slots, || IncomingMessage::with_capacity(buffer_capacity)),
            window_size,
            max_transmit_retries,
            next_acked_age: 0,
            stats: FragmentationStats::default(),
        }
    }

    /// Window size expected from senders.
    pub fn set_window_size(&mut self, window_size: u8) {
        self.window_size = window_size;
    }

    /// Feed one incoming frame from `sender`.
    ///
    /// `frame` is updated in place: on [`IncomingOutcome::Reassembled`] the
    /// retry option is cleared so the caller does not treat the delivery as
    /// a retransmission.
    pub fn on_fragment<T: Transport>(
        &mut self,
        transport: &mut T,
        frame: &mut ApsFrame,
        sender: NodeId,
        data: &[u8],
    ) -> IncomingOutcome<'_> {
        match self.receive(transport, frame, sender, data) {
            Received::NotFragmented => IncomingOutcome::NotFragmented,
            Received::Consumed => IncomingOutcome::Consumed,
            Received::Complete(id) => self
                .payload(id)
                .map_or(IncomingOutcome::Consumed, IncomingOutcome::Reassembled),
        }
    }

    /// Reassembled message held by an acked slot.
    pub fn payload(&self, id: SlotId) -> Option<&[u8]> {
        self.pool
            .get(id)
            .filter(|m| m.status == ReceiveStatus::Acked)
            .map(IncomingMessage::payload)
    }

    pub(crate) fn receive<T: Transport>(
        &mut self,
        transport: &mut T,
        frame: &mut ApsFrame,
        sender: NodeId,
        data: &[u8],
    ) -> Received {
        if !frame.is_fragmented() {
            return Received::NotFragmented;
        }

        let index = frame.fragment_index() as usize;
        let now = transport.now();
        let timeout = self.reception_timeout(transport, sender);

        let id = match self.find_reception(sender, frame.sequence) {
            Some(id) => id,
            None => {
                if index >= self.window_size as usize {
                    debug!(
                        "Dropping fragment {} of unknown seq {} from {}",
                        index, frame.sequence, sender
                    );
                    self.stats.out_of_window += 1;
                    return Received::Consumed;
                }
                let Some(id) = self.allocate() else {
                    warn!(
                        "No free reassembly slot for seq {} from {}",
                        frame.sequence, sender
                    );
                    self.stats.slots_exhausted += 1;
                    return Received::Consumed;
                };
                if let Some(slot) = self.pool.get_mut(id) {
                    slot.start(sender, frame.sequence, data.len(), self.window_size, now + timeout);
                }
                debug!("Started reassembly of seq {} from {}", frame.sequence, sender);
                id
            }
        };

        let Some(slot) = self.pool.get_mut(id) else {
            return Received::Consumed;
        };

        if slot.status == ReceiveStatus::Acked {
            // Late duplicate of a delivered message
            if slot
                .fragments_expected
                .is_some_and(|expected| index < expected as usize)
            {
                self.stats.duplicate_fragments += 1;
                acknowledge(transport, sender, frame, slot);
            } else {
                self.stats.out_of_window += 1;
            }
            return Received::Consumed;
        }

        match slot.store(index, frame.fragment_count(), data) {
            Store::OutOfWindow => {
                debug!(
                    "Fragment {} of seq {} from {} outside window at {}",
                    index, frame.sequence, sender, slot.window_base
                );
                self.stats.out_of_window += 1;
                return Received::Consumed;
            }
            Store::LengthMismatch => {
                warn!(
                    "Fragment {} of seq {} from {} has length {} (expected {}), aborting",
                    index,
                    frame.sequence,
                    sender,
                    data.len(),
                    slot.fragment_len
                );
                slot.release();
                self.stats.reception_aborts += 1;
                return Received::Consumed;
            }
            Store::CountMismatch => {
                warn!(
                    "Fragment 0 of seq {} from {} claims {} fragments, aborting",
                    frame.sequence,
                    sender,
                    frame.fragment_count()
                );
                slot.release();
                self.stats.reception_aborts += 1;
                return Received::Consumed;
            }
            Store::Accepted { new, slid } => {
                if new {
                    self.stats.fragments_received += 1;
                } else {
                    self.stats.duplicate_fragments += 1;
                }
                if slid {
                    debug!(
                        "Window of seq {} from {} moved to {}",
                        frame.sequence, sender, slot.window_base
                    );
                    if slot.collecting() {
                        slot.deadline = Some(now + timeout);
                    }
                }
            }
        }

        if slot.is_last(index) || slot.mask.is_complete() {
            acknowledge(transport, sender, frame, slot);
        }

        let status = slot.status;
        let completion = match status {
            _ if !slot.is_complete() => Completion::Pending,
            ReceiveStatus::InUse => {
                slot.status = ReceiveStatus::Acked;
                slot.acked_age = self.next_acked_age;
                slot.deadline = None;
                self.next_acked_age = self.next_acked_age.wrapping_add(1);
                Completion::Deliver(slot.length)
            }
            ReceiveStatus::PayloadTooLarge => {
                slot.release();
                Completion::Oversize
            }
            _ => Completion::Pending,
        };

        match completion {
            Completion::Pending => Received::Consumed,
            Completion::Oversize => {
                warn!(
                    "Seq {} from {} too large, sending insufficient space response",
                    frame.sequence, sender
                );
                transport.send_oversize_response(sender, frame);
                self.stats.oversize_responses += 1;
                Received::Consumed
            }
            Completion::Deliver(length) => {
                info!(
                    "Reassembled {} bytes from {} (seq {})",
                    length, sender, frame.sequence
                );
                frame.options &= !APS_OPTION_RETRY;
                self.stats.messages_reassembled += 1;
                Received::Complete(id)
            }
        }
    }

    /// Slot holding the reassembly of `sequence` from `sender`, in any
    /// non-available state.
    pub fn find_reception(&self, sender: NodeId, sequence: u8) -> Option<SlotId> {
        self.pool.find(|m| {
            m.status != ReceiveStatus::Available && m.source == sender && m.sequence == sequence
        })
    }

    /// Status of a slot.
    pub fn status(&self, id: SlotId) -> Option<ReceiveStatus> {
        self.pool.get(id).map(|m| m.status)
    }

    /// Abandon a reassembly, discarding any partial data.
    pub fn abort_reception(&mut self, id: SlotId) {
        let Some(slot) = self.pool.get_mut(id) else {
            return;
        };
        if slot.status == ReceiveStatus::Available {
            return;
        }
        debug!("Aborting reassembly of seq {} from {}", slot.sequence, slot.source);
        slot.release();
        self.stats.reception_aborts += 1;
    }

    /// Abandon every reassembly whose retransmission deadline has passed.
    ///
    /// Returns the number of slots freed.
    pub fn poll_timeouts(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for slot in self.pool.iter_mut() {
            if slot.collecting() && slot.deadline.is_some_and(|deadline| deadline <= now) {
                warn!(
                    "Reassembly of seq {} from {} timed out ({}/{} fragments)",
                    slot.sequence,
                    slot.source,
                    slot.fragments_received,
                    slot.fragments_expected
                        .map_or_else(|| "?".to_string(), |e| e.to_string())
                );
                slot.release();
                expired += 1;
            }
        }
        self.stats.reception_timeouts += expired as u32;
        expired
    }

    /// Whether any reassembly is still collecting fragments.
    pub fn is_active(&self) -> bool {
        self.pool.iter().any(|(_, m)| m.collecting())
    }

    /// Earliest pending retransmission deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pool
            .iter()
            .filter(|(_, m)| m.collecting())
            .filter_map(|(_, m)| m.deadline)
            .min()
    }

    /// Free every slot.
    pub fn clear(&mut self) {
        self.pool.iter_mut().for_each(IncomingMessage::release);
        self.next_acked_age = 0;
        self.stats = FragmentationStats::default();
    }

    /// Counters for inbound activity.
    pub fn stats(&self) -> &FragmentationStats {
        &self.stats
    }

    /// A free slot, or else the least recently acked one.
    fn allocate(&self) -> Option<SlotId> {
        self.pool.allocate().or_else(|| {
            self.pool
                .iter()
                .filter(|(_, m)| m.status == ReceiveStatus::Acked)
                .max_by_key(|(_, m)| self.next_acked_age.wrapping_sub(m.acked_age))
                .map(|(id, _)| id)
        })
    }

    fn reception_timeout<T: Transport>(&self, transport: &T, sender: NodeId) -> Duration {
        let per_hop = transport.retry_timeout_ms(sender) as u64;
        Duration::from_millis(per_hop * self.max_transmit_retries as u64)
    }
}

/// Report the current window of `slot` to its sender.
fn acknowledge<T: Transport>(
    transport: &mut T,
    sender: NodeId,
    frame: &ApsFrame,
    slot: &IncomingMessage,
) {
    let ack = WindowAck {
        window_base: slot.window_base as u8,
        mask: slot.mask.bits(),
    };
    let mut reply = *frame;
    reply.group_id = ack.to_group_id();
    transport.send_window_ack(sender, &reply, ack);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragmentation::frame::APS_OPTION_FRAGMENTED;
    use crate::fragmentation::mock::MockTransport;

    const SENDER: NodeId = NodeId::new(0x2001);
    const SENDER_2: NodeId = NodeId::new(0x2002);

    fn message(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    /// Frame and data of fragment `index` of `data` cut into `mtu` pieces.
    fn fragment(data: &[u8], mtu: usize, sequence: u8, index: usize) -> (ApsFrame, Vec<u8>) {
        let count = data.len().div_ceil(mtu);
        let mut frame = ApsFrame::new(0x0104, 0xFC00, 1, 1);
        frame.options = APS_OPTION_FRAGMENTED | APS_OPTION_RETRY;
        frame.sequence = sequence;
        frame.set_fragment_info(index as u8, count as u8);
        let end = ((index + 1) * mtu).min(data.len());
        (frame, data[index * mtu..end].to_vec())
    }

    fn feed(
        reassembler: &mut Reassembler,
        transport: &mut MockTransport,
        sender: NodeId,
        data: &[u8],
        mtu: usize,
        sequence: u8,
        index: usize,
    ) -> Option<Vec<u8>> {
        let (mut frame, bytes) = fragment(data, mtu, sequence, index);
        match reassembler.on_fragment(transport, &mut frame, sender, &bytes) {
            IncomingOutcome::Reassembled(payload) => {
                assert!(!frame.is_retry());
                Some(payload.to_vec())
            }
            IncomingOutcome::Consumed => None,
            IncomingOutcome::NotFragmented => panic!("fragment not recognised"),
        }
    }

    #[test]
    fn test_unfragmented_frame_bypasses() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(2, 1500, 4, 3);
        let mut frame = ApsFrame::default();
        assert_eq!(
            reassembler.on_fragment(&mut transport, &mut frame, SENDER, &[1, 2, 3]),
            IncomingOutcome::NotFragmented
        );
        assert!(!reassembler.is_active());
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(2, 1500, 4, 3);
        let data = message(35);

        for index in [2, 0, 1] {
            assert_eq!(
                feed(&mut reassembler, &mut transport, SENDER, &data, 10, 9, index),
                None
            );
        }
        assert!(transport.acks.is_empty());

        let result = feed(&mut reassembler, &mut transport, SENDER, &data, 10, 9, 3);
        assert_eq!(result, Some(data));
        assert_eq!(transport.acks.len(), 1);
        let (sender, reply, ack) = transport.acks[0];
        assert_eq!(sender, SENDER);
        assert_eq!(ack, WindowAck { window_base: 0, mask: 0xFF });
        assert_eq!(reply.group_id, 0xFF00);
        assert_eq!(reassembler.stats().messages_reassembled, 1);
        assert!(!reassembler.is_active());
    }

    #[test]
    fn test_duplicates_after_completion_are_reacked_not_redelivered() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(2, 1500, 2, 3);
        let data = message(20);

        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 3, 0), None);
        assert_eq!(
            feed(&mut reassembler, &mut transport, SENDER, &data, 10, 3, 1),
            Some(data.clone())
        );
        let acks = transport.acks.len();

        for index in [1, 0, 1] {
            assert_eq!(
                feed(&mut reassembler, &mut transport, SENDER, &data, 10, 3, index),
                None
            );
        }
        assert_eq!(transport.acks.len(), acks + 3);
        assert_eq!(reassembler.stats().messages_reassembled, 1);
        assert_eq!(reassembler.stats().duplicate_fragments, 3);
        let id = reassembler.find_reception(SENDER, 3).unwrap();
        assert_eq!(reassembler.status(id), Some(ReceiveStatus::Acked));
    }

    #[test]
    fn test_window_slides_after_complete_window() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 1500, 2, 3);
        let data = message(45);

        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 1), None);
        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 0), None);
        assert_eq!(transport.acks.last().unwrap().2, WindowAck { window_base: 0, mask: 0xFF });

        // Second window, reversed
        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 3), None);
        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 2), None);
        assert_eq!(transport.acks.last().unwrap().2, WindowAck { window_base: 2, mask: 0xFF });

        // Final, short fragment alone in the last window
        let result = feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 4);
        assert_eq!(result, Some(data));
        assert_eq!(transport.acks.last().unwrap().2, WindowAck { window_base: 4, mask: 0xFF });
    }

    #[test]
    fn test_out_of_window_fragment_dropped_without_reply() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 1500, 2, 3);
        let data = message(60);

        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 0);
        let acks = transport.acks.len();

        // Window [0, 2) incomplete: fragment 2 is ahead of it
        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 2), None);
        assert_eq!(transport.acks.len(), acks);
        assert_eq!(reassembler.stats().out_of_window, 1);

        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 1);
        let acks = transport.acks.len();

        // Window complete, but fragment 4 skips a whole window
        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 4), None);
        assert_eq!(transport.acks.len(), acks);

        // The window did not move: fragments 2 and 3 still complete it
        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 2);
        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 3);
        assert_eq!(transport.acks.last().unwrap().2, WindowAck { window_base: 2, mask: 0xFF });

        // Stale fragment from the previous window
        let acks = transport.acks.len();
        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 0), None);
        assert_eq!(transport.acks.len(), acks);
    }

    #[test]
    fn test_unknown_message_must_start_in_first_window() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 1500, 2, 3);
        let data = message(50);

        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 2), None);
        assert!(reassembler.find_reception(SENDER, 1).is_none());
        assert!(!reassembler.is_active());
    }

    #[test]
    fn test_length_mismatch_aborts() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 1500, 4, 3);
        let data = message(40);

        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 0);
        let (mut frame, _) = fragment(&data, 10, 1, 1);
        let outcome = reassembler.on_fragment(&mut transport, &mut frame, SENDER, &[0; 7]);
        assert_eq!(outcome, IncomingOutcome::Consumed);
        assert!(reassembler.find_reception(SENDER, 1).is_none());
        assert_eq!(reassembler.stats().reception_aborts, 1);
        assert!(transport.acks.is_empty());
        assert!(transport.oversize.is_empty());
    }

    #[test]
    fn test_short_final_fragment_before_first() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 1500, 4, 3);
        let data = message(15);

        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 5, 1), None);
        let result = feed(&mut reassembler, &mut transport, SENDER, &data, 10, 5, 0);
        assert_eq!(result, Some(data));
        assert_eq!(reassembler.stats().reception_aborts, 0);
    }

    #[test]
    fn test_short_final_fragment_first_in_any_order() {
        let data = message(25);
        for order in [[2, 1, 0], [2, 0, 1], [1, 2, 0], [0, 2, 1]] {
            let mut transport = MockTransport::new(10);
            let mut reassembler = Reassembler::new(1, 1500, 4, 3);
            let mut delivered = None;
            for index in order {
                let result = feed(&mut reassembler, &mut transport, SENDER, &data, 10, 6, index);
                if result.is_some() {
                    delivered = result;
                }
            }
            assert_eq!(delivered.as_ref(), Some(&data), "order {:?}", order);
        }
    }

    #[test]
    fn test_short_fragment_below_stored_aborts() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 1500, 4, 3);
        let data = message(40);

        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 3), None);
        let (mut frame, _) = fragment(&data, 10, 1, 2);
        let outcome = reassembler.on_fragment(&mut transport, &mut frame, SENDER, &[0; 4]);
        assert_eq!(outcome, IncomingOutcome::Consumed);
        assert!(reassembler.find_reception(SENDER, 1).is_none());
        assert_eq!(reassembler.stats().reception_aborts, 1);
    }

    #[test]
    fn test_fragment_beyond_count_aborts() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 1500, 4, 3);

        // Leave a delivered message behind in the only slot
        let old = vec![0xAA; 40];
        for index in 0..4 {
            feed(&mut reassembler, &mut transport, SENDER, &old, 10, 1, index);
        }

        // Fragment 3 arrives, then fragment 0 says there are only two
        let long = message(40);
        let short = message(20);
        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &long, 10, 2, 3), None);
        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &short, 10, 2, 0), None);
        assert!(reassembler.find_reception(SENDER, 2).is_none());
        assert_eq!(reassembler.stats().reception_aborts, 1);
        assert_eq!(reassembler.stats().messages_reassembled, 1);

        // The second fragment alone no longer completes anything
        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &short, 10, 2, 1), None);
    }

    #[test]
    fn test_window_change_does_not_affect_reassembly_in_progress() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 1500, 2, 3);
        let data = message(40);

        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 0);
        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 1);
        reassembler.set_window_size(4);
        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 2), None);
        let result = feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 3);
        assert_eq!(result, Some(data));
        assert_eq!(reassembler.stats().out_of_window, 0);
    }

    #[test]
    fn test_late_duplicate_from_earlier_window_is_reacked() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 1500, 2, 3);
        let data = message(40);

        for index in 0..4 {
            feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, index);
        }
        let acks = transport.acks.len();

        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 0), None);
        assert_eq!(transport.acks.len(), acks + 1);
        assert_eq!(
            transport.acks.last().unwrap().2,
            WindowAck { window_base: 2, mask: 0xFF }
        );
        assert_eq!(reassembler.stats().messages_reassembled, 1);
        assert_eq!(reassembler.stats().duplicate_fragments, 1);
    }

    #[test]
    fn test_count_smaller_than_window_narrows_mask() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 1500, 8, 3);
        let data = message(15);

        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 0), None);
        let result = feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 1);
        assert_eq!(result, Some(data));
        assert_eq!(transport.acks.last().unwrap().2, WindowAck { window_base: 0, mask: 0xFF });
    }

    #[test]
    fn test_payload_too_large_sends_oversize_response() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 25, 4, 3);
        let data = message(40);

        for index in [0, 1, 2] {
            assert_eq!(
                feed(&mut reassembler, &mut transport, SENDER, &data, 10, 5, index),
                None
            );
        }
        let id = reassembler.find_reception(SENDER, 5).unwrap();
        assert_eq!(reassembler.status(id), Some(ReceiveStatus::PayloadTooLarge));

        // Handshake still completes
        assert_eq!(feed(&mut reassembler, &mut transport, SENDER, &data, 10, 5, 3), None);
        assert_eq!(transport.acks.len(), 1);
        assert_eq!(transport.oversize.len(), 1);
        assert_eq!(transport.oversize[0].0, SENDER);
        assert_eq!(reassembler.status(id), Some(ReceiveStatus::Available));
        assert_eq!(reassembler.stats().messages_reassembled, 0);
    }

    #[test]
    fn test_slot_exhaustion_drops_new_sender() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 1500, 2, 3);
        let data = message(30);

        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 0);
        assert_eq!(feed(&mut reassembler, &mut transport, SENDER_2, &data, 10, 1, 0), None);
        assert!(reassembler.find_reception(SENDER_2, 1).is_none());
        assert_eq!(reassembler.stats().slots_exhausted, 1);

        // Timeout frees the slot for the new sender
        transport.advance(Duration::from_millis(300));
        assert_eq!(reassembler.poll_timeouts(transport.now()), 1);
        feed(&mut reassembler, &mut transport, SENDER_2, &data, 10, 1, 0);
        assert!(reassembler.find_reception(SENDER_2, 1).is_some());
    }

    #[test]
    fn test_acked_slot_evicted_oldest_first() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(2, 1500, 1, 3);
        let data = message(5);

        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 0);
        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 2, 0);
        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 3, 0);

        assert!(reassembler.find_reception(SENDER, 1).is_none());
        assert!(reassembler.find_reception(SENDER, 2).is_some());
        assert!(reassembler.find_reception(SENDER, 3).is_some());
    }

    #[test]
    fn test_timeout_rearmed_on_window_slide() {
        let mut transport = MockTransport::new(10);
        transport.retry_timeout_ms = 100;
        let mut reassembler = Reassembler::new(1, 1500, 1, 3);
        let data = message(30);

        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 0);
        transport.advance(Duration::from_millis(250));
        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 1);

        // 300 ms after the start, only 50 ms after the slide
        transport.advance(Duration::from_millis(50));
        assert_eq!(reassembler.poll_timeouts(transport.now()), 0);

        transport.advance(Duration::from_millis(250));
        assert_eq!(reassembler.poll_timeouts(transport.now()), 1);
        assert_eq!(reassembler.stats().reception_timeouts, 1);
        assert!(reassembler.find_reception(SENDER, 1).is_none());
    }

    #[test]
    fn test_abort_reception() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(1, 1500, 2, 3);
        let data = message(30);

        feed(&mut reassembler, &mut transport, SENDER, &data, 10, 1, 0);
        let id = reassembler.find_reception(SENDER, 1).unwrap();
        reassembler.abort_reception(id);
        assert_eq!(reassembler.status(id), Some(ReceiveStatus::Available));
        assert!(reassembler.next_deadline().is_none());

        // Aborting a free slot is a no-op
        reassembler.abort_reception(id);
        assert_eq!(reassembler.stats().reception_aborts, 1);
    }

    #[test]
    fn test_concurrent_senders_same_sequence() {
        let mut transport = MockTransport::new(10);
        let mut reassembler = Reassembler::new(2, 1500, 2, 3);
        let first = message(20);
        let second: Vec<u8> = message(20).iter().map(|b| b ^ 0xFF).collect();

        feed(&mut reassembler, &mut transport, SENDER, &first, 10, 7, 0);
        feed(&mut reassembler, &mut transport, SENDER_2, &second, 10, 7, 1);
        assert_eq!(
            feed(&mut reassembler, &mut transport, SENDER_2, &second, 10, 7, 0),
            Some(second)
        );
        assert_eq!(
            feed(&mut reassembler, &mut transport, SENDER, &first, 10, 7, 1),
            Some(first)
        );
    }
}
