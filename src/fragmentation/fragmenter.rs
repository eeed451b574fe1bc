//! Outbound half: split a message into fragments and send them a window at a
//! time.
//!
//! # Protocol
//!
//! 1. The payload is copied into a pool slot and cut into `ceil(len / mtu)`
//!    fragments, where `mtu` is the transport's fragment payload limit for the
//!    destination.
//! 2. Fragments `[base, base + window)` are handed to the transport in index
//!    order.
//! 3. Each transport acknowledgement decrements the in-flight count. When it
//!    reaches zero the window slides by the window size and the next window
//!    is sent.
//! 4. The message completes when a window slide passes the last fragment.
//!    Any transport failure aborts the whole message.
//!
//! The application hears about the outcome once, through
//! [`Transport::message_sent`].

use log::{debug, info, warn};

use super::error::{FragmentError, TransportError};
use super::frame::{ApsFrame, Destination, MessageTag, APS_OPTION_FRAGMENTED, APS_OPTION_RETRY};
use super::pool::{PoolSlot, SlotId, SlotPool};
use super::stats::FragmentationStats;
use super::transport::{MessageSent, Transport};

/// Whether a transport completion belonged to a fragmented message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a NotFragmented completion still needs the normal sent handling"]
pub enum SentDisposition {
    /// The completion was consumed by fragmentation.
    Handled,
    /// Not a fragment; continue with the normal completion path.
    NotFragmented,
}

/// State of one outgoing fragmented message.
#[derive(Debug)]
struct OutgoingMessage {
    active: bool,
    destination: Destination,
    frame: ApsFrame,
    /// Whole payload. Capacity is reserved once when the pool is built.
    buffer: Vec<u8>,
    fragment_len: usize,
    fragment_count: u8,
    /// Window size captured at admission so a runtime change cannot stall
    /// a message already in flight.
    window_size: u8,
    window_base: usize,
    in_flight: u8,
}

impl OutgoingMessage {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            active: false,
            destination: Destination::Binding(0),
            frame: ApsFrame::default(),
            buffer: Vec::with_capacity(capacity),
            fragment_len: 0,
            fragment_count: 0,
            window_size: 0,
            window_base: 0,
            in_flight: 0,
        }
    }

    fn tag(&self) -> MessageTag {
        MessageTag::new(self.frame.sequence)
    }

    /// The window just sent contains the final fragment.
    fn last_window_sent(&self) -> bool {
        self.window_base + self.window_size as usize >= self.fragment_count as usize
    }

    fn release(&mut self) {
        self.active = false;
        self.buffer.clear();
        self.in_flight = 0;
    }

    /// Send every fragment of the current window.
    fn send_window<T: Transport>(
        &mut self,
        transport: &mut T,
        stats: &mut FragmentationStats,
    ) -> Result<WindowProgress, TransportError> {
        let count = self.fragment_count as usize;
        let end = (self.window_base + self.window_size as usize).min(count);

        for index in self.window_base..end {
            let start = index * self.fragment_len;
            let stop = (start + self.fragment_len).min(self.buffer.len());
            self.frame.set_fragment_info(index as u8, self.fragment_count);
            transport.send_fragment(self.destination, &self.frame, &self.buffer[start..stop])?;
            self.in_flight += 1;
            stats.fragments_sent += 1;
            debug!(
                "Fragment {}/{} of seq {} to {}: {} bytes",
                index + 1,
                count,
                self.frame.sequence,
                self.destination,
                stop - start
            );
        }

        if self.in_flight == 0 {
            Ok(WindowProgress::Finished)
        } else {
            Ok(WindowProgress::InFlight)
        }
    }
}

impl PoolSlot for OutgoingMessage {
    fn is_free(&self) -> bool {
        !self.active
    }
}

/// A message whose last fragment is in flight but whose buffer is already
/// back in the pool.
#[derive(Debug, Clone, Copy)]
struct RetainedMessage {
    destination: Destination,
    frame: ApsFrame,
    in_flight: u8,
}

enum WindowProgress {
    InFlight,
    Finished,
}

/// Outbound fragmentation over a fixed pool of message slots.
#[derive(Debug)]
pub struct Fragmenter {
    pool: SlotPool<OutgoingMessage>,
    retained: Option<RetainedMessage>,
    window_size: u8,
    buffer_capacity: usize,
    release_buffer_early: bool,
    stats: FragmentationStats,
}

impl Fragmenter {
    /// Create a fragmenter with `slots` concurrent messages of up to
    /// `buffer_capacity` bytes each.
    pub fn new(
        slots: usize,
        buffer_capacity: usize,
        window_size: u8,
        release_buffer_early: bool,
    ) -> Self {
        Self {
            pool: SlotPool::new(slots, || OutgoingMessage::with_capacity(buffer_capacity)),
            retained: None,
            window_size,
            buffer_capacity,
            release_buffer_early,
            stats: FragmentationStats::default(),
        }
    }

    /// Window size used for messages admitted from now on.
    pub fn set_window_size(&mut self, window_size: u8) {
        self.window_size = window_size;
    }

    pub fn window_size(&self) -> u8 {
        self.window_size
    }

    /// Start sending `payload` to `destination`.
    ///
    /// Once the message is admitted, sets the fragmented and retry options
    /// and the sequence number on `frame`, and sends the first window before
    /// returning. A rejected send leaves `frame` untouched.
    ///
    /// # Errors
    ///
    /// - [`FragmentError::InvalidCall`] if the window size is zero
    /// - [`FragmentError::MessageTooLong`] if the payload exceeds the buffer
    ///   capacity or needs more than 255 fragments
    /// - [`FragmentError::ResourceExhausted`] if every slot is busy
    /// - [`FragmentError::Transport`] if the transport refused a fragment of
    ///   the first window; the message is abandoned
    pub fn send<T: Transport>(
        &mut self,
        transport: &mut T,
        destination: Destination,
        frame: &mut ApsFrame,
        payload: &[u8],
    ) -> Result<MessageTag, FragmentError> {
        if self.window_size == 0 {
            return Err(FragmentError::InvalidCall);
        }
        if payload.len() > self.buffer_capacity {
            return Err(FragmentError::MessageTooLong {
                len: payload.len(),
                max: self.buffer_capacity,
            });
        }

        // The caller's header is left alone until the message is admitted
        let mut header = *frame;
        header.options |= APS_OPTION_FRAGMENTED | APS_OPTION_RETRY;
        let fragment_len = transport.max_fragment_payload(destination, &header);
        let max_len = fragment_len
            .saturating_mul(u8::MAX as usize)
            .min(self.buffer_capacity);
        if fragment_len == 0 || payload.len() > max_len {
            return Err(FragmentError::MessageTooLong {
                len: payload.len(),
                max: max_len,
            });
        }
        let fragment_count = payload.len().div_ceil(fragment_len) as u8;

        let Some(id) = self.pool.allocate() else {
            warn!("No free slot for fragmented message to {}", destination);
            return Err(FragmentError::ResourceExhausted);
        };

        header.sequence = transport.next_sequence();
        *frame = header;
        let tag = MessageTag::new(frame.sequence);

        let Some(message) = self.pool.get_mut(id) else {
            return Err(FragmentError::ResourceExhausted);
        };
        message.active = true;
        message.destination = destination;
        message.frame = *frame;
        message.buffer.clear();
        message.buffer.extend_from_slice(payload);
        message.fragment_len = fragment_len;
        message.fragment_count = fragment_count;
        message.window_size = self.window_size;
        message.window_base = 0;
        message.in_flight = 0;

        info!(
            "Sending {} bytes to {} as {} fragments (seq {}, window {})",
            payload.len(),
            destination,
            fragment_count,
            frame.sequence,
            self.window_size
        );

        match message.send_window(transport, &mut self.stats) {
            Ok(WindowProgress::InFlight) => self.retain_if_done(id),
            Ok(WindowProgress::Finished) => self.complete(transport, id, Ok(())),
            Err(e) => {
                warn!("Fragmented send to {} failed: {}", destination, e);
                message.release();
                self.stats.messages_failed += 1;
                return Err(FragmentError::Transport(e));
            }
        }

        Ok(tag)
    }

    /// Feed a transport send completion.
    ///
    /// Returns [`SentDisposition::NotFragmented`] for frames without the
    /// fragmented option. Completions that match no message are absorbed.
    pub fn on_fragment_sent<T: Transport>(
        &mut self,
        transport: &mut T,
        frame: &ApsFrame,
        status: Result<(), TransportError>,
    ) -> SentDisposition {
        if !frame.is_fragmented() {
            return SentDisposition::NotFragmented;
        }

        if let Some(id) = self
            .pool
            .find(|m| m.active && m.frame.sequence == frame.sequence)
        {
            self.fragment_sent(transport, id, status);
        } else if self
            .retained
            .is_some_and(|r| r.frame.sequence == frame.sequence)
        {
            self.retained_fragment_sent(transport, status);
        } else {
            debug!("Ignoring completion for unknown seq {}", frame.sequence);
        }

        SentDisposition::Handled
    }

    fn fragment_sent<T: Transport>(
        &mut self,
        transport: &mut T,
        id: SlotId,
        status: Result<(), TransportError>,
    ) {
        let Some(message) = self.pool.get_mut(id) else {
            return;
        };

        if let Err(e) = status {
            warn!(
                "Fragment of seq {} to {} failed: {}",
                message.frame.sequence, message.destination, e
            );
            self.complete(transport, id, Err(e));
            return;
        }

        message.in_flight = message.in_flight.saturating_sub(1);
        if message.in_flight > 0 {
            return;
        }

        message.window_base += message.window_size as usize;
        match message.send_window(transport, &mut self.stats) {
            Ok(WindowProgress::InFlight) => self.retain_if_done(id),
            Ok(WindowProgress::Finished) => self.complete(transport, id, Ok(())),
            Err(e) => {
                warn!(
                    "Next window of seq {} to {} failed: {}",
                    message.frame.sequence, message.destination, e
                );
                self.complete(transport, id, Err(e));
            }
        }
    }

    fn retained_fragment_sent<T: Transport>(
        &mut self,
        transport: &mut T,
        status: Result<(), TransportError>,
    ) {
        let Some(retained) = self.retained.as_mut() else {
            return;
        };
        if status.is_ok() {
            retained.in_flight = retained.in_flight.saturating_sub(1);
            if retained.in_flight > 0 {
                return;
            }
        }

        let retained = *retained;
        self.retained = None;
        match status {
            Ok(()) => {
                info!(
                    "Fragmented message seq {} to {} delivered",
                    retained.frame.sequence, retained.destination
                );
                self.stats.messages_sent += 1;
            }
            Err(e) => {
                warn!(
                    "Final fragment of seq {} to {} failed: {}",
                    retained.frame.sequence, retained.destination, e
                );
                self.stats.messages_failed += 1;
            }
        }
        transport.message_sent(MessageSent {
            destination: retained.destination,
            frame: &retained.frame,
            payload: None,
            status,
            tag: MessageTag::new(retained.frame.sequence),
        });
    }

    /// Move a message whose final fragment is in flight to the retained
    /// record, returning its buffer to the pool.
    fn retain_if_done(&mut self, id: SlotId) {
        if !self.release_buffer_early || self.retained.is_some() {
            return;
        }
        let Some(message) = self.pool.get_mut(id) else {
            return;
        };
        if !message.last_window_sent() {
            return;
        }
        debug!(
            "Releasing buffer of seq {} before final acknowledgement",
            message.frame.sequence
        );
        self.retained = Some(RetainedMessage {
            destination: message.destination,
            frame: message.frame,
            in_flight: message.in_flight,
        });
        message.release();
    }

    /// Report the outcome of a message and free its slot.
    fn complete<T: Transport>(
        &mut self,
        transport: &mut T,
        id: SlotId,
        status: Result<(), TransportError>,
    ) {
        let Some(message) = self.pool.get_mut(id) else {
            return;
        };
        if status.is_ok() {
            info!(
                "Fragmented message seq {} to {} delivered",
                message.frame.sequence, message.destination
            );
            self.stats.messages_sent += 1;
        } else {
            self.stats.messages_failed += 1;
        }
        transport.message_sent(MessageSent {
            destination: message.destination,
            frame: &message.frame,
            payload: Some(&message.buffer),
            status,
            tag: message.tag(),
        });
        message.release();
    }

    /// Whether any outgoing message is in progress.
    pub fn is_active(&self) -> bool {
        self.retained.is_some() || self.pool.active_count() > 0
    }

    /// Number of messages occupying a pool slot.
    pub fn active_count(&self) -> usize {
        self.pool.active_count()
    }

    /// Drop every message without notifying anyone.
    pub fn clear(&mut self) {
        self.pool.iter_mut().for_each(OutgoingMessage::release);
        self.retained = None;
        self.stats = FragmentationStats::default();
    }

    /// Counters for outbound activity.
    pub fn stats(&self) -> &FragmentationStats {
        &self.stats
    }

    #[cfg(test)]
    fn window_base(&self, tag: MessageTag) -> Option<usize> {
        self.pool
            .iter()
            .find(|(_, m)| m.active && m.tag() == tag)
            .map(|(_, m)| m.window_base)
    }
}
