//! Entry points joining the fragmenter and reassembler to a transport.
//!
//! A [`Fragmentation`] owns all fragmentation state of one node. The stack
//! calls into it from three places: the application's send path, the
//! transport's message-sent callback and the transport's incoming-message
//! callback. A periodic timer callback drives [`Fragmentation::poll_timeouts`].
//!
//! # Example
//!
//! ```ignore
//! use aps_fragmentation::{ApsFrame, Destination, Fragmentation, FragmentationConfig, NodeId};
//!
//! let mut fragmentation = Fragmentation::new(FragmentationConfig::with_window_size(4))?;
//! let mut frame = ApsFrame::new(0x0104, 0x0019, 1, 1);
//! let tag = fragmentation.send_fragmented(
//!     &mut stack,
//!     Destination::Direct(NodeId::new(0x1234)),
//!     &mut frame,
//!     &image_block,
//! )?;
//! ```

use std::time::Instant;

use log::debug;

use super::config::FragmentationConfig;
use super::error::{ConfigError, FragmentError, TransportError};
use super::fragmenter::{Fragmenter, SentDisposition};
use super::frame::{ApsFrame, Destination, MessageTag, NodeId};
use super::mask::MAX_WINDOW_SIZE;
use super::pool::SlotId;
use super::reassembler::{IncomingOutcome, Reassembler, Received, ReceiveStatus};
use super::stats::FragmentationStats;
use super::transport::Transport;

/// All fragmentation state of one node.
#[derive(Debug)]
pub struct Fragmentation {
    config: FragmentationConfig,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    in_progress: bool,
}

impl Default for Fragmentation {
    fn default() -> Self {
        Self::build(FragmentationConfig::default())
    }
}

impl Fragmentation {
    /// Create fragmentation state with pools sized by `config`.
    pub fn new(config: FragmentationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: FragmentationConfig) -> Self {
        Self {
            config,
            fragmenter: Fragmenter::new(
                config.max_outgoing,
                config.buffer_capacity,
                config.window_size,
                config.release_buffer_early,
            ),
            reassembler: Reassembler::new(
                config.max_incoming,
                config.buffer_capacity,
                config.window_size,
                config.max_transmit_retries,
            ),
            in_progress: false,
        }
    }

    /// Free every slot and restore the configured window size.
    ///
    /// Messages in progress are dropped without a completion report. The
    /// transport is told fragmentation went idle if it was active.
    pub fn initialize<T: Transport>(&mut self, transport: &mut T) {
        self.fragmenter.clear();
        self.reassembler.clear();
        self.fragmenter.set_window_size(self.config.window_size);
        self.reassembler.set_window_size(self.config.window_size);
        self.update_in_progress(transport);
    }

    /// Send `payload` as a fragmented message.
    ///
    /// See [`Fragmenter::send`] for the errors returned.
    pub fn send_fragmented<T: Transport>(
        &mut self,
        transport: &mut T,
        destination: Destination,
        frame: &mut ApsFrame,
        payload: &[u8],
    ) -> Result<MessageTag, FragmentError> {
        let result = self.fragmenter.send(transport, destination, frame, payload);
        self.update_in_progress(transport);
        result
    }

    /// Transport message-sent callback.
    ///
    /// On [`SentDisposition::NotFragmented`] the caller continues with its
    /// normal completion handling.
    pub fn on_message_sent<T: Transport>(
        &mut self,
        transport: &mut T,
        frame: &ApsFrame,
        status: Result<(), TransportError>,
    ) -> SentDisposition {
        let disposition = self.fragmenter.on_fragment_sent(transport, frame, status);
        self.update_in_progress(transport);
        disposition
    }

    /// Transport incoming-message callback.
    ///
    /// On [`IncomingOutcome::NotFragmented`] the caller continues with its
    /// normal receive handling; on [`IncomingOutcome::Reassembled`] it
    /// handles the returned payload in place of `data`.
    pub fn on_incoming_message<T: Transport>(
        &mut self,
        transport: &mut T,
        frame: &mut ApsFrame,
        sender: NodeId,
        data: &[u8],
    ) -> IncomingOutcome<'_> {
        let received = self.reassembler.receive(transport, frame, sender, data);
        self.update_in_progress(transport);
        match received {
            Received::NotFragmented => IncomingOutcome::NotFragmented,
            Received::Consumed => IncomingOutcome::Consumed,
            Received::Complete(id) => self
                .reassembler
                .payload(id)
                .map_or(IncomingOutcome::Consumed, IncomingOutcome::Reassembled),
        }
    }

    /// Retransmission timer callback: abandon overdue reassemblies.
    ///
    /// Returns the number of reassemblies abandoned.
    pub fn poll_timeouts<T: Transport>(&mut self, transport: &mut T) -> usize {
        let expired = self.reassembler.poll_timeouts(transport.now());
        self.update_in_progress(transport);
        expired
    }

    /// Abandon one reassembly, discarding its partial data.
    pub fn abort_reception<T: Transport>(&mut self, transport: &mut T, id: SlotId) {
        self.reassembler.abort_reception(id);
        self.update_in_progress(transport);
    }

    /// Slot reassembling `sequence` from `sender`.
    pub fn find_reception(&self, sender: NodeId, sequence: u8) -> Option<SlotId> {
        self.reassembler.find_reception(sender, sequence)
    }

    /// Status of an incoming slot.
    pub fn reception_status(&self, id: SlotId) -> Option<ReceiveStatus> {
        self.reassembler.status(id)
    }

    /// When [`poll_timeouts`](Self::poll_timeouts) next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.reassembler.next_deadline()
    }

    /// Change the window size. Zero disables new fragmented sends.
    pub fn set_window_size(&mut self, window_size: u8) -> Result<(), ConfigError> {
        if window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::InvalidConfig("window_size must be <= 8"));
        }
        self.fragmenter.set_window_size(window_size);
        self.reassembler.set_window_size(window_size);
        Ok(())
    }

    /// Window size applied to newly admitted messages.
    pub fn window_size(&self) -> u8 {
        self.fragmenter.window_size()
    }

    /// Whether any outgoing or incoming fragmented message is in progress.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Combined counters for both directions.
    pub fn stats(&self) -> FragmentationStats {
        *self.fragmenter.stats() + *self.reassembler.stats()
    }

    /// The configuration this instance was built with.
    pub fn config(&self) -> &FragmentationConfig {
        &self.config
    }

    fn update_in_progress<T: Transport>(&mut self, transport: &mut T) {
        let active = self.fragmenter.is_active() || self.reassembler.is_active();
        if active != self.in_progress {
            debug!("Fragmentation {}", if active { "active" } else { "idle" });
            self.in_progress = active;
            transport.fragmentation_active(active);
        }
    }
}
