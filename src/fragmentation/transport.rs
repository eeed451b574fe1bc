//! The transport collaborator.
//!
//! Fragmentation sits between the application and the APS layer. The stack
//! embedding it implements [`Transport`] to give it per-frame send, MTU and
//! timing information, and to receive the notifications it produces.

use std::time::Instant;

use super::error::TransportError;
use super::frame::{ApsFrame, Destination, MessageTag, NodeId, WindowAck};

/// Completion report for one logical fragmented message.
///
/// Delivered exactly once per message, never once per fragment.
#[derive(Debug)]
pub struct MessageSent<'a> {
    /// Where the message was sent.
    pub destination: Destination,
    /// APS header of the message.
    pub frame: &'a ApsFrame,
    /// The original payload. `None` when the buffer was released before the
    /// final acknowledgement.
    pub payload: Option<&'a [u8]>,
    /// Outcome of the whole message.
    pub status: Result<(), TransportError>,
    /// Tag returned by the send call.
    pub tag: MessageTag,
}

/// Platform hooks consumed and driven by fragmentation.
pub trait Transport {
    /// Allocate the APS sequence number for a new logical message.
    fn next_sequence(&mut self) -> u8;

    /// Largest fragment payload the stack can carry to `destination` with
    /// this header.
    fn max_fragment_payload(&self, destination: Destination, frame: &ApsFrame) -> usize;

    /// Queue one fragment. Completion is reported later through
    /// [`Fragmentation::on_message_sent`](super::Fragmentation::on_message_sent).
    fn send_fragment(
        &mut self,
        destination: Destination,
        frame: &ApsFrame,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Per-hop acknowledgement timeout towards `node`, including any extra
    /// delay for sleepy or indirectly reached devices.
    fn retry_timeout_ms(&self, node: NodeId) -> u32;

    /// Reply to `sender` with the progress of its current window.
    fn send_window_ack(&mut self, sender: NodeId, frame: &ApsFrame, ack: WindowAck);

    /// Tell `sender` the reassembled message does not fit (insufficient space).
    fn send_oversize_response(&mut self, sender: NodeId, frame: &ApsFrame);

    /// A fragmented message finished, successfully or not.
    fn message_sent(&mut self, report: MessageSent<'_>);

    /// Fragmentation became active or idle. Sleep scheduling uses this to
    /// keep the radio awake.
    fn fragmentation_active(&mut self, _active: bool) {}

    /// Current time, used for reassembly timeouts.
    fn now(&self) -> Instant {
        Instant::now()
    }
}
