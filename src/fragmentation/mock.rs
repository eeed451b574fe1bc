//! Recording transport for unit tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::error::TransportError;
use super::frame::{ApsFrame, Destination, MessageTag, NodeId, WindowAck};
use super::transport::{MessageSent, Transport};

/// A fragment handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFragment {
    pub destination: Destination,
    pub frame: ApsFrame,
    pub data: Vec<u8>,
}

impl SentFragment {
    pub fn index(&self) -> u8 {
        self.frame.fragment_index()
    }
}

/// An owned copy of a [`MessageSent`] report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub destination: Destination,
    pub frame: ApsFrame,
    pub payload: Option<Vec<u8>>,
    pub status: Result<(), TransportError>,
    pub tag: MessageTag,
}

pub struct MockTransport {
    pub mtu: usize,
    pub sequence: u8,
    pub retry_timeout_ms: u32,
    /// Fragment indices to refuse, consumed in order.
    pub refuse: VecDeque<(u8, TransportError)>,
    pub sent: Vec<SentFragment>,
    pub acks: Vec<(NodeId, ApsFrame, WindowAck)>,
    pub oversize: Vec<(NodeId, ApsFrame)>,
    pub completions: Vec<Completion>,
    pub active_changes: Vec<bool>,
    pub clock: Instant,
}

impl MockTransport {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            sequence: 0x40,
            retry_timeout_ms: 100,
            refuse: VecDeque::new(),
            sent: Vec::new(),
            acks: Vec::new(),
            oversize: Vec::new(),
            completions: Vec::new(),
            active_changes: Vec::new(),
            clock: Instant::now(),
        }
    }

    pub fn refuse(&mut self, index: u8, error: TransportError) {
        self.refuse.push_back((index, error));
    }

    pub fn advance(&mut self, by: Duration) {
        self.clock += by;
    }

    /// Drain the fragments sent since the last call.
    pub fn take_sent(&mut self) -> Vec<SentFragment> {
        std::mem::take(&mut self.sent)
    }

    pub fn sent_indices(&self) -> Vec<u8> {
        self.sent.iter().map(SentFragment::index).collect()
    }
}

impl Transport for MockTransport {
    fn next_sequence(&mut self) -> u8 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    fn max_fragment_payload(&self, _destination: Destination, _frame: &ApsFrame) -> usize {
        self.mtu
    }

    fn send_fragment(
        &mut self,
        destination: Destination,
        frame: &ApsFrame,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if let Some(&(index, error)) = self.refuse.front() {
            if index == frame.fragment_index() {
                self.refuse.pop_front();
                return Err(error);
            }
        }
        self.sent.push(SentFragment {
            destination,
            frame: *frame,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn retry_timeout_ms(&self, _node: NodeId) -> u32 {
        self.retry_timeout_ms
    }

    fn send_window_ack(&mut self, sender: NodeId, frame: &ApsFrame, ack: WindowAck) {
        self.acks.push((sender, *frame, ack));
    }

    fn send_oversize_response(&mut self, sender: NodeId, frame: &ApsFrame) {
        self.oversize.push((sender, *frame));
    }

    fn message_sent(&mut self, report: MessageSent<'_>) {
        self.completions.push(Completion {
            destination: report.destination,
            frame: *report.frame,
            payload: report.payload.map(<[u8]>::to_vec),
            status: report.status,
            tag: report.tag,
        });
    }

    fn fragmentation_active(&mut self, active: bool) {
        self.active_changes.push(active);
    }

    fn now(&self) -> Instant {
        self.clock
    }
}
