//! Counters for fragmentation activity.

/// Running totals since the last [`Fragmentation::initialize`](super::Fragmentation::initialize).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentationStats {
    /// Fragmented messages fully acknowledged.
    pub messages_sent: u32,
    /// Fragmented messages aborted by a transport failure.
    pub messages_failed: u32,
    /// Fragments handed to the transport.
    pub fragments_sent: u32,
    /// Fragments accepted into a reassembly window.
    pub fragments_received: u32,
    /// Fragments that were already marked in the window.
    pub duplicate_fragments: u32,
    /// Fragments dropped because they fell outside the window.
    pub out_of_window: u32,
    /// First fragments dropped because every incoming slot was busy.
    pub slots_exhausted: u32,
    /// Messages delivered to the application.
    pub messages_reassembled: u32,
    /// Insufficient-space responses sent.
    pub oversize_responses: u32,
    /// Reassemblies abandoned on timeout.
    pub reception_timeouts: u32,
    /// Reassemblies abandoned on malformed fragments or explicit abort.
    pub reception_aborts: u32,
}

impl FragmentationStats {
    /// Serialize to JSON.
    pub fn to_json(&self) -> String {
        format!(
            r#"{{"tx":{{"messages":{},"failed":{},"fragments":{}}},"rx":{{"fragments":{},"duplicates":{},"out_of_window":{},"slots_exhausted":{},"messages":{},"oversize":{},"timeouts":{},"aborts":{}}}}}"#,
            self.messages_sent,
            self.messages_failed,
            self.fragments_sent,
            self.fragments_received,
            self.duplicate_fragments,
            self.out_of_window,
            self.slots_exhausted,
            self.messages_reassembled,
            self.oversize_responses,
            self.reception_timeouts,
            self.reception_aborts,
        )
    }
}

impl std::ops::Add for FragmentationStats {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            messages_sent: self.messages_sent.wrapping_add(other.messages_sent),
            messages_failed: self.messages_failed.wrapping_add(other.messages_failed),
            fragments_sent: self.fragments_sent.wrapping_add(other.fragments_sent),
            fragments_received: self.fragments_received.wrapping_add(other.fragments_received),
            duplicate_fragments: self.duplicate_fragments.wrapping_add(other.duplicate_fragments),
            out_of_window: self.out_of_window.wrapping_add(other.out_of_window),
            slots_exhausted: self.slots_exhausted.wrapping_add(other.slots_exhausted),
            messages_reassembled: self.messages_reassembled.wrapping_add(other.messages_reassembled),
            oversize_responses: self.oversize_responses.wrapping_add(other.oversize_responses),
            reception_timeouts: self.reception_timeouts.wrapping_add(other.reception_timeouts),
            reception_aborts: self.reception_aborts.wrapping_add(other.reception_aborts),
        }
    }
}
