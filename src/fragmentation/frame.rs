//! APS frame header fields used by fragmentation.
//!
//! Fragmented messages reuse the 16-bit group id of the APS header, which is
//! meaningless for unicast delivery:
//!
//! ```text
//! data frame:  group_id = [fragment count: high byte][fragment index: low byte]
//! window ack:  group_id = [received mask:  high byte][window base:    low byte]
//! ```
//!
//! The fragment count is only meaningful on fragment 0; receivers ignore the
//! high byte of every other fragment.

use std::fmt;

/// APS option: the frame is one fragment of a larger message.
pub const APS_OPTION_FRAGMENTED: u16 = 0x8000;

/// APS option: the transport retries the frame until it is acknowledged.
pub const APS_OPTION_RETRY: u16 = 0x0040;

/// Short network address of a mesh node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u16);

impl NodeId {
    /// Create a node id from its 16-bit short address.
    pub const fn new(address: u16) -> Self {
        Self(address)
    }

    /// Get the raw short address.
    pub const fn address(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Where an outgoing fragmented message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Unicast straight to a node id.
    Direct(NodeId),
    /// Unicast to the node stored at an address table index.
    AddressTable(u8),
    /// Unicast to the remote end of a binding table entry.
    Binding(u8),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(node) => write!(f, "{}", node),
            Self::AddressTable(index) => write!(f, "address-table[{}]", index),
            Self::Binding(index) => write!(f, "binding[{}]", index),
        }
    }
}

/// Opaque tag returned by a fragmented send, echoed in the completion report.
///
/// Carries the transport sequence number of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageTag(u8);

impl MessageTag {
    pub(crate) const fn new(sequence: u8) -> Self {
        Self(sequence)
    }

    /// Transport sequence number the tag was derived from.
    pub const fn sequence(&self) -> u8 {
        self.0
    }
}

/// The subset of the APS header that fragmentation reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApsFrame {
    /// Application profile id.
    pub profile_id: u16,
    /// Cluster id.
    pub cluster_id: u16,
    /// Source endpoint.
    pub source_endpoint: u8,
    /// Destination endpoint.
    pub destination_endpoint: u8,
    /// APS option bits (`APS_OPTION_*`).
    pub options: u16,
    /// Group id, repurposed for fragment bookkeeping.
    pub group_id: u16,
    /// Transport sequence number.
    pub sequence: u8,
}

impl ApsFrame {
    /// Create a frame for the given profile/cluster pair and endpoints.
    pub fn new(profile_id: u16, cluster_id: u16, source_endpoint: u8, destination_endpoint: u8) -> Self {
        Self {
            profile_id,
            cluster_id,
            source_endpoint,
            destination_endpoint,
            ..Default::default()
        }
    }

    /// Check if the frame carries the fragmented option.
    #[inline]
    pub fn is_fragmented(&self) -> bool {
        self.options & APS_OPTION_FRAGMENTED != 0
    }

    /// Check if the frame carries the retry option.
    #[inline]
    pub fn is_retry(&self) -> bool {
        self.options & APS_OPTION_RETRY != 0
    }

    /// Stamp fragment index and total count into the group id.
    pub fn set_fragment_info(&mut self, index: u8, count: u8) {
        self.group_id = u16::from_be_bytes([count, index]);
    }

    /// Fragment index carried in the low byte of the group id.
    #[inline]
    pub fn fragment_index(&self) -> u8 {
        self.group_id.to_be_bytes()[1]
    }

    /// Total fragment count carried in the high byte of the group id.
    ///
    /// Only valid on fragment 0.
    #[inline]
    pub fn fragment_count(&self) -> u8 {
        self.group_id.to_be_bytes()[0]
    }
}

/// Window progress reported back to a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAck {
    /// First fragment index of the acknowledged window.
    pub window_base: u8,
    /// Received mask of that window, unused high bits set.
    pub mask: u8,
}

impl WindowAck {
    /// Encode as a reply group id: mask in the high byte, base in the low byte.
    pub fn to_group_id(&self) -> u16 {
        u16::from_be_bytes([self.mask, self.window_base])
    }

    /// Decode from a reply group id.
    pub fn from_group_id(group_id: u16) -> Self {
        let [mask, window_base] = group_id.to_be_bytes();
        Self { window_base, mask }
    }
}
