//! APS-layer fragmentation for low-power mesh networks.
//!
//! This library is transport-agnostic: the network stack implements
//! [`Transport`] and forwards its send, send-complete and receive callbacks
//! to a [`Fragmentation`] instance.

pub mod fragmentation;

// Re-export commonly used items
pub use fragmentation::{
    ApsFrame, ConfigError, Destination, FragmentError, Fragmentation, FragmentationConfig,
    FragmentationStats, IncomingOutcome, MessageSent, MessageTag, NodeId, SentDisposition,
    Transport, TransportError, WindowAck,
};
