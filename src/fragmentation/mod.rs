//! APS fragmentation and reassembly.
//!
//! Messages larger than one frame are split into numbered fragments and sent
//! a window at a time. The receiver acknowledges each window with a bitmask
//! and rebuilds the message from fragments that may arrive out of order or
//! more than once.

mod config;
mod engine;
mod error;
mod fragmenter;
mod frame;
mod mask;
#[cfg(test)]
mod mock;
mod pool;
mod reassembler;
mod stats;
mod transport;

pub use config::FragmentationConfig;
pub use engine::Fragmentation;
pub use error::{ConfigError, FragmentError, TransportError};
pub use fragmenter::{Fragmenter, SentDisposition};
pub use frame::{
    ApsFrame, Destination, MessageTag, NodeId, WindowAck, APS_OPTION_FRAGMENTED, APS_OPTION_RETRY,
};
pub use mask::{WindowMask, MAX_WINDOW_SIZE};
pub use pool::SlotId;
pub use reassembler::{IncomingOutcome, ReceiveStatus, Reassembler};
pub use stats::FragmentationStats;
pub use transport::{MessageSent, Transport};
