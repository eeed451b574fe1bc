//! Fragmentation configuration.
//!
//! Pool sizes and the buffer capacity are fixed for the lifetime of a
//! [`Fragmentation`](super::Fragmentation) instance. The window size can be
//! changed at runtime.

use serde::Deserialize;

use super::error::ConfigError;
use super::mask::MAX_WINDOW_SIZE;

/// Configuration for fragmented sends and reassembly.
///
/// Note: This is `Copy` for efficient passing to constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FragmentationConfig {
    /// Fragments in flight (outbound) or accepted (inbound) per window.
    /// Zero disables fragmented sends.
    pub window_size: u8,
    /// Maximum concurrent outgoing fragmented messages.
    pub max_outgoing: usize,
    /// Maximum concurrent incoming reassemblies.
    pub max_incoming: usize,
    /// Largest message, in bytes, that can be sent or reassembled.
    pub buffer_capacity: usize,
    /// Transport retries per hop, used to size the reassembly timeout.
    pub max_transmit_retries: u8,
    /// Release an outgoing buffer as soon as its last fragment is handed to
    /// the transport. The completion report then carries no payload.
    pub release_buffer_early: bool,
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            window_size: 1,
            max_outgoing: 2,
            max_incoming: 2,
            buffer_capacity: 1500,
            max_transmit_retries: 3,
            release_buffer_early: false,
        }
    }
}

impl FragmentationConfig {
    /// Create config with a custom window size.
    pub fn with_window_size(window_size: u8) -> Self {
        Self {
            window_size,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::InvalidConfig("window_size must be <= 8"));
        }
        if self.max_outgoing == 0 {
            return Err(ConfigError::InvalidConfig("max_outgoing must be > 0"));
        }
        if self.max_incoming == 0 {
            return Err(ConfigError::InvalidConfig("max_incoming must be > 0"));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::InvalidConfig("buffer_capacity must be > 0"));
        }
        if self.max_transmit_retries == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_transmit_retries must be > 0",
            ));
        }
        Ok(())
    }
}
