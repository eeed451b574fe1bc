//! Error types for fragmented sends and configuration.

use std::fmt;

/// Failure reported by the transport for a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The stack has no packet buffers left.
    NoBuffers,
    /// The node is not joined to a network.
    NetworkDown,
    /// The frame was not acknowledged after all retries.
    DeliveryFailed,
    /// No route to the destination is known.
    NoRoute,
    /// Any other stack status code.
    Other(u8),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBuffers => write!(f, "no packet buffers available"),
            Self::NetworkDown => write!(f, "network down"),
            Self::DeliveryFailed => write!(f, "delivery failed"),
            Self::NoRoute => write!(f, "no route to destination"),
            Self::Other(code) => write!(f, "transport status 0x{:02X}", code),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors returned when starting a fragmented send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Fragmentation is disabled (window size zero).
    InvalidCall,
    /// Payload exceeds the buffer capacity or needs more than 255 fragments.
    MessageTooLong {
        /// Payload length in bytes.
        len: usize,
        /// Largest length that can be sent.
        max: usize,
    },
    /// Every outgoing slot is busy.
    ResourceExhausted,
    /// The transport refused a fragment.
    Transport(TransportError),
}

impl fmt::Display for FragmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCall => write!(f, "fragmentation disabled (window size 0)"),
            Self::MessageTooLong { len, max } => {
                write!(f, "message too long: {} bytes (max: {})", len, max)
            }
            Self::ResourceExhausted => write!(f, "no free fragmentation slot"),
            Self::Transport(e) => write!(f, "fragment send failed: {}", e),
        }
    }
}

impl std::error::Error for FragmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for FragmentError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Error type for configuration validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration parameter.
    InvalidConfig(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid fragmentation config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_display() {
        assert_eq!(
            FragmentError::MessageTooLong { len: 2000, max: 1500 }.to_string(),
            "message too long: 2000 bytes (max: 1500)"
        );
        assert_eq!(
            FragmentError::Transport(TransportError::Other(0x66)).to_string(),
            "fragment send failed: transport status 0x66"
        );
        assert_eq!(
            ConfigError::InvalidConfig("window_size must be <= 8").to_string(),
            "invalid fragmentation config: window_size must be <= 8"
        );
    }

    #[test]
    fn test_transport_error_is_source() {
        let err: FragmentError = TransportError::NoRoute.into();
        assert_eq!(err, FragmentError::Transport(TransportError::NoRoute));
        assert!(err.source().is_some());
        assert!(FragmentError::InvalidCall.source().is_none());
    }
}
