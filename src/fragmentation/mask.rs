//! Receive-window bit mask.
//!
//! Bit `i` covers fragment `window_base + i`. Bits at or above the window
//! size, and bits past the last fragment of the final window, are preset to
//! one so that "every fragment in the window arrived" is a comparison against
//! all-ones.

/// Largest supported window: one bit per fragment in a `u8`.
pub const MAX_WINDOW_SIZE: u8 = 8;

const ALL_RECEIVED: u8 = 0xFF;

/// Received-fragment mask for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowMask(u8);

impl WindowMask {
    /// Fresh mask for the window starting at `window_base`.
    ///
    /// `fragments_expected` is `None` until fragment 0 has told us the count.
    pub fn for_window(window_size: u8, window_base: usize, fragments_expected: Option<u8>) -> Self {
        let mut used = window_size.min(MAX_WINDOW_SIZE) as usize;
        if let Some(expected) = fragments_expected {
            let expected = expected as usize;
            if expected < window_base + used {
                used = expected.saturating_sub(window_base);
            }
        }
        let used_bits = ((1u16 << used) - 1) as u8;
        Self(!used_bits)
    }

    /// Raw mask bits.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Check whether the fragment at `offset` inside the window is marked.
    pub fn is_set(&self, offset: usize) -> bool {
        offset < MAX_WINDOW_SIZE as usize && self.0 & (1 << offset) != 0
    }

    /// Mark the fragment at `offset`. Returns `true` if it was not marked yet.
    pub fn set(&mut self, offset: usize) -> bool {
        if offset >= MAX_WINDOW_SIZE as usize || self.is_set(offset) {
            return false;
        }
        self.0 |= 1 << offset;
        true
    }

    /// Preset the bits the final window does not use, keeping received bits.
    pub fn narrow(&mut self, window_size: u8, window_base: usize, fragments_expected: u8) {
        self.0 |= Self::for_window(window_size, window_base, Some(fragments_expected)).0;
    }

    /// Every fragment in the window has arrived.
    pub fn is_complete(&self) -> bool {
        self.0 == ALL_RECEIVED
    }
}
