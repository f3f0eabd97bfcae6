//! Bounded auto port rotation for followers whose port is taken.

/// Port a rotation wraps back to past 65535.
pub const BASE_PORT: u16 = 54545;

/// Consecutive rotations allowed before giving up.
pub const MAX_PORT_RECOVERIES: u32 = 5;

/// The port after `port`, wrapping to [`BASE_PORT`] instead of overflowing.
pub fn next_port(port: u16) -> u16 {
    port.checked_add(1).unwrap_or(BASE_PORT)
}

/// Counts consecutive port-conflict recoveries.
#[derive(Debug, Default, Clone)]
pub struct PortRecovery {
    attempts: u32,
}

impl PortRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= MAX_PORT_RECOVERIES
    }

    /// A session came up; the next conflict starts a fresh count.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Record a conflict on `current` and return the port to try next, or
    /// `None` once the bound is reached.
    pub fn rotate(&mut self, current: u16) -> Option<u16> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some(next_port(current))
    }
}
