//! Local port allocation for INDI servers

use crate::error::{DriverError, DriverResult};
use std::net::TcpListener;

/// Check whether a port can be bound on the loopback interface
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Round-robin cursor over the configured server port range
#[derive(Debug, Clone)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    /// Last port handed out; `start - 1` before the first allocation
    cursor: u32,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            cursor: u32::from(start).saturating_sub(1),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Rewind so the next allocation starts at the beginning of the range
    pub fn reset(&mut self) {
        self.cursor = u32::from(self.start).saturating_sub(1);
    }

    /// Resolve a server port. An explicit port is only verified; otherwise the range
    /// is scanned forward from the cursor, wrapping to the start once.
    pub fn allocate(&mut self, custom: Option<u16>) -> DriverResult<u16> {
        self.allocate_with(custom, is_port_available)
    }

    fn allocate_with<F>(&mut self, custom: Option<u16>, available: F) -> DriverResult<u16>
    where
        F: Fn(u16) -> bool,
    {
        if let Some(port) = custom {
            return if available(port) {
                Ok(port)
            } else {
                Err(DriverError::PortUnavailable(port))
            };
        }

        let start = u32::from(self.start);
        let end = u32::from(self.end);

        self.cursor += 1;
        if self.cursor > end || self.cursor < start {
            self.cursor = start;
        }

        let first = self.cursor;
        let candidates = (first..=end).chain(start..first);
        for candidate in candidates {
            // Range bounds come from u16 values
            let port = candidate as u16;
            if available(port) {
                self.cursor = candidate;
                return Ok(port);
            }
        }

        Err(DriverError::PortsExhausted {
            start: self.start,
            end: self.end,
        })
    }
}
