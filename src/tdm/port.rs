//! Hardware serial port assignment for bus owners.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

/// Identifier of one physical TDM serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u8);

impl PortId {
    pub fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port{}", self.0)
    }
}

/// Returned when every hardware port has already been handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("No unused TDM port available (all {max_ports} in use)")]
pub struct PortsExhausted {
    pub max_ports: u8,
}

/// Process-wide port counter.
///
/// Ports are handed out in increasing order and never returned: the port count
/// is a fixed property of the chip, so once the counter passes `max_ports`
/// every further allocation fails.
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU8,
    max_ports: u8,
}

impl PortAllocator {
    pub const fn new(max_ports: u8) -> Self {
        Self {
            next: AtomicU8::new(0),
            max_ports,
        }
    }

    pub fn allocate_port(&self) -> Result<PortId, PortsExhausted> {
        let max_ports = self.max_ports;
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                if next < max_ports { Some(next + 1) } else { None }
            })
            .map(PortId)
            .map_err(|_| PortsExhausted { max_ports })
    }

    pub fn allocated(&self) -> u8 {
        self.next.load(Ordering::Acquire)
    }

    pub fn max_ports(&self) -> u8 {
        self.max_ports
    }
}
