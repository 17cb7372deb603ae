//! Ownership of one physical TDM bus.
//!
//! Several endpoints (microphone, speaker) can sit on the same bus but the
//! peripheral only has one channel per port, so an endpoint must hold the bus
//! lock for as long as its channel is live.

use std::sync::{Arc, Mutex, PoisonError};

use super::hardware::{Pin, PinConfig};
use super::port::{PortAllocator, PortId};
use super::slot_mask::SlotMask;
use super::status::Status;

pub struct TdmBus {
    port: Option<PortId>,
    pins: PinConfig,
    slot_mask: SlotMask,
    status: Status,
    locked: Mutex<bool>,
}

impl TdmBus {
    /// Claim a port for a new bus.
    ///
    /// If every port is taken the bus is created in the failed state and
    /// refuses to be locked.
    pub fn new(
        allocator: &PortAllocator,
        mclk: Pin,
        bclk: Pin,
        ws: Pin,
        slot_mask: SlotMask,
    ) -> Arc<Self> {
        let status = Status::new();
        let port = match allocator.allocate_port() {
            Ok(port) => Some(port),
            Err(e) => {
                log::error!("{}", e);
                status.mark_failed();
                None
            }
        };

        Arc::new(Self {
            port,
            pins: PinConfig {
                mclk,
                bclk,
                ws,
                dout: None,
                din: None,
            },
            slot_mask,
            status,
            locked: Mutex::new(false),
        })
    }

    pub fn port(&self) -> Option<PortId> {
        self.port
    }

    pub fn is_failed(&self) -> bool {
        self.status.is_failed()
    }

    /// Shared clock pins; both data pins are unrouted, endpoints add their own.
    pub fn pin_config(&self) -> PinConfig {
        self.pins
    }

    /// Slots selected for the bus as a whole.
    pub fn slot_mask(&self) -> SlotMask {
        self.slot_mask
    }

    /// Take the bus without waiting. `None` if another endpoint holds it or
    /// the bus failed to get a port.
    pub fn try_lock(self: &Arc<Self>) -> Option<BusLease> {
        if self.is_failed() {
            return None;
        }
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        if *locked {
            return None;
        }
        *locked = true;
        Some(BusLease { bus: self.clone() })
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        *locked = false;
    }

    pub fn dump_config(&self) {
        log::info!(
            "TDM bus: port={}, mclk={:?}, bclk={:?}, lrclk={:?}, slots={} ({} active){}",
            self.port.map_or_else(|| "none".to_string(), |p| p.to_string()),
            self.pins.mclk,
            self.pins.bclk,
            self.pins.ws,
            self.slot_mask,
            self.slot_mask.count(),
            if self.is_failed() { " (FAILED)" } else { "" },
        );
    }
}

/// Exclusive hold on a [`TdmBus`]. Dropping it unlocks the bus.
#[must_use = "the bus is unlocked as soon as the lease is dropped"]
pub struct BusLease {
    bus: Arc<TdmBus>,
}

impl BusLease {
    pub fn unlock(self) {}
}

impl Drop for BusLease {
    fn drop(&mut self) {
        self.bus.unlock();
    }
}

impl std::fmt::Debug for BusLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusLease").field("port", &self.bus.port).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tdm::slot_mask::compute_slot_mask;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn bus(allocator: &PortAllocator) -> Arc<TdmBus> {
        TdmBus::new(
            allocator,
            Some(13),
            Some(12),
            Some(10),
            compute_slot_mask(&[0, 1]).unwrap(),
        )
    }

    #[test]
    fn try_lock_is_exclusive_until_dropped() {
        let alloc = PortAllocator::new(1);
        let bus = bus(&alloc);
        let lease = bus.try_lock().expect("first lock");
        assert!(bus.is_locked());
        assert!(bus.try_lock().is_none());
        lease.unlock();
        assert!(!bus.is_locked());
        assert!(bus.try_lock().is_some());
    }

    #[test]
    fn racing_try_lock_has_one_winner() {
        let alloc = PortAllocator::new(1);
        let bus = bus(&alloc);
        let barrier = Arc::new(Barrier::new(2));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let bus = bus.clone();
                let barrier = barrier.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let lease = bus.try_lock();
                    if lease.is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    // Hold until both threads have tried
                    barrier.wait();
                    drop(lease);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(!bus.is_locked());
    }

    #[test]
    fn bus_without_port_is_failed_and_unlockable() {
        let alloc = PortAllocator::new(1);
        let first = bus(&alloc);
        let second = bus(&alloc);
        assert_eq!(first.port().map(|p| p.index()), Some(0));
        assert!(second.is_failed());
        assert_eq!(second.port(), None);
        assert!(second.try_lock().is_none());
    }

    #[test]
    fn pin_config_leaves_data_pins_unrouted() {
        let alloc = PortAllocator::new(1);
        let pins = bus(&alloc).pin_config();
        assert_eq!(pins.ws, Some(10));
        assert_eq!(pins.din, None);
        assert_eq!(pins.dout, None);
    }
}
