//! TDM slot selection.

use std::fmt;

use thiserror::Error;

/// Number of addressable TDM slots (indices `0..=14`).
pub const MAX_SLOTS: u8 = 15;

/// Bitmask of active TDM slots; bit `i` set means slot `i` is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotMask(u16);

impl SlotMask {
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[cfg(test)]
    pub const fn contains(self, slot: u8) -> bool {
        slot < MAX_SLOTS && self.0 & (1 << slot) != 0
    }

    /// Number of slots selected.
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SlotMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("TDM slot {0} out of range (hardware supports 0..={max})", max = MAX_SLOTS - 1)]
pub struct InvalidSlot(pub u8);

/// Build the slot mask for a list of slot indices.
///
/// Order and duplicates do not matter. Indices above 14 are rejected; callers
/// do this while loading configuration, never on the audio path.
pub fn compute_slot_mask(slots: &[u8]) -> Result<SlotMask, InvalidSlot> {
    let mut mask = 0u16;
    for &slot in slots {
        if slot >= MAX_SLOTS {
            return Err(InvalidSlot(slot));
        }
        mask |= 1 << slot;
    }
    log::debug!("TDM slot mask: 0x{:04X}", mask);
    Ok(SlotMask(mask))
}
