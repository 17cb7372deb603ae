//! Contract for the low-level TDM peripheral driver.
//!
//! Endpoints never touch registers or DMA themselves; they go through a
//! [`TdmHardware`] implementation. Handles are opaque and only meaningful to the
//! backend that issued them.

use std::time::Duration;

use thiserror::Error;

use super::port::PortId;
use super::slot_mask::SlotMask;

/// Clock role of the endpoint on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum I2sRole {
    /// Drives the bit and word clocks
    Primary,
    /// Follows clocks driven by another device
    Secondary,
}

/// Data direction of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    /// Speaker side; only reached through [`super::endpoint::TdmDriver`] so far
    #[allow(dead_code)]
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMode {
    Mono,
    Stereo,
}

/// Width of a slot on the wire. `Auto` follows the data width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotBitWidth {
    Auto,
    Bits8,
    Bits16,
    Bits24,
    Bits32,
}

impl SlotBitWidth {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(Self::Bits8),
            16 => Some(Self::Bits16),
            24 => Some(Self::Bits24),
            32 => Some(Self::Bits32),
            _ => None,
        }
    }

    pub fn bits(self) -> Option<u8> {
        match self {
            Self::Auto => None,
            Self::Bits8 => Some(8),
            Self::Bits16 => Some(16),
            Self::Bits24 => Some(24),
            Self::Bits32 => Some(32),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Default,
    /// Audio PLL, for sample rates the default clock cannot divide exactly
    Apll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MclkMultiple {
    X128,
    X256,
    X384,
    X512,
}

impl MclkMultiple {
    pub fn from_multiple(multiple: u32) -> Option<Self> {
        match multiple {
            128 => Some(Self::X128),
            256 => Some(Self::X256),
            384 => Some(Self::X384),
            512 => Some(Self::X512),
            _ => None,
        }
    }

    pub fn multiple(self) -> u32 {
        match self {
            Self::X128 => 128,
            Self::X256 => 256,
            Self::X384 => 384,
            Self::X512 => 512,
        }
    }
}

/// GPIO number, or `None` when the signal is not routed.
pub type Pin = Option<i32>;

/// Pin routing of one bus. Data pins are overlaid per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinConfig {
    pub mclk: Pin,
    pub bclk: Pin,
    pub ws: Pin,
    pub dout: Pin,
    pub din: Pin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub port: PortId,
    pub role: I2sRole,
    pub direction: Direction,
    pub dma_desc_num: u32,
    pub dma_frame_num: u32,
    pub auto_clear: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockConfig {
    pub sample_rate_hz: u32,
    pub clock_source: ClockSource,
    pub mclk_multiple: MclkMultiple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotConfig {
    /// Bits of audio data per sample
    pub data_bit_width: u8,
    pub slot_bit_width: SlotBitWidth,
    pub slot_mode: SlotMode,
    pub slot_mask: SlotMask,
}

/// Opaque channel handle issued by a [`TdmHardware`] backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    /// The wait elapsed without data becoming available
    #[error("timed out")]
    Timeout,
    /// Operation not valid in the channel's current state
    #[error("invalid channel state")]
    InvalidState,
    /// Unknown or already released handle
    #[error("channel not found")]
    NotFound,
    /// No free channel or DMA resources
    #[error("no free channel resources")]
    NoResource,
    #[error("driver error: {0}")]
    Driver(String),
}

/// TDM peripheral driver.
///
/// Every method may be called from the lifecycle tick or the streaming worker,
/// so implementations synchronise internally.
pub trait TdmHardware: Send + Sync {
    fn allocate_channel(&self, config: &ChannelConfig) -> Result<ChannelHandle, HwError>;

    fn configure(
        &self,
        handle: ChannelHandle,
        clock: &ClockConfig,
        slots: &SlotConfig,
        pins: &PinConfig,
    ) -> Result<(), HwError>;

    fn enable(&self, handle: ChannelHandle) -> Result<(), HwError>;

    fn disable(&self, handle: ChannelHandle) -> Result<(), HwError>;

    /// Free the channel. It must be disabled first.
    fn release(&self, handle: ChannelHandle) -> Result<(), HwError>;

    /// Read up to `buf.len()` bytes, blocking at most `timeout`.
    ///
    /// A short read is not an error. [`HwError::Timeout`] means nothing
    /// arrived before the deadline.
    fn read(&self, handle: ChannelHandle, buf: &mut [u8], timeout: Duration)
        -> Result<usize, HwError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_round_trip_through_bits() {
        for bits in [8u8, 16, 24, 32] {
            assert_eq!(SlotBitWidth::from_bits(bits).and_then(|w| w.bits()), Some(bits));
        }
        assert_eq!(SlotBitWidth::from_bits(12), None);
        assert_eq!(SlotBitWidth::Auto.bits(), None);
    }

    #[test]
    fn mclk_multiples() {
        assert_eq!(MclkMultiple::from_multiple(384), Some(MclkMultiple::X384));
        assert_eq!(MclkMultiple::X512.multiple(), 512);
        assert_eq!(MclkMultiple::from_multiple(100), None);
    }

    #[test]
    fn timeout_is_distinguishable() {
        let err = HwError::Timeout;
        assert_eq!(err.to_string(), "timed out");
        assert_ne!(err, HwError::Driver("timed out".into()));
    }

    #[test]
    fn driver_errors_carry_their_message() {
        let err = HwError::Driver("DMA underrun".into());
        assert_eq!(err.to_string(), "driver error: DMA underrun");
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(HwError::NoResource);
        assert_eq!(boxed.to_string(), "no free channel resources");
    }
}
