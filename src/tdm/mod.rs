//! tdm - Shared TDM audio bus and its endpoints
//!
//! One [`TdmBus`] per physical serial port arbitrates access between the
//! endpoints wired to it. Endpoints talk to the peripheral through the
//! [`TdmHardware`] trait; [`SimulatedTdm`] is the in-process backend and
//! `AlsaTdm` (feature `alsa`) maps the same calls onto an ALSA capture device.

#[cfg(feature = "alsa")]
mod alsa_device;
mod bus;
mod dc_filter;
mod endpoint;
mod hardware;
mod listeners;
mod microphone;
mod port;
mod sim;
mod slot_mask;
mod status;
mod stream_info;

#[cfg(feature = "alsa")]
pub use alsa_device::AlsaTdm;
pub use bus::TdmBus;
pub use endpoint::{AudioEndpoint, EndpointConfig};
pub use hardware::{
    ClockSource, Direction, I2sRole, MclkMultiple, PinConfig, SlotBitWidth, SlotMode, TdmHardware,
};
pub use microphone::{MicrophoneOptions, MicrophoneState, TdmMicrophone};
pub use port::PortAllocator;
pub use sim::SimulatedTdm;
pub use slot_mask::compute_slot_mask;
pub use stream_info::{AudioStreamInfo, unpack_sample};
