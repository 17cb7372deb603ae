//! Per-endpoint configuration and the driver start/stop shared by every
//! direction.

use std::sync::Arc;

use super::bus::{BusLease, TdmBus};
use super::hardware::{
    ChannelConfig, ChannelHandle, ClockConfig, ClockSource, Direction, I2sRole, MclkMultiple,
    Pin, PinConfig, SlotBitWidth, SlotConfig, SlotMode, TdmHardware,
};
use super::port::PortId;
use super::slot_mask::SlotMask;
use super::stream_info::AudioStreamInfo;

const DMA_DESC_NUM: u32 = 4;
const DMA_FRAME_NUM: u32 = 256;

/// Something that streams audio over a TDM bus.
pub trait AudioEndpoint {
    fn direction(&self) -> Direction;

    /// Register interest; the endpoint runs while anyone is registered.
    fn open(&self);

    /// Drop a registration made with [`AudioEndpoint::open`].
    fn close(&self);

    /// Stream shape from the most recent driver start.
    fn stream_info(&self) -> AudioStreamInfo;
}

/// Settings of one endpoint. Changes take effect at the next driver start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    pub role: I2sRole,
    pub direction: Direction,
    pub slot_mode: SlotMode,
    pub slot_bit_width: SlotBitWidth,
    pub slot_mask: SlotMask,
    pub sample_rate: u32,
    pub clock_source: ClockSource,
    pub mclk_multiple: MclkMultiple,
    /// `din` for inputs, `dout` for outputs
    pub data_pin: Pin,
}

impl EndpointConfig {
    pub fn new(direction: Direction, slot_mask: SlotMask) -> Self {
        Self {
            role: I2sRole::Primary,
            direction,
            slot_mode: SlotMode::Mono,
            slot_bit_width: SlotBitWidth::Auto,
            slot_mask,
            sample_rate: 16000,
            clock_source: ClockSource::Default,
            mclk_multiple: MclkMultiple::X256,
            data_pin: None,
        }
    }

    pub fn stream_info(&self) -> AudioStreamInfo {
        let bits_per_sample = self.slot_bit_width.bits().unwrap_or(16);
        let channels = match self.slot_mode {
            SlotMode::Mono => 1,
            SlotMode::Stereo => 2,
        };
        AudioStreamInfo::new(bits_per_sample, channels, self.sample_rate)
    }

    pub fn channel_config(&self, port: PortId) -> ChannelConfig {
        ChannelConfig {
            port,
            role: self.role,
            direction: self.direction,
            dma_desc_num: DMA_DESC_NUM,
            dma_frame_num: DMA_FRAME_NUM,
            auto_clear: false,
        }
    }

    pub fn clock_config(&self) -> ClockConfig {
        ClockConfig {
            sample_rate_hz: self.sample_rate,
            clock_source: self.clock_source,
            mclk_multiple: self.mclk_multiple,
        }
    }

    pub fn slot_config(&self) -> SlotConfig {
        SlotConfig {
            data_bit_width: self.slot_bit_width.bits().unwrap_or(16),
            slot_bit_width: self.slot_bit_width,
            slot_mode: self.slot_mode,
            slot_mask: self.slot_mask,
        }
    }

    /// The bus pins with this endpoint's data pin routed.
    pub fn pin_config(&self, bus_pins: PinConfig) -> PinConfig {
        let mut pins = bus_pins;
        match self.direction {
            Direction::Input => pins.din = self.data_pin,
            Direction::Output => pins.dout = self.data_pin,
        }
        pins
    }
}

/// Hardware side of an endpoint: bus lock plus the channel it guards.
///
/// `start` either brings the channel fully up or leaves behind only what
/// `stop` can undo, and `stop` is safe to call in any state.
pub struct TdmDriver {
    bus: Arc<TdmBus>,
    hardware: Arc<dyn TdmHardware>,
    lease: Option<BusLease>,
    channel: Option<ChannelHandle>,
    enabled: bool,
    stream_info: AudioStreamInfo,
}

impl TdmDriver {
    pub fn new(bus: Arc<TdmBus>, hardware: Arc<dyn TdmHardware>, config: &EndpointConfig) -> Self {
        Self {
            bus,
            hardware,
            lease: None,
            channel: None,
            enabled: false,
            stream_info: config.stream_info(),
        }
    }

    pub fn bus(&self) -> &Arc<TdmBus> {
        &self.bus
    }

    pub fn hardware(&self) -> &Arc<dyn TdmHardware> {
        &self.hardware
    }

    pub fn channel(&self) -> Option<ChannelHandle> {
        self.channel
    }

    pub fn holds_bus(&self) -> bool {
        self.lease.is_some()
    }

    pub fn stream_info(&self) -> AudioStreamInfo {
        self.stream_info
    }

    /// Lock the bus and bring up a channel for `config`.
    ///
    /// Returns `false` without logging if another endpoint holds the bus; the
    /// caller should just try again later.
    pub fn start(&mut self, config: &EndpointConfig) -> bool {
        if self.lease.is_some() {
            return self.enabled;
        }
        let Some(lease) = self.bus.try_lock() else {
            return false; // Waiting for another endpoint to return the lock
        };
        self.lease = Some(lease);

        let Some(port) = self.bus.port() else {
            return false;
        };

        log::debug!("Allocating a new {:?} channel on {}", config.direction, port);
        let handle = match self.hardware.allocate_channel(&config.channel_config(port)) {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Error creating channel: {}", e);
                return false;
            }
        };
        self.channel = Some(handle);

        let clock = config.clock_config();
        let slots = config.slot_config();
        let pins = config.pin_config(self.bus.pin_config());
        log::debug!(
            "TDM channel config: rate={}Hz, width={:?}, mode={:?}, mask={}, pins={:?}",
            clock.sample_rate_hz,
            slots.slot_bit_width,
            slots.slot_mode,
            slots.slot_mask,
            pins,
        );

        if let Err(e) = self.hardware.configure(handle, &clock, &slots, &pins) {
            log::error!("Error initializing channel: {}", e);
            return false;
        }

        if let Err(e) = self.hardware.enable(handle) {
            log::error!("Enabling failed: {}", e);
            return false;
        }

        self.enabled = true;
        self.stream_info = config.stream_info();
        true
    }

    /// Tear down whatever `start` managed to set up and unlock the bus.
    ///
    /// Errors are logged and otherwise ignored so a half-started driver still
    /// gives the bus back.
    pub fn stop(&mut self) {
        let enabled = std::mem::take(&mut self.enabled);
        if let Some(handle) = self.channel.take() {
            if enabled {
                if let Err(e) = self.hardware.disable(handle) {
                    log::warn!("Error stopping: {}", e);
                }
            }
            if let Err(e) = self.hardware.release(handle) {
                log::warn!("Error deleting channel: {}", e);
            }
        }
        if let Some(lease) = self.lease.take() {
            lease.unlock();
        }
    }
}

impl Drop for TdmDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
