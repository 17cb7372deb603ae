//! In-process TDM peripheral.
//!
//! Produces a sine tone riding on a DC bias so the offset filter has something
//! to remove, paced in real time like a DMA-fed channel. Faults can be injected
//! for exercising the retry and teardown paths.

use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::hardware::{
    ChannelConfig, ChannelHandle, ClockConfig, HwError, PinConfig, SlotConfig, SlotMode,
    TdmHardware,
};
#[cfg(test)]
use super::port::PortId;
use super::stream_info::pack_sample;

/// Driver calls recorded by [`SimulatedTdm`], reads excluded.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwCall {
    Allocate(PortId),
    Configure(ChannelHandle),
    Enable(ChannelHandle),
    Disable(ChannelHandle),
    Release(ChannelHandle),
}

#[derive(Debug)]
struct SimChannel {
    config: ChannelConfig,
    clock: Option<ClockConfig>,
    slots: Option<SlotConfig>,
    #[cfg(test)]
    pins: Option<PinConfig>,
    enabled: bool,
    frames: u64,
}

#[derive(Debug)]
struct SimState {
    next_handle: u32,
    channels: HashMap<ChannelHandle, SimChannel>,
    #[cfg(test)]
    calls: Vec<HwCall>,
    #[cfg(test)]
    reads: usize,
    fail_allocations: u32,
    fail_configures: u32,
    fail_reads: u32,
    fail_teardown: bool,
    starved: bool,
    dc_bias: i32,
    amplitude: i32,
    tone_hz: f64,
}

#[derive(Debug)]
pub struct SimulatedTdm {
    state: Mutex<SimState>,
}

impl SimulatedTdm {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_handle: 1,
                channels: HashMap::new(),
                #[cfg(test)]
                calls: Vec::new(),
                #[cfg(test)]
                reads: 0,
                fail_allocations: 0,
                fail_configures: 0,
                fail_reads: 0,
                fail_teardown: false,
                starved: false,
                dc_bias: 2000,
                amplitude: 6000,
                tone_hz: 440.0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Signal shaping, fault injection and inspection hooks for tests.
#[cfg(test)]
impl SimulatedTdm {
    /// Shape of the generated signal, in sample units of the channel width.
    pub fn set_signal(&self, dc_bias: i32, amplitude: i32, tone_hz: f64) {
        let mut state = self.state();
        state.dc_bias = dc_bias;
        state.amplitude = amplitude;
        state.tone_hz = tone_hz;
    }

    pub fn fail_next_allocations(&self, count: u32) {
        self.state().fail_allocations = count;
    }

    pub fn fail_next_configures(&self, count: u32) {
        self.state().fail_configures = count;
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.state().fail_reads = count;
    }

    /// Make `disable` and `release` report errors (the channel is still freed).
    pub fn set_fail_teardown(&self, fail: bool) {
        self.state().fail_teardown = fail;
    }

    /// While starved, reads wait out their timeout and return no data.
    pub fn set_starved(&self, starved: bool) {
        self.state().starved = starved;
    }

    pub fn calls(&self) -> Vec<HwCall> {
        self.state().calls.clone()
    }

    pub fn reads(&self) -> usize {
        self.state().reads
    }

    pub fn live_channels(&self) -> usize {
        self.state().channels.len()
    }

    pub fn enabled_channels(&self) -> usize {
        self.state().channels.values().filter(|c| c.enabled).count()
    }

    /// Configuration applied to a live channel.
    pub fn channel_setup(
        &self,
        handle: ChannelHandle,
    ) -> Option<(ChannelConfig, Option<ClockConfig>, Option<SlotConfig>, Option<PinConfig>)> {
        self.state()
            .channels
            .get(&handle)
            .map(|c| (c.config, c.clock, c.slots, c.pins))
    }
}

impl Default for SimulatedTdm {
    fn default() -> Self {
        Self::new()
    }
}

impl TdmHardware for SimulatedTdm {
    fn allocate_channel(&self, config: &ChannelConfig) -> Result<ChannelHandle, HwError> {
        let mut state = self.state();
        #[cfg(test)]
        state.calls.push(HwCall::Allocate(config.port));
        if state.fail_allocations > 0 {
            state.fail_allocations -= 1;
            return Err(HwError::Driver("injected allocation failure".into()));
        }
        if state.channels.values().any(|c| c.config.port == config.port) {
            return Err(HwError::NoResource);
        }

        let handle = ChannelHandle(state.next_handle);
        state.next_handle += 1;
        log::debug!(
            "Simulated {:?} channel {:?} on {} ({:?}, {}x{} DMA frames, auto_clear={})",
            config.direction,
            handle,
            config.port,
            config.role,
            config.dma_desc_num,
            config.dma_frame_num,
            config.auto_clear
        );
        state.channels.insert(
            handle,
            SimChannel {
                config: *config,
                clock: None,
                slots: None,
                #[cfg(test)]
                pins: None,
                enabled: false,
                frames: 0,
            },
        );
        Ok(handle)
    }

    fn configure(
        &self,
        handle: ChannelHandle,
        clock: &ClockConfig,
        slots: &SlotConfig,
        pins: &PinConfig,
    ) -> Result<(), HwError> {
        let mut state = self.state();
        #[cfg(test)]
        state.calls.push(HwCall::Configure(handle));
        if state.fail_configures > 0 {
            state.fail_configures -= 1;
            return Err(HwError::Driver("injected configure failure".into()));
        }
        let channel = state.channels.get_mut(&handle).ok_or(HwError::NotFound)?;
        if channel.enabled || slots.slot_mask.is_empty() {
            return Err(HwError::InvalidState);
        }
        log::debug!(
            "Simulated channel {:?}: {} Hz ({:?}, mclk {}x), {} bit in {:?} slots, {:?} {}, din={:?} dout={:?}",
            handle,
            clock.sample_rate_hz,
            clock.clock_source,
            clock.mclk_multiple.multiple(),
            slots.data_bit_width,
            slots.slot_bit_width,
            slots.slot_mode,
            slots.slot_mask,
            pins.din,
            pins.dout
        );
        channel.clock = Some(*clock);
        channel.slots = Some(*slots);
        #[cfg(test)]
        {
            channel.pins = Some(*pins);
        }
        Ok(())
    }

    fn enable(&self, handle: ChannelHandle) -> Result<(), HwError> {
        let mut state = self.state();
        #[cfg(test)]
        state.calls.push(HwCall::Enable(handle));
        let channel = state.channels.get_mut(&handle).ok_or(HwError::NotFound)?;
        if channel.clock.is_none() || channel.enabled {
            return Err(HwError::InvalidState);
        }
        channel.enabled = true;
        Ok(())
    }

    fn disable(&self, handle: ChannelHandle) -> Result<(), HwError> {
        let mut state = self.state();
        #[cfg(test)]
        state.calls.push(HwCall::Disable(handle));
        let fail = state.fail_teardown;
        let channel = state.channels.get_mut(&handle).ok_or(HwError::NotFound)?;
        if !channel.enabled {
            return Err(HwError::InvalidState);
        }
        channel.enabled = false;
        if fail {
            return Err(HwError::Driver("injected disable failure".into()));
        }
        Ok(())
    }

    fn release(&self, handle: ChannelHandle) -> Result<(), HwError> {
        let mut state = self.state();
        #[cfg(test)]
        state.calls.push(HwCall::Release(handle));
        let channel = state.channels.remove(&handle).ok_or(HwError::NotFound)?;
        if channel.enabled {
            // Freed regardless, but a real driver would complain
            return Err(HwError::InvalidState);
        }
        if state.fail_teardown {
            return Err(HwError::Driver("injected release failure".into()));
        }
        Ok(())
    }

    fn read(
        &self,
        handle: ChannelHandle,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, HwError> {
        let (len, pace) = {
            let mut state = self.state();
            #[cfg(test)]
            {
                state.reads += 1;
            }

            if state.fail_reads > 0 {
                state.fail_reads -= 1;
                return Err(HwError::Driver("injected read failure".into()));
            }
            let starved = state.starved;
            let (dc_bias, amplitude, tone_hz) = (state.dc_bias, state.amplitude, state.tone_hz);

            let channel = state.channels.get(&handle).ok_or(HwError::NotFound)?;
            let (Some(clock), Some(slots), true) = (channel.clock, channel.slots, channel.enabled)
            else {
                return Err(HwError::InvalidState);
            };

            if starved {
                drop(state);
                thread::sleep(timeout);
                return Err(HwError::Timeout);
            }
            let channel = state.channels.get_mut(&handle).ok_or(HwError::NotFound)?;

            let width = (slots.data_bit_width as usize).div_ceil(8);
            let channels = match slots.slot_mode {
                SlotMode::Mono => 1,
                SlotMode::Stereo => 2,
            };
            let frames = buf.len() / (width * channels);
            let rate = clock.sample_rate_hz.max(1) as f64;
            let max = if slots.data_bit_width >= 32 {
                i32::MAX as i64
            } else {
                (1i64 << (slots.data_bit_width - 1)) - 1
            };

            for (i, frame) in buf.chunks_exact_mut(width * channels).enumerate() {
                let t = (channel.frames + i as u64) as f64 / rate;
                let value = dc_bias as f64 + amplitude as f64 * (TAU * tone_hz * t).sin();
                let value = (value as i64).clamp(-max - 1, max) as i32;
                for sample in frame.chunks_exact_mut(width) {
                    pack_sample(value, sample);
                }
            }
            channel.frames += frames as u64;

            let pace = Duration::from_secs_f64(frames as f64 / rate).min(timeout);
            (frames * width * channels, pace)
        };

        // DMA fills at the sample clock
        thread::sleep(pace);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tdm::hardware::{ClockSource, Direction, I2sRole, MclkMultiple, SlotBitWidth};
    use crate::tdm::port::PortAllocator;
    use crate::tdm::slot_mask::compute_slot_mask;
    use crate::tdm::stream_info::unpack_sample;

    fn open(sim: &SimulatedTdm, port: PortId) -> ChannelHandle {
        let handle = sim
            .allocate_channel(&ChannelConfig {
                port,
                role: I2sRole::Primary,
                direction: Direction::Input,
                dma_desc_num: 4,
                dma_frame_num: 256,
                auto_clear: false,
            })
            .unwrap();
        sim.configure(
            handle,
            &ClockConfig {
                sample_rate_hz: 16000,
                clock_source: ClockSource::Default,
                mclk_multiple: MclkMultiple::X256,
            },
            &SlotConfig {
                data_bit_width: 16,
                slot_bit_width: SlotBitWidth::Auto,
                slot_mode: SlotMode::Mono,
                slot_mask: compute_slot_mask(&[0]).unwrap(),
            },
            &PinConfig::default(),
        )
        .unwrap();
        handle
    }

    #[test]
    fn read_requires_enabled_channel() {
        let sim = SimulatedTdm::new();
        let port = PortAllocator::new(1).allocate_port().unwrap();
        let handle = open(&sim, port);
        let mut buf = [0u8; 64];
        assert_eq!(
            sim.read(handle, &mut buf, Duration::from_millis(5)),
            Err(HwError::InvalidState)
        );
        sim.enable(handle).unwrap();
        assert_eq!(sim.read(handle, &mut buf, Duration::from_millis(5)), Ok(64));
    }

    #[test]
    fn generated_signal_carries_the_bias() {
        let sim = SimulatedTdm::new();
        sim.set_signal(1234, 0, 440.0);
        let port = PortAllocator::new(1).allocate_port().unwrap();
        let handle = open(&sim, port);
        sim.enable(handle).unwrap();

        let mut buf = [0u8; 32];
        sim.read(handle, &mut buf, Duration::from_millis(5)).unwrap();
        assert!(buf.chunks_exact(2).all(|s| unpack_sample(s) == 1234));
    }

    #[test]
    fn one_channel_per_port() {
        let sim = SimulatedTdm::new();
        let port = PortAllocator::new(1).allocate_port().unwrap();
        let _first = open(&sim, port);
        let second = sim.allocate_channel(&ChannelConfig {
            port,
            role: I2sRole::Primary,
            direction: Direction::Input,
            dma_desc_num: 4,
            dma_frame_num: 256,
            auto_clear: false,
        });
        assert_eq!(second, Err(HwError::NoResource));
    }

    #[test]
    fn starved_read_times_out() {
        let sim = SimulatedTdm::new();
        let port = PortAllocator::new(1).allocate_port().unwrap();
        let handle = open(&sim, port);
        sim.enable(handle).unwrap();
        sim.set_starved(true);
        let mut buf = [0u8; 32];
        assert_eq!(sim.read(handle, &mut buf, Duration::ZERO), Err(HwError::Timeout));
    }

    #[test]
    fn teardown_is_recorded() {
        let sim = SimulatedTdm::new();
        let port = PortAllocator::new(1).allocate_port().unwrap();
        let handle = open(&sim, port);
        sim.enable(handle).unwrap();
        sim.disable(handle).unwrap();
        sim.release(handle).unwrap();
        assert_eq!(sim.live_channels(), 0);
        assert_eq!(
            sim.calls(),
            vec![
                HwCall::Allocate(port),
                HwCall::Configure(handle),
                HwCall::Enable(handle),
                HwCall::Disable(handle),
                HwCall::Release(handle),
            ]
        );
    }
}
