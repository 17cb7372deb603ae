//! ALSA PCM device as a TDM capture backend.
//!
//! Lets the microphone stack run against a sound card on a Linux host. Pins and
//! clock sources are fixed by the card, so only rate, width and channel count
//! from the requested configuration are applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::ValueOr;

use super::hardware::{
    ChannelConfig, ChannelHandle, ClockConfig, Direction, HwError, PinConfig, SlotConfig,
    SlotMode, TdmHardware,
};

struct AlsaChannel {
    pcm: PCM,
    dir_name: &'static str,
    frame_bytes: usize,
    configured: bool,
    enabled: bool,
}

/// Each channel opens its own PCM handle on `device`.
pub struct AlsaTdm {
    device: String,
    next_handle: AtomicU32,
    channels: Mutex<HashMap<ChannelHandle, Arc<Mutex<AlsaChannel>>>>,
}

fn driver_error(context: &str, e: alsa::Error) -> HwError {
    HwError::Driver(format!("{}: {}", context, e))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AlsaTdm {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            next_handle: AtomicU32::new(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, handle: ChannelHandle) -> Result<Arc<Mutex<AlsaChannel>>, HwError> {
        lock(&self.channels)
            .get(&handle)
            .cloned()
            .ok_or(HwError::NotFound)
    }
}

impl TdmHardware for AlsaTdm {
    fn allocate_channel(&self, config: &ChannelConfig) -> Result<ChannelHandle, HwError> {
        let (direction, dir_name) = match config.direction {
            Direction::Input => (alsa::Direction::Capture, "Capture"),
            Direction::Output => (alsa::Direction::Playback, "Playback"),
        };
        let pcm = PCM::new(&self.device, direction, false).map_err(|e| {
            driver_error(
                &format!("Failed to open PCM device '{}' for {}", self.device, dir_name),
                e,
            )
        })?;

        let handle = ChannelHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        lock(&self.channels).insert(
            handle,
            Arc::new(Mutex::new(AlsaChannel {
                pcm,
                dir_name,
                frame_bytes: 0,
                configured: false,
                enabled: false,
            })),
        );
        log::debug!("ALSA channel {:?} opened on '{}' for {}", handle, self.device, config.port);
        Ok(handle)
    }

    fn configure(
        &self,
        handle: ChannelHandle,
        clock: &ClockConfig,
        slots: &SlotConfig,
        _pins: &PinConfig,
    ) -> Result<(), HwError> {
        let channel = self.channel(handle)?;
        let mut channel = lock(&channel);
        if channel.enabled {
            return Err(HwError::InvalidState);
        }

        let (format, sample_bytes) = match slots.data_bit_width {
            8 => (Format::S8, 1),
            16 => (Format::S16LE, 2),
            24 => (Format::S243LE, 3),
            32 => (Format::S32LE, 4),
            other => return Err(HwError::Driver(format!("Unsupported sample width {}", other))),
        };
        let channels: u32 = match slots.slot_mode {
            SlotMode::Mono => 1,
            SlotMode::Stereo => 2,
        };

        {
            let hwp = HwParams::any(&channel.pcm)
                .map_err(|e| driver_error("Failed to initialize HwParams", e))?;
            hwp.set_access(Access::RWInterleaved)
                .map_err(|e| driver_error("set_access", e))?;
            hwp.set_format(format).map_err(|e| driver_error("set_format", e))?;
            hwp.set_channels(channels)
                .map_err(|e| driver_error("set_channels", e))?;
            hwp.set_rate_near(clock.sample_rate_hz, ValueOr::Nearest)
                .map_err(|e| driver_error("set_rate_near", e))?;
            channel
                .pcm
                .hw_params(&hwp)
                .map_err(|e| driver_error("hw_params", e))?;
        }

        let actual_rate = channel
            .pcm
            .hw_params_current()
            .and_then(|hwp| hwp.get_rate())
            .map_err(|e| driver_error("get_rate", e))?;
        if actual_rate != clock.sample_rate_hz {
            log::warn!(
                "ALSA negotiated {} Hz instead of {} Hz",
                actual_rate,
                clock.sample_rate_hz
            );
        }

        log::info!(
            "ALSA {}: device={}, rate={}, channels={}, format={:?}",
            channel.dir_name,
            self.device,
            actual_rate,
            channels,
            format,
        );

        channel.frame_bytes = sample_bytes * channels as usize;
        channel.configured = true;
        Ok(())
    }

    fn enable(&self, handle: ChannelHandle) -> Result<(), HwError> {
        let channel = self.channel(handle)?;
        let mut channel = lock(&channel);
        if !channel.configured || channel.enabled {
            return Err(HwError::InvalidState);
        }
        channel.pcm.start().map_err(|e| driver_error("start", e))?;
        channel.enabled = true;
        Ok(())
    }

    fn disable(&self, handle: ChannelHandle) -> Result<(), HwError> {
        let channel = self.channel(handle)?;
        let mut channel = lock(&channel);
        if !channel.enabled {
            return Err(HwError::InvalidState);
        }
        channel.enabled = false;
        channel.pcm.drop().map_err(|e| driver_error("drop", e))
    }

    fn release(&self, handle: ChannelHandle) -> Result<(), HwError> {
        let channel = lock(&self.channels)
            .remove(&handle)
            .ok_or(HwError::NotFound)?;
        if lock(&channel).enabled {
            return Err(HwError::InvalidState);
        }
        Ok(())
    }

    fn read(
        &self,
        handle: ChannelHandle,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, HwError> {
        let channel = self.channel(handle)?;
        let channel = lock(&channel);
        if !channel.enabled || channel.frame_bytes == 0 {
            return Err(HwError::InvalidState);
        }

        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        match channel.pcm.wait(Some(timeout_ms)) {
            Ok(true) => {}
            Ok(false) => return Err(HwError::Timeout),
            Err(e) => return Err(driver_error("wait", e)),
        }

        let whole_frames = buf.len() / channel.frame_bytes * channel.frame_bytes;
        let io = channel.pcm.io_bytes();
        match io.readi(&mut buf[..whole_frames]) {
            Ok(frames) => Ok(frames * channel.frame_bytes),
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = channel.pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                }
                Err(driver_error("readi", e))
            }
        }
    }
}
