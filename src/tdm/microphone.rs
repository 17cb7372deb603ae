//! TDM microphone endpoint.
//!
//! Listeners register through [`MicrophoneHandle::start`] / [`MicrophoneHandle::stop`]
//! from any thread. The owner calls [`TdmMicrophone::tick`] periodically; each
//! tick moves the state machine one step:
//!
//! ```text
//! STOPPED --listener--> STARTING --worker running--> RUNNING
//!    ^                                                  |
//!    +---- worker stopped ---- STOPPING <--no listeners-+
//! ```
//!
//! While running, a dedicated thread reads 16 ms chunks from the hardware,
//! optionally removes DC offset, and hands each chunk to the data callbacks.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

use super::bus::TdmBus;
use super::dc_filter::DcOffsetFilter;
use super::endpoint::{AudioEndpoint, EndpointConfig, TdmDriver};
use super::hardware::{ChannelHandle, Direction, HwError, TdmHardware};
use super::listeners::ListenerCount;
use super::status::Status;
use super::stream_info::AudioStreamInfo;

/// Length of audio handed to callbacks per read.
pub const READ_DURATION_MS: u32 = 16;

const READ_DURATION: Duration = Duration::from_millis(READ_DURATION_MS as u64);

pub type DataCallback = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl MicrophoneState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MicrophoneOptions {
    pub correct_dc_offset: bool,
    /// How long to wait before retrying after a failed start
    pub start_retry: Duration,
}

impl Default for MicrophoneOptions {
    fn default() -> Self {
        Self {
            correct_dc_offset: false,
            start_retry: Duration::from_secs(1),
        }
    }
}

/// Progress reports from the streaming worker to the tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerEvent {
    Starting,
    Running,
    Stopped,
}

struct Shared {
    listeners: ListenerCount,
    status: Status,
    state: AtomicU8,
    callbacks: Mutex<Vec<DataCallback>>,
}

impl Shared {
    fn callbacks(&self) -> MutexGuard<'_, Vec<DataCallback>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MicrophoneState {
        MicrophoneState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Hand `data` to every callback in registration order.
    ///
    /// The list is taken out of the mutex for the duration of the calls, so a
    /// callback may register further callbacks; those join the end of the
    /// list and first see the next chunk.
    fn dispatch(&self, data: &[u8]) {
        let mut active = std::mem::take(&mut *self.callbacks());
        for callback in active.iter_mut() {
            callback(data);
        }
        let mut callbacks = self.callbacks();
        active.append(&mut callbacks);
        *callbacks = active;
    }
}

/// Thread-safe access to a [`TdmMicrophone`] for listeners and data sinks.
#[derive(Clone)]
pub struct MicrophoneHandle {
    shared: Arc<Shared>,
}

impl MicrophoneHandle {
    /// Register a listener. Ignored when the microphone has failed or
    /// already has the maximum number of listeners.
    pub fn start(&self) {
        if self.shared.status.is_failed() {
            return;
        }
        if !self.shared.listeners.acquire() {
            log::debug!(
                "Listener limit ({}) reached, registration ignored",
                self.shared.listeners.max()
            );
        }
    }

    /// Deregister a listener.
    pub fn stop(&self) {
        if self.shared.status.is_failed() {
            return;
        }
        self.shared.listeners.release();
    }

    /// Add a sink for captured audio. Callbacks run on the worker thread in
    /// the order they were added.
    pub fn add_data_callback<F>(&self, callback: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.shared.callbacks().push(Box::new(callback));
    }

    pub fn state(&self) -> MicrophoneState {
        self.shared.state()
    }

    pub fn is_failed(&self) -> bool {
        self.shared.status.is_failed()
    }

    pub fn has_warning(&self) -> bool {
        self.shared.status.has_warning()
    }

    pub fn listeners(&self) -> usize {
        self.shared.listeners.active()
    }
}

struct Worker {
    thread: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    events: UnboundedReceiver<WorkerEvent>,
}

pub struct TdmMicrophone {
    config: EndpointConfig,
    options: MicrophoneOptions,
    driver: TdmDriver,
    shared: Arc<Shared>,
    worker: Option<Worker>,
    state: MicrophoneState,
    #[cfg(test)]
    fail_next_spawn: bool,
}

impl TdmMicrophone {
    pub fn new(
        bus: Arc<TdmBus>,
        hardware: Arc<dyn TdmHardware>,
        config: EndpointConfig,
        options: MicrophoneOptions,
    ) -> Self {
        let driver = TdmDriver::new(bus, hardware, &config);
        Self {
            config,
            options,
            driver,
            shared: Arc::new(Shared {
                listeners: ListenerCount::default(),
                status: Status::new(),
                state: AtomicU8::new(MicrophoneState::Stopped as u8),
                callbacks: Mutex::new(Vec::new()),
            }),
            worker: None,
            state: MicrophoneState::Stopped,
            #[cfg(test)]
            fail_next_spawn: false,
        }
    }

    /// Check the resources the microphone depends on. A microphone on a bus
    /// without a port is marked failed and will never start.
    pub fn setup(&mut self) {
        let bus = self.driver.bus();
        if bus.is_failed() {
            log::error!("TDM bus has no port, microphone disabled");
            self.shared.status.mark_failed();
            return;
        }
        if self.config.slot_mask.bits() & !bus.slot_mask().bits() != 0 {
            log::warn!(
                "Microphone slots {} are not all enabled on the bus ({})",
                self.config.slot_mask,
                bus.slot_mask()
            );
        }
    }

    pub fn dump_config(&self) {
        let info = self.config.stream_info();
        log::info!(
            "Microphone:\n  Direction: {:?}\n  Pin: {:?}\n  Sample rate: {}\n  Channels: {}\n  Bits: {} ({:?} slots)\n  MCLK: {}x\n  Mode: {:?}\n  Slots: {}\n  DC offset correction: {}",
            self.direction(),
            self.config.data_pin,
            info.sample_rate(),
            info.channels(),
            info.bits_per_sample(),
            self.config.slot_bit_width,
            self.config.mclk_multiple.multiple(),
            self.config.slot_mode,
            self.config.slot_mask,
            if self.options.correct_dc_offset { "YES" } else { "NO" },
        );
    }

    pub fn handle(&self) -> MicrophoneHandle {
        MicrophoneHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> MicrophoneState {
        self.state
    }

    pub fn is_failed(&self) -> bool {
        self.shared.status.is_failed()
    }

    /// Settings changed here apply from the next driver start.
    #[cfg(test)]
    pub fn config_mut(&mut self) -> &mut EndpointConfig {
        &mut self.config
    }

    pub fn holds_bus(&self) -> bool {
        self.driver.holds_bus()
    }

    fn set_state(&mut self, state: MicrophoneState) {
        if self.state != state {
            log::trace!("Microphone state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.shared.state.store(state as u8, Ordering::Release);
    }

    /// Advance the lifecycle by one step. Must not be called concurrently.
    pub fn tick(&mut self) {
        self.handle_worker_events();

        let idle = self.shared.listeners.is_idle();

        // Start the microphone if anyone is listening
        if !idle && self.state == MicrophoneState::Stopped {
            self.set_state(MicrophoneState::Starting);
        }

        // Stop the microphone once every listener is gone
        if idle && self.state == MicrophoneState::Running {
            self.set_state(MicrophoneState::Stopping);
        }

        match self.state {
            MicrophoneState::Starting => {
                if idle && self.worker.is_none() {
                    // Everyone left before the hardware came up
                    self.driver.stop();
                    self.set_state(MicrophoneState::Stopped);
                    return;
                }
                self.try_start();
            }
            MicrophoneState::Running => {}
            MicrophoneState::Stopping => {
                if let Some(worker) = &self.worker {
                    worker.stop.store(true, Ordering::Release);
                }
            }
            MicrophoneState::Stopped => {}
        }
    }

    fn handle_worker_events(&mut self) {
        loop {
            let Some(worker) = self.worker.as_mut() else {
                return;
            };
            match worker.events.try_recv() {
                Ok(WorkerEvent::Starting) => {
                    log::trace!("Task started, allocating buffer");
                }
                Ok(WorkerEvent::Running) => {
                    log::trace!("Task is running and reading data");
                    self.set_state(MicrophoneState::Running);
                }
                Ok(WorkerEvent::Stopped) => {
                    log::trace!("Task finished, freeing resources and stopping driver");
                    self.teardown();
                    return;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    log::error!("Microphone task exited unexpectedly");
                    self.teardown();
                    return;
                }
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.thread.join().is_err() {
                log::error!("Microphone task panicked");
            }
        }
        self.driver.stop();
        self.shared.status.clear_error();
        self.set_state(MicrophoneState::Stopped);
    }

    fn try_start(&mut self) {
        let status = &self.shared.status;
        if status.is_failed() || status.has_error() {
            return;
        }
        if self.worker.is_some() {
            return; // Waiting for the task to report that it is running
        }

        if !self.driver.start(&self.config) {
            if self.driver.holds_bus() {
                if status.set_warning() {
                    log::error!(
                        "Driver failed to start; retrying in {} ms",
                        self.options.start_retry.as_millis()
                    );
                }
                status.set_momentary_error("driver_fail", self.options.start_retry);
            }
            // Frees whatever was partially started, including the bus lock
            self.driver.stop();
            return;
        }

        if let Err(e) = self.spawn_worker() {
            log::error!("{:#}; retrying in {} ms", e, self.options.start_retry.as_millis());
            self.shared
                .status
                .set_momentary_error("task_fail", self.options.start_retry);
            // Return the bus lock; the driver is reloaded on the next attempt
            self.driver.stop();
        }
    }

    fn spawn_worker(&mut self) -> Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_spawn) {
            anyhow::bail!("Task failed to start");
        }
        let channel = self
            .driver
            .channel()
            .context("Driver reported started without a channel")?;
        let port = self
            .driver
            .bus()
            .port()
            .map_or_else(|| "?".to_string(), |p| p.index().to_string());

        let stop = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = StreamTask {
            hardware: self.driver.hardware().clone(),
            channel,
            info: self.driver.stream_info(),
            correct_dc_offset: self.options.correct_dc_offset,
            shared: self.shared.clone(),
            stop: stop.clone(),
            events: events_tx,
        };

        let thread = thread::Builder::new()
            .name(format!("tdm-mic-{}", port))
            .spawn(move || task.run())
            .context("Task failed to start")?;

        self.worker = Some(Worker {
            thread,
            stop,
            events: events_rx,
        });
        Ok(())
    }
}

impl AudioEndpoint for TdmMicrophone {
    fn direction(&self) -> Direction {
        Direction::Input
    }

    fn open(&self) {
        self.handle().start();
    }

    fn close(&self) {
        self.handle().stop();
    }

    fn stream_info(&self) -> AudioStreamInfo {
        self.driver.stream_info()
    }
}

impl Drop for TdmMicrophone {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            let _ = worker.thread.join();
        }
        self.driver.stop();
    }
}

/// Everything the streaming thread owns for one session.
struct StreamTask {
    hardware: Arc<dyn TdmHardware>,
    channel: ChannelHandle,
    info: AudioStreamInfo,
    correct_dc_offset: bool,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    events: UnboundedSender<WorkerEvent>,
}

impl StreamTask {
    fn run(self) {
        let _ = self.events.send(WorkerEvent::Starting);

        {
            let bytes_to_read = self.info.ms_to_bytes(READ_DURATION_MS);
            let mut samples: Vec<u8> = Vec::with_capacity(bytes_to_read);
            let mut filter = DcOffsetFilter::new();

            let _ = self.events.send(WorkerEvent::Running);

            while !self.stop.load(Ordering::Acquire) {
                if self.shared.callbacks().is_empty() {
                    thread::sleep(READ_DURATION);
                    continue;
                }

                samples.resize(bytes_to_read, 0);
                let bytes_read = read_chunk(
                    self.hardware.as_ref(),
                    self.channel,
                    &self.shared.status,
                    &mut samples,
                    2 * READ_DURATION,
                );
                samples.truncate(bytes_read);
                if samples.is_empty() {
                    continue;
                }

                if self.correct_dc_offset {
                    filter.process_bytes(&mut samples, self.info.bytes_per_sample());
                }
                self.shared.dispatch(&samples);
            }
        }

        let _ = self.events.send(WorkerEvent::Stopped);
    }
}

/// One bounded read from the hardware.
///
/// Returns the number of bytes read; faults yield zero and raise the warning
/// flag, which a later successful read clears. An empty poll (zero timeout) is
/// not a fault.
pub(crate) fn read_chunk(
    hardware: &dyn TdmHardware,
    channel: ChannelHandle,
    status: &Status,
    buf: &mut [u8],
    timeout: Duration,
) -> usize {
    match hardware.read(channel, buf, timeout) {
        Err(HwError::Timeout) if timeout.is_zero() => 0,
        Err(e) => {
            // Avoid spamming the logs with the error message if it is repeated
            if status.set_warning() {
                log::warn!("Read error: {}", e);
            }
            0
        }
        Ok(0) if !timeout.is_zero() => {
            if status.set_warning() {
                log::warn!("No audio data within {} ms", timeout.as_millis());
            }
            0
        }
        Ok(bytes_read) => {
            status.clear_warning();
            bytes_read
        }
    }
}
