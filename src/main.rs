mod config;
mod tdm;

use std::sync::Arc;

use anyhow::{Result, bail};
use config::{Backend, Config};
use tdm::{
    AudioEndpoint, AudioStreamInfo, MicrophoneOptions, MicrophoneState, PortAllocator,
    SimulatedTdm, TdmBus, TdmHardware, TdmMicrophone, compute_slot_mask, unpack_sample,
};
use tokio::signal;
use tokio::time::{self, Instant};

const LEVEL_REPORT_MS: u32 = 1000;

/// 电平表：每秒输出一次 RMS 和峰值
struct LevelMeter {
    info: AudioStreamInfo,
    elapsed_ms: u32,
    samples: usize,
    sum_squares: f64,
    peak: i32,
}

impl LevelMeter {
    fn new(info: AudioStreamInfo) -> Self {
        Self {
            info,
            elapsed_ms: 0,
            samples: 0,
            sum_squares: 0.0,
            peak: 0,
        }
    }

    fn feed(&mut self, data: &[u8]) {
        let width = self.info.bytes_per_sample();
        if width == 0 {
            return;
        }
        for chunk in data.chunks_exact(width) {
            let sample = unpack_sample(chunk);
            self.sum_squares += f64::from(sample) * f64::from(sample);
            self.peak = self.peak.max(sample.saturating_abs());
        }
        self.samples += self.info.bytes_to_samples(data.len());
        self.elapsed_ms += self.info.bytes_to_ms(data.len());

        if self.elapsed_ms >= LEVEL_REPORT_MS && self.samples > 0 {
            let rms = (self.sum_squares / self.samples as f64).sqrt();
            log::info!("Mic level: rms={:.1}, peak={}", rms, self.peak);
            self.elapsed_ms = 0;
            self.samples = 0;
            self.sum_squares = 0.0;
            self.peak = 0;
        }
    }
}

fn create_hardware(config: &Config) -> Result<Arc<dyn TdmHardware>> {
    match config.backend {
        Backend::Sim => Ok(Arc::new(SimulatedTdm::new())),
        #[cfg(feature = "alsa")]
        Backend::Alsa => Ok(Arc::new(tdm::AlsaTdm::new(config.alsa_device))),
        #[cfg(not(feature = "alsa"))]
        Backend::Alsa => bail!(
            "backend 'alsa' requested for device '{}' but the alsa feature is not enabled",
            config.alsa_device
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new()?;
    log::info!("{} v{} starting", config.app_name, config.app_version);

    // 创建总线
    let ports = PortAllocator::new(config.bus_max_ports);
    let pins = config.pin_config();
    let bus = TdmBus::new(
        &ports,
        pins.mclk,
        pins.bclk,
        pins.ws,
        compute_slot_mask(&config.bus_slots)?,
    );
    bus.dump_config();
    log::debug!("TDM ports in use: {}/{}", ports.allocated(), ports.max_ports());

    // 创建麦克风
    let hardware = create_hardware(&config)?;
    let mut mic = TdmMicrophone::new(
        bus.clone(),
        hardware,
        config.endpoint_config()?,
        MicrophoneOptions {
            correct_dc_offset: config.mic_correct_dc_offset,
            start_retry: config.start_retry,
        },
    );
    mic.setup();
    mic.dump_config();
    if mic.is_failed() {
        bail!("No free TDM port for the bus");
    }

    let mut meter = LevelMeter::new(mic.stream_info());
    let handle = mic.handle();
    handle.add_data_callback(move |data| meter.feed(data));

    // 注册监听者，下一次 tick 启动采集
    mic.open();

    let deadline = config.run_for.map(|d| Instant::now() + d);
    let mut ticker = time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let mut last_state = handle.state();
    let mut last_warning = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                mic.tick();
                let state = handle.state();
                if state != last_state {
                    log::info!("Microphone {:?} -> {:?}", last_state, state);
                    last_state = state;
                }
                let warning = handle.has_warning();
                if warning != last_warning {
                    if warning {
                        log::warn!("Microphone degraded: no audio from the bus");
                    } else {
                        log::info!("Microphone recovered");
                    }
                    last_warning = warning;
                }
                if handle.is_failed() {
                    bail!("Microphone failed");
                }
            }
            _ = signal::ctrl_c() => {
                log::info!("Ctrl+C received, stopping");
                break;
            }
            _ = async {
                match deadline {
                    Some(deadline) => time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                log::info!("Run time elapsed, stopping");
                break;
            }
        }
    }

    // 注销监听者并等待采集线程退出
    mic.close();
    while mic.state() != MicrophoneState::Stopped {
        ticker.tick().await;
        mic.tick();
    }
    if mic.holds_bus() || bus.is_locked() {
        log::warn!("Microphone stopped but the TDM bus is still locked");
    } else {
        log::info!(
            "Microphone stopped, bus released ({} listeners left)",
            handle.listeners()
        );
    }
    Ok(())
}
