use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::IntoDeserializer;
use serde::de::value::{Error as ValueError, StrDeserializer};

use crate::tdm::{
    ClockSource, Direction, EndpointConfig, I2sRole, MclkMultiple, PinConfig, SlotBitWidth,
    SlotMode, compute_slot_mask,
};

/// Which [`crate::tdm::TdmHardware`] implementation drives the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sim,
    Alsa,
}

/// Microphone channel selection as written in `config.toml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSelect {
    Mono,
    Left,
    Right,
    Stereo,
}

impl ChannelSelect {
    /// Only `stereo` needs both slots of a frame; the rest read one.
    pub fn slot_mode(self) -> SlotMode {
        match self {
            Self::Stereo => SlotMode::Stereo,
            _ => SlotMode::Mono,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 总线配置
    pub bus_mclk_pin: Option<i32>,
    pub bus_bclk_pin: Option<i32>,
    pub bus_lrclk_pin: Option<i32>,
    pub bus_slots: Vec<u8>,
    pub bus_max_ports: u8,

    // 麦克风配置
    pub mic_din_pin: Option<i32>,
    pub mic_sample_rate: u32,
    pub mic_bits_per_sample: u8,
    pub mic_channel: ChannelSelect,
    pub mic_i2s_mode: I2sRole,
    pub mic_use_apll: bool,
    pub mic_mclk_multiple: u32,
    pub mic_correct_dc_offset: bool,

    // 运行时配置
    pub backend: Backend,
    pub alsa_device: &'static str,
    pub tick_interval: Duration,
    pub start_retry: Duration,
    /// `None` runs until interrupted
    pub run_for: Option<Duration>,
}

fn parse_enum<T: for<'de> Deserialize<'de>>(name: &str, value: &'static str) -> Result<T> {
    let de: StrDeserializer<'_, ValueError> = value.into_deserializer();
    T::deserialize(de).with_context(|| format!("Failed to parse {}={}", name, value))
}

fn parse_pin(name: &str, value: &str) -> Result<Option<i32>> {
    let pin: i32 = value
        .parse()
        .with_context(|| format!("Failed to parse {}", name))?;
    Ok((pin >= 0).then_some(pin))
}

fn parse_slots(value: &str) -> Result<Vec<u8>> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<u8>()
                .with_context(|| format!("Failed to parse slot '{}'", s))
        })
        .collect()
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self> {
        let run_seconds: u64 = env!("RUNTIME_RUN_SECONDS")
            .parse()
            .context("Failed to parse RUNTIME_RUN_SECONDS")?;

        let config = Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            bus_mclk_pin: parse_pin("BUS_MCLK_PIN", env!("BUS_MCLK_PIN"))?,
            bus_bclk_pin: parse_pin("BUS_BCLK_PIN", env!("BUS_BCLK_PIN"))?,
            bus_lrclk_pin: parse_pin("BUS_LRCLK_PIN", env!("BUS_LRCLK_PIN"))?,
            bus_slots: parse_slots(env!("BUS_SLOTS"))?,
            bus_max_ports: env!("BUS_MAX_PORTS")
                .parse()
                .context("Failed to parse BUS_MAX_PORTS")?,

            mic_din_pin: parse_pin("MIC_DIN_PIN", env!("MIC_DIN_PIN"))?,
            mic_sample_rate: env!("MIC_SAMPLE_RATE")
                .parse()
                .context("Failed to parse MIC_SAMPLE_RATE")?,
            mic_bits_per_sample: env!("MIC_BITS_PER_SAMPLE")
                .parse()
                .context("Failed to parse MIC_BITS_PER_SAMPLE")?,
            mic_channel: parse_enum("MIC_CHANNEL", env!("MIC_CHANNEL"))?,
            mic_i2s_mode: parse_enum("MIC_I2S_MODE", env!("MIC_I2S_MODE"))?,
            mic_use_apll: env!("MIC_USE_APLL")
                .parse()
                .context("Failed to parse MIC_USE_APLL")?,
            mic_mclk_multiple: env!("MIC_MCLK_MULTIPLE")
                .parse()
                .context("Failed to parse MIC_MCLK_MULTIPLE")?,
            mic_correct_dc_offset: env!("MIC_CORRECT_DC_OFFSET")
                .parse()
                .context("Failed to parse MIC_CORRECT_DC_OFFSET")?,

            backend: parse_enum("RUNTIME_BACKEND", env!("RUNTIME_BACKEND"))?,
            alsa_device: env!("RUNTIME_ALSA_DEVICE"),
            tick_interval: Duration::from_millis(
                env!("RUNTIME_TICK_MS")
                    .parse()
                    .context("Failed to parse RUNTIME_TICK_MS")?,
            ),
            start_retry: Duration::from_millis(
                env!("RUNTIME_START_RETRY_MS")
                    .parse()
                    .context("Failed to parse RUNTIME_START_RETRY_MS")?,
            ),
            run_for: (run_seconds > 0).then(|| Duration::from_secs(run_seconds)),
        };

        // Catch anything the build script let through before touching hardware
        config.endpoint_config()?;
        Ok(config)
    }

    /// Clock pins shared by every endpoint on the bus.
    pub fn pin_config(&self) -> PinConfig {
        PinConfig {
            mclk: self.bus_mclk_pin,
            bclk: self.bus_bclk_pin,
            ws: self.bus_lrclk_pin,
            dout: None,
            din: None,
        }
    }

    /// Microphone endpoint settings derived from the `[bus]` and
    /// `[microphone]` sections.
    pub fn endpoint_config(&self) -> Result<EndpointConfig> {
        let slot_mask = compute_slot_mask(&self.bus_slots)?;
        let mut endpoint = EndpointConfig::new(Direction::Input, slot_mask);
        endpoint.role = self.mic_i2s_mode;
        endpoint.slot_mode = self.mic_channel.slot_mode();
        endpoint.slot_bit_width = SlotBitWidth::from_bits(self.mic_bits_per_sample)
            .with_context(|| format!("Unsupported bits_per_sample {}", self.mic_bits_per_sample))?;
        endpoint.sample_rate = self.mic_sample_rate;
        endpoint.clock_source = if self.mic_use_apll {
            ClockSource::Apll
        } else {
            ClockSource::Default
        };
        endpoint.mclk_multiple = MclkMultiple::from_multiple(self.mic_mclk_multiple)
            .with_context(|| format!("Unsupported mclk_multiple {}", self.mic_mclk_multiple))?;
        endpoint.data_pin = self.mic_din_pin;
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enum_names() {
        assert_eq!(parse_enum::<ChannelSelect>("c", "stereo").unwrap(), ChannelSelect::Stereo);
        assert_eq!(parse_enum::<I2sRole>("m", "secondary").unwrap(), I2sRole::Secondary);
        assert_eq!(parse_enum::<Backend>("b", "sim").unwrap(), Backend::Sim);
        assert!(parse_enum::<ChannelSelect>("c", "quad").is_err());
    }

    #[test]
    fn only_stereo_uses_two_slots_per_frame() {
        assert_eq!(ChannelSelect::Stereo.slot_mode(), SlotMode::Stereo);
        assert_eq!(ChannelSelect::Left.slot_mode(), SlotMode::Mono);
        assert_eq!(ChannelSelect::Right.slot_mode(), SlotMode::Mono);
        assert_eq!(ChannelSelect::Mono.slot_mode(), SlotMode::Mono);
    }

    #[test]
    fn pins_and_slots() {
        assert_eq!(parse_pin("p", "-1").unwrap(), None);
        assert_eq!(parse_pin("p", "12").unwrap(), Some(12));
        assert!(parse_pin("p", "x").is_err());
        assert_eq!(parse_slots("3, 7,3").unwrap(), vec![3, 7, 3]);
        assert!(parse_slots("1,300").is_err());
    }

    #[test]
    fn shipped_config_loads() {
        let config = Config::new().unwrap();
        let endpoint = config.endpoint_config().unwrap();
        assert_eq!(endpoint.direction, Direction::Input);
        assert_eq!(endpoint.sample_rate, config.mic_sample_rate);
        assert!(!endpoint.slot_mask.is_empty());

        let pins = endpoint.pin_config(config.pin_config());
        assert_eq!(pins.ws, config.bus_lrclk_pin);
        assert_eq!(pins.din, config.mic_din_pin);
        assert_eq!(pins.dout, None);
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let mut config = Config::new().unwrap();
        config.bus_slots = vec![0, 15];
        assert!(config.endpoint_config().is_err());
    }
}
