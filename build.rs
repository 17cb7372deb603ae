use std::fs;
use std::path::Path;
use serde::Deserialize;

/// Highest slot index the TDM hardware can address.
const MAX_SLOT_INDEX: u8 = 14;

#[derive(Deserialize)]
struct Config {
    application: Application,
    bus: Bus,
    microphone: Microphone,
    runtime: Runtime,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Bus {
    #[serde(default = "unused_pin")]
    mclk_pin: i32,
    #[serde(default = "unused_pin")]
    bclk_pin: i32,
    lrclk_pin: i32,
    slots: Vec<u8>,
    max_ports: u8,
}

#[derive(Deserialize)]
struct Microphone {
    din_pin: i32,
    sample_rate: u32,
    bits_per_sample: u8,
    channel: String,
    i2s_mode: String,
    use_apll: bool,
    mclk_multiple: u32,
    correct_dc_offset: bool,
}

#[derive(Deserialize)]
struct Runtime {
    backend: String,
    alsa_device: String,
    tick_ms: u64,
    start_retry_ms: u64,
    run_seconds: u64,
}

fn unused_pin() -> i32 {
    -1
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    validate(&config);

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 总线配置
    let slots: Vec<String> = config.bus.slots.iter().map(|s| s.to_string()).collect();
    println!("cargo:rustc-env=BUS_MCLK_PIN={}", config.bus.mclk_pin);
    println!("cargo:rustc-env=BUS_BCLK_PIN={}", config.bus.bclk_pin);
    println!("cargo:rustc-env=BUS_LRCLK_PIN={}", config.bus.lrclk_pin);
    println!("cargo:rustc-env=BUS_SLOTS={}", slots.join(","));
    println!("cargo:rustc-env=BUS_MAX_PORTS={}", config.bus.max_ports);

    // 麦克风配置
    println!("cargo:rustc-env=MIC_DIN_PIN={}", config.microphone.din_pin);
    println!("cargo:rustc-env=MIC_SAMPLE_RATE={}", config.microphone.sample_rate);
    println!("cargo:rustc-env=MIC_BITS_PER_SAMPLE={}", config.microphone.bits_per_sample);
    println!("cargo:rustc-env=MIC_CHANNEL={}", config.microphone.channel);
    println!("cargo:rustc-env=MIC_I2S_MODE={}", config.microphone.i2s_mode);
    println!("cargo:rustc-env=MIC_USE_APLL={}", config.microphone.use_apll);
    println!("cargo:rustc-env=MIC_MCLK_MULTIPLE={}", config.microphone.mclk_multiple);
    println!("cargo:rustc-env=MIC_CORRECT_DC_OFFSET={}", config.microphone.correct_dc_offset);

    // 运行时配置
    println!("cargo:rustc-env=RUNTIME_BACKEND={}", config.runtime.backend);
    println!("cargo:rustc-env=RUNTIME_ALSA_DEVICE={}", config.runtime.alsa_device);
    println!("cargo:rustc-env=RUNTIME_TICK_MS={}", config.runtime.tick_ms);
    println!("cargo:rustc-env=RUNTIME_START_RETRY_MS={}", config.runtime.start_retry_ms);
    println!("cargo:rustc-env=RUNTIME_RUN_SECONDS={}", config.runtime.run_seconds);
}

fn validate(config: &Config) {
    if config.bus.slots.is_empty() {
        panic!("bus.slots must name at least one slot");
    }
    if let Some(slot) = config.bus.slots.iter().find(|&&s| s > MAX_SLOT_INDEX) {
        panic!("bus.slots: slot {} is out of range 0..={}", slot, MAX_SLOT_INDEX);
    }
    if config.bus.max_ports == 0 {
        panic!("bus.max_ports must be at least 1");
    }

    let mic = &config.microphone;
    if mic.sample_rate == 0 {
        panic!("microphone.sample_rate must be positive");
    }
    if ![8, 16, 24, 32].contains(&mic.bits_per_sample) {
        panic!("microphone.bits_per_sample must be one of 8, 16, 24, 32");
    }
    if ![128, 256, 384, 512].contains(&mic.mclk_multiple) {
        panic!("microphone.mclk_multiple must be one of 128, 256, 384, 512");
    }
    if mic.bits_per_sample == 24 && mic.mclk_multiple % 3 != 0 {
        panic!("microphone.mclk_multiple must be divisible by 3 when bits_per_sample is 24");
    }
    if !["mono", "left", "right", "stereo"].contains(&mic.channel.as_str()) {
        panic!("microphone.channel must be one of mono, left, right, stereo");
    }
    if !["primary", "secondary"].contains(&mic.i2s_mode.as_str()) {
        panic!("microphone.i2s_mode must be primary or secondary");
    }
    if !["sim", "alsa"].contains(&config.runtime.backend.as_str()) {
        panic!("runtime.backend must be sim or alsa");
    }
    if config.runtime.tick_ms == 0 {
        panic!("runtime.tick_ms must be positive");
    }
}
