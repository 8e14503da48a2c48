//! midi-pulse - MIDI 输出与多媒体定时器命令行工具
//!
//! - devices: 列出输出设备
//! - note / sysex: 发送短消息、长消息
//! - metronome: 用周期定时器驱动节拍
//! - tick: 毫秒计数

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use midi_pulse::midi::{self, device, ControllerConfig, OutputController, ShortMessage};
use midi_pulse::time::{self, ClockResolution, TimerEvent};

/// midi-pulse - MIDI output and multimedia timer tool
#[derive(Parser)]
#[command(name = "midi-pulse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Select output device by name or ID (use 'devices' to list)
    #[arg(short, long, global = true, default_value = "0")]
    device: String,

    /// Transfer buffer size in bytes for long messages
    #[arg(long, global = true, default_value = "1024")]
    buffer_bytes: usize,

    /// Completion timeout per chunk in milliseconds (0 = wait forever)
    #[arg(long, global = true, default_value = "5000")]
    timeout_ms: u64,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List MIDI output devices
    Devices,

    /// Play a single note
    Note {
        /// MIDI channel (0-15)
        #[arg(long, default_value = "0")]
        channel: u8,

        /// Note number (0-127)
        #[arg(long, default_value = "60")]
        note: u8,

        /// Velocity (1-127)
        #[arg(long, default_value = "100")]
        velocity: u8,

        /// How long to hold the note
        #[arg(long, default_value = "500")]
        duration_ms: u64,
    },

    /// Send a system exclusive message
    Sysex {
        /// Message bytes in hex, e.g. "F0 7E 7F 09 01 F7"
        #[arg(required = true, num_args = 1..)]
        hex: Vec<String>,
    },

    /// Click a note at a fixed interval
    Metronome {
        /// Interval between clicks
        #[arg(long, default_value = "500")]
        interval_ms: u32,

        /// Stop after this many clicks (0 = until Ctrl+C)
        #[arg(long, default_value = "0")]
        count: u32,

        /// Clock resolution to request while running
        #[arg(long, default_value = "1")]
        resolution_ms: u32,

        /// MIDI channel (0-15)
        #[arg(long, default_value = "9")]
        channel: u8,

        /// Note number (0-127)
        #[arg(long, default_value = "76")]
        note: u8,
    },

    /// Print the millisecond tick counter
    Tick,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Devices => show_devices()?,
        Commands::Note {
            channel,
            note,
            velocity,
            duration_ms,
        } => play_note(&cli, channel, note, velocity, duration_ms)?,
        Commands::Sysex { ref hex } => send_sysex(&cli, hex)?,
        Commands::Metronome {
            interval_ms,
            count,
            resolution_ms,
            channel,
            note,
        } => run_metronome(&cli, interval_ms, count, resolution_ms, channel, note)?,
        Commands::Tick => println!("{}", time::now_ms()),
    }

    Ok(())
}

/// 显示设备信息
fn show_devices() -> anyhow::Result<()> {
    println!("=== MIDI Output Devices ===\n");

    let devices = device::list(&midi::system_driver())?;
    if devices.is_empty() {
        println!("(none)");
        return Ok(());
    }

    for caps in &devices {
        let (major, minor) = caps.driver_version_parts();
        println!(
            "[{:>3}] {} ({}, {} voices, driver {}.{})",
            caps.id,
            caps.name,
            caps.technology.as_str(),
            caps.voices,
            major,
            minor
        );
    }

    println!();
    println!("Select device: midi-pulse -d <ID|NAME> note");

    Ok(())
}

/// 根据全局参数打开输出设备
fn open_controller(cli: &Cli) -> anyhow::Result<OutputController> {
    let driver = midi::system_driver();
    let config = ControllerConfig {
        buffer_capacity: cli.buffer_bytes,
        completion_timeout: (cli.timeout_ms > 0).then(|| Duration::from_millis(cli.timeout_ms)),
    };

    let controller = match cli.device.parse::<u32>() {
        Ok(device_id) => OutputController::open_with(&driver, device_id, config)?,
        Err(_) => OutputController::open_by_name_with(&driver, &cli.device, config)?,
    };
    Ok(controller)
}

fn check_channel(channel: u8) -> anyhow::Result<()> {
    if channel > 15 {
        bail!("channel must be 0-15, got {}", channel);
    }
    Ok(())
}

fn play_note(cli: &Cli, channel: u8, note: u8, velocity: u8, duration_ms: u64) -> anyhow::Result<()> {
    check_channel(channel)?;
    let mut controller = open_controller(cli)?;

    controller.send(ShortMessage::note_on(channel, note, velocity))?;
    thread::sleep(Duration::from_millis(duration_ms));
    controller.send(ShortMessage::note_off(channel, note, 0))?;

    controller.close();
    Ok(())
}

/// 解析十六进制字节，空白分隔或连写均可
fn parse_hex(words: &[String]) -> anyhow::Result<Vec<u8>> {
    let digits: String = words.iter().flat_map(|w| w.chars()).filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() {
        bail!("hex input contains non-ASCII characters");
    }
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            let pair = &digits[i..i + 2];
            u8::from_str_radix(pair, 16).with_context(|| format!("invalid hex byte '{}'", pair))
        })
        .collect()
}

fn send_sysex(cli: &Cli, hex: &[String]) -> anyhow::Result<()> {
    let bytes = parse_hex(hex)?;
    if bytes.first() != Some(&0xF0) || bytes.last() != Some(&0xF7) {
        log::warn!("Message does not look like SysEx (F0 ... F7)");
    }

    let mut controller = open_controller(cli)?;
    controller.send_long(&bytes)?;
    println!(
        "Sent {} bytes to device {} ({} byte chunks)",
        bytes.len(),
        controller.device_id(),
        controller.buffer_capacity()
    );

    controller.close();
    Ok(())
}

fn run_metronome(
    cli: &Cli,
    interval_ms: u32,
    count: u32,
    resolution_ms: u32,
    channel: u8,
    note: u8,
) -> anyhow::Result<()> {
    check_channel(channel)?;
    let controller = Arc::new(Mutex::new(open_controller(cli)?));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let _resolution = match ClockResolution::scoped(resolution_ms) {
        Ok(guard) => Some(guard),
        Err(e) => {
            log::warn!("Running without clock resolution request: {}", e);
            None
        }
    };

    let clicks = Arc::new(AtomicU32::new(0));
    let mut timer = {
        let controller = Arc::clone(&controller);
        let clicks = Arc::clone(&clicks);
        let running = Arc::clone(&running);
        TimerEvent::periodic(interval_ms, move || {
            let n = clicks.fetch_add(1, Ordering::SeqCst) + 1;
            let accent = if n % 4 == 1 { 127 } else { 80 };
            if let Ok(mut controller) = controller.lock() {
                let on = controller.send(ShortMessage::note_on(channel, note, accent));
                let off = controller.send(ShortMessage::note_off(channel, note, 0));
                if on.and(off).is_err() {
                    running.store(false, Ordering::SeqCst);
                }
            }
            if count > 0 && n >= count {
                running.store(false, Ordering::SeqCst);
            }
        })?
    };

    println!("Metronome: every {} ms on channel {}, note {}", interval_ms, channel, note);
    println!("Press Ctrl+C to stop.\n");

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(10));
    }

    timer.cancel();
    println!("\n{} clicks", clicks.load(Ordering::SeqCst));

    let mut controller = controller
        .lock()
        .map_err(|_| anyhow::anyhow!("controller lock poisoned"))?;
    controller.close();

    Ok(())
}
