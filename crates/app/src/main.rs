// Copyright 2025-2026 CEMAXECUTER LLC

use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cb_sdr::{args, device, factory, flags, registry, Direction, ErrorCode, Stream};

#[derive(Parser, Debug)]
#[command(name = "crossband")]
#[command(about = "Minimal SDR driver probe: enumerate, configure, stream")]
struct Cli {
    /// List devices matching the filter args (e.g. "driver=rtlsdr")
    #[arg(short = 'e', long, value_name = "ARGS", num_args = 0..=1, default_missing_value = "")]
    enumerate: Option<String>,

    /// Device construction args, e.g. "driver=hackrf, serial=1234"
    #[arg(short = 'a', long, default_value = "")]
    args: String,

    /// Center frequency in Hz
    #[arg(short = 'f', long)]
    freq: Option<f64>,

    /// Sample rate in Hz
    #[arg(short = 'r', long)]
    rate: Option<f64>,

    /// Overall gain in dB, spread across the device's gain stages
    #[arg(short = 'g', long)]
    gain: Option<f64>,

    /// Baseband filter bandwidth in Hz
    #[arg(short = 'b', long)]
    bandwidth: Option<f64>,

    /// Stream format: CS8, CS16, CF32 or CF64
    #[arg(long, default_value = "CS16")]
    format: String,

    /// Device settings as "k=v, k=v" (biastee, direct_samp, iq_swap, ...)
    #[arg(long, default_value = "")]
    settings: String,

    /// Stream args as "k=v, k=v" (buffers, bufflen, asyncBuffs)
    #[arg(long, default_value = "")]
    stream_args: String,

    /// Receive this many samples, 0 = until Ctrl-C
    #[arg(long)]
    rx: Option<u64>,

    /// Transmit a zero-filled burst of this many samples
    #[arg(long)]
    tx: Option<usize>,

    /// Print identification and ranges of the made device, then exit
    #[arg(long)]
    info: bool,

    /// Load driver modules from . and ./Modules before probing
    #[arg(long)]
    load_modules: bool,
}

fn print_device_info(dev: &Arc<dyn device::Device>) {
    println!("driver:   {}", dev.driver_key());
    println!("hardware: {}", dev.hardware_key());
    for (key, value) in dev.hardware_info() {
        println!("  {} = {}", key, value);
    }
    for direction in [Direction::Rx, Direction::Tx] {
        let channels = dev.num_channels(direction);
        if channels == 0 {
            continue;
        }
        println!("{}:", direction.name());
        println!("  formats: {}", dev.stream_formats(direction, 0).join(", "));
        println!("  antennas: {}", dev.list_antennas(direction, 0).join(", "));
        for name in dev.list_frequencies(direction, 0) {
            if let Ok(range) = dev.frequency_range(direction, 0, &name) {
                println!(
                    "  freq {}: {:.0} .. {:.0} Hz",
                    name, range.minimum, range.maximum
                );
            }
        }
        for name in dev.list_gains(direction, 0) {
            if let Ok(range) = dev.gain_range(direction, 0, &name) {
                println!(
                    "  gain {}: {} .. {} dB",
                    name, range.minimum, range.maximum
                );
            }
        }
        let rates: Vec<String> = dev
            .list_sample_rates(direction, 0)
            .iter()
            .map(|r| format!("{:.0}", r))
            .collect();
        if !rates.is_empty() {
            println!("  rates: {}", rates.join(", "));
        }
    }
}

fn run_rx(
    dev: &Arc<dyn device::Device>,
    format: &str,
    stream_args: &cb_sdr::Kwargs,
    want: u64,
    running: Arc<AtomicBool>,
) -> Result<(), String> {
    let mut stream =
        Stream::rx(dev, format, stream_args).map_err(|e| format!("stream setup: {}", e))?;
    let mtu = stream.mtu();
    let bps = cb_sdr::SampleFormat::from_name(format)
        .map(|f| f.bytes_per_sample())
        .unwrap_or(4);
    let mut buf = vec![0u8; mtu * bps];

    stream
        .activate(0, 0, 0)
        .map_err(|e| format!("activate: {}", e))?;
    log::info!("receiving (mtu={} samples)", mtu);

    let mut total: u64 = 0;
    let mut overflows: u64 = 0;
    let mut window = Instant::now();
    let mut window_samples: u64 = 0;

    while running.load(Ordering::SeqCst) && (want == 0 || total < want) {
        match stream.read(&mut buf, mtu, 500_000) {
            Ok(result) => {
                total += result.samples as u64;
                window_samples += result.samples as u64;
            }
            Err(ErrorCode::Timeout) => continue,
            Err(ErrorCode::Overflow) => {
                overflows += 1;
                continue;
            }
            Err(e) => return Err(format!("read: {}", e)),
        }
        if window.elapsed() >= Duration::from_secs(1) {
            eprintln!(
                "  {:.3} MS/s, {} samples, {} overflows",
                window_samples as f64 / window.elapsed().as_secs_f64() / 1e6,
                total,
                overflows
            );
            window = Instant::now();
            window_samples = 0;
        }
    }

    stream
        .deactivate(0, 0)
        .map_err(|e| format!("deactivate: {}", e))?;
    eprintln!("received {} samples ({} overflows)", total, overflows);
    Ok(())
}

fn run_tx(
    dev: &Arc<dyn device::Device>,
    format: &str,
    stream_args: &cb_sdr::Kwargs,
    burst: usize,
    running: Arc<AtomicBool>,
) -> Result<(), String> {
    let mut stream =
        Stream::tx(dev, format, stream_args).map_err(|e| format!("stream setup: {}", e))?;
    let mtu = stream.mtu();
    let bps = cb_sdr::SampleFormat::from_name(format)
        .map(|f| f.bytes_per_sample())
        .unwrap_or(4);

    stream
        .activate(flags::END_BURST, 0, burst)
        .map_err(|e| format!("activate: {}", e))?;
    log::info!("transmitting a {}-sample burst", burst);

    let silence = vec![0u8; mtu * bps];
    let mut remaining = burst;
    while remaining > 0 && running.load(Ordering::SeqCst) {
        let chunk = remaining.min(mtu);
        let wflags = if chunk == remaining { flags::END_BURST } else { 0 };
        match stream.write(&silence, chunk, wflags, 0, 500_000) {
            Ok(result) => remaining -= result.samples,
            Err(ErrorCode::Timeout) => continue,
            Err(e) => return Err(format!("write: {}", e)),
        }
    }

    // Give the burst a chance to drain, reporting underflows on the way.
    match stream.read_status(100_000) {
        ErrorCode::Underflow => eprintln!("underflow while draining burst"),
        ErrorCode::Timeout => {}
        other => eprintln!("stream status: {}", other),
    }

    stream
        .deactivate(0, 0)
        .map_err(|e| format!("deactivate: {}", e))?;
    eprintln!("burst of {} samples sent", burst);
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if cli.load_modules {
        let loaded = registry::load_modules();
        eprintln!("loaded {} driver module(s)", loaded);
    }

    if let Some(filter) = cli.enumerate.as_deref() {
        let found = factory::enumerate(filter);
        if found.is_empty() {
            eprintln!("(no devices found)");
            return;
        }
        for kw in &found {
            println!("{}", args::serialize_kwargs(kw));
        }
        return;
    }

    let dev = match factory::make(&cli.args) {
        Ok(dev) => dev,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    // Apply tuner configuration before any streaming starts.
    let direction = if cli.tx.is_some() { Direction::Tx } else { Direction::Rx };
    if let Some(rate) = cli.rate {
        if let Err(e) = dev.set_sample_rate(direction, 0, rate) {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
    if let Some(freq) = cli.freq {
        if let Err(e) = dev.set_frequency(direction, 0, freq, &cb_sdr::Kwargs::new()) {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
    if let Some(gain) = cli.gain {
        if let Err(e) = dev.set_gain(direction, 0, gain) {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
    if let Some(bw) = cli.bandwidth {
        if let Err(e) = dev.set_bandwidth(direction, 0, bw) {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
    for (key, value) in args::parse_kwargs(&cli.settings) {
        if let Err(e) = dev.write_setting(&key, &value) {
            eprintln!("warning: setting {}: {}", key, e);
        }
    }

    if cli.info {
        print_device_info(&dev);
        let _ = factory::unmake(&dev);
        return;
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupted, stopping...");
        r.store(false, Ordering::SeqCst);
    })
    .expect("failed to set Ctrl-C handler");

    let stream_args = args::parse_kwargs(&cli.stream_args);
    let outcome = if let Some(burst) = cli.tx {
        run_tx(&dev, &cli.format, &stream_args, burst, running)
    } else {
        run_rx(&dev, &cli.format, &stream_args, cli.rx.unwrap_or(0), running)
    };

    let _ = factory::unmake(&dev);

    if let Err(e) = outcome {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
