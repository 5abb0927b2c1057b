//! Fake xcoder - runs decoder and encoder sessions against the simulated device.
//!
//! One thread sends packets or frames while a second thread drains the
//! output, the same topology an application uses against real hardware.
//!
//! Usage:
//!   fake-xcoder [options]
//!
//! Options:
//!   --mode <decode|encode|both>  Sessions to run (default: both)
//!   --frames <n>                 Inputs per session (default: 100)
//!   --width <px>                 Picture width (default: 1280)
//!   --height <px>                Picture height (default: 720)
//!   --io-size <bytes>            Largest device transfer (default: 131072)
//!   --threads <n>                Chunk workers per direction (default: 4)
//!   --low-delay <ms>             Low-delay window, 0 disables (default: 0)

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::Rng;
use xcoder::sim::SimulatedDevice;
use xcoder::{
    drain, CodecFormat, Decoder, Encoder, Frame, Packet, SessionBackend, SessionConfig,
};

const IDLE: Duration = Duration::from_micros(500);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Decode,
    Encode,
    Both,
}

struct Args {
    mode: Mode,
    frames: usize,
    width: u32,
    height: u32,
    io_size: usize,
    threads: usize,
    low_delay_ms: u32,
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T> {
    value
        .parse()
        .ok()
        .with_context(|| format!("invalid value for {flag}: {value}"))
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args {
        mode: Mode::Both,
        frames: 100,
        width: 1280,
        height: 720,
        io_size: 128 * 1024,
        threads: 4,
        low_delay_ms: 0,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = args.get(i + 1).map(String::as_str);
        match (flag, value) {
            ("--mode", Some(v)) => {
                result.mode = match v {
                    "decode" => Mode::Decode,
                    "encode" => Mode::Encode,
                    "both" => Mode::Both,
                    other => bail!("unknown mode: {other}"),
                };
            }
            ("--frames", Some(v)) => result.frames = parse_value(flag, v)?,
            ("--width", Some(v)) => result.width = parse_value(flag, v)?,
            ("--height", Some(v)) => result.height = parse_value(flag, v)?,
            ("--io-size", Some(v)) => result.io_size = parse_value(flag, v)?,
            ("--threads", Some(v)) => result.threads = parse_value(flag, v)?,
            ("--low-delay", Some(v)) => result.low_delay_ms = parse_value(flag, v)?,
            ("--help" | "-h", _) => {
                print_usage();
                std::process::exit(0);
            }
            (other, _) => bail!("unexpected argument: {other}"),
        }
        i += 2;
    }

    Ok(result)
}

fn print_usage() {
    println!("Fake xcoder - decoder and encoder sessions on a simulated transcoder");
    println!();
    println!("Usage: fake-xcoder [options]");
    println!();
    println!("Options:");
    println!("  --mode <decode|encode|both>  Sessions to run (default: both)");
    println!("  --frames <n>                 Inputs per session (default: 100)");
    println!("  --width <px>                 Picture width (default: 1280)");
    println!("  --height <px>                Picture height (default: 720)");
    println!("  --io-size <bytes>            Largest device transfer (default: 131072)");
    println!("  --threads <n>                Chunk workers per direction (default: 4)");
    println!("  --low-delay <ms>             Low-delay window, 0 disables (default: 0)");
}

/// Send every input from one thread while another drains the output.
fn run_session<B>(
    backend: &B,
    count: usize,
    make_input: impl Fn(usize) -> B::Input + Sync,
    describe: impl Fn(&B::Output) -> String + Sync,
) -> Result<(usize, usize)>
where
    B: SessionBackend,
{
    backend.open()?;
    let started = Instant::now();

    let (sent, received) = thread::scope(|s| {
        let sender = s.spawn(|| -> Result<usize> {
            for i in 0..count {
                let input = make_input(i);
                let mut attempts = 0;
                while backend.write(&input)? == 0 {
                    attempts += 1;
                    if attempts > 10_000 {
                        bail!("input {i} never accepted");
                    }
                    thread::sleep(IDLE);
                }
            }
            backend.flush()?;
            Ok(count)
        });
        let receiver = s.spawn(|| -> Result<usize> {
            let mut index = 0;
            let received = drain(backend, IDLE, |output| {
                tracing::debug!("output {}: {}", index, describe(&output));
                index += 1;
            })?;
            Ok(received)
        });

        let sent = sender
            .join()
            .map_err(|_| anyhow::anyhow!("send thread panicked"))?;
        let received = receiver
            .join()
            .map_err(|_| anyhow::anyhow!("receive thread panicked"))?;
        Ok::<_, anyhow::Error>((sent?, received?))
    })?;

    let stats = backend.session().stats();
    backend.close()?;
    tracing::info!(
        "{} session: {} in, {} out in {:?} (device counted {} in, {} out)",
        backend.device_type(),
        sent,
        received,
        started.elapsed(),
        stats.frames_input,
        stats.frames_output
    );
    Ok((sent, received))
}

fn config(args: &Args) -> SessionConfig {
    SessionConfig::new(CodecFormat::H264, args.width, args.height)
        .worker_threads(args.threads)
        .low_delay_ms(args.low_delay_ms)
}

fn decode(args: &Args) -> Result<()> {
    let device = Arc::new(SimulatedDevice::new(args.io_size));
    let decoder = Decoder::new(device, config(args));
    let (sent, received) = run_session(
        &decoder,
        args.frames,
        |i| {
            let mut rng = rand::rng();
            let mut data = vec![0u8; rng.random_range(200..4000)];
            rng.fill(&mut data[..]);
            let mut packet = Packet::new(data, i as i64 * 3000, i as i64 * 3000);
            packet.start_of_stream = i == 0;
            packet
        },
        |frame: &Frame| {
            format!(
                "{}x{} pts {} dts {}",
                frame.width, frame.height, frame.pts, frame.dts
            )
        },
    )?;
    if received != sent {
        bail!("decoder returned {received} frames for {sent} packets");
    }
    println!(
        "decode: {} packets -> {} frames, {} resolution changes",
        sent,
        received,
        decoder.seq_change_count()
    );
    Ok(())
}

fn encode(args: &Args) -> Result<()> {
    let device = Arc::new(SimulatedDevice::new(args.io_size));
    let encoder = Encoder::new(device, config(args).low_delay(args.low_delay_ms > 0))?;
    let (width, height) = (args.width, args.height);
    let (sent, received) = run_session(
        &encoder,
        args.frames,
        |i| match Frame::new_yuv420(width, height, 8) {
            Ok(mut frame) => {
                let [y, _, _] = frame.planes_mut();
                for (offset, sample) in y.iter_mut().enumerate() {
                    *sample = (offset + i) as u8;
                }
                frame.pts = i as i64;
                frame.start_of_stream = i == 0;
                frame
            }
            Err(e) => {
                tracing::error!("frame {}: {}", i, e);
                Frame::end_of_stream()
            }
        },
        |packet: &Packet| {
            format!(
                "{} bytes type {} pts {} qp {}",
                packet.len(),
                packet.frame_type,
                packet.pts,
                packet.avg_frame_qp
            )
        },
    )?;
    if received != sent {
        bail!("encoder returned {received} packets for {sent} frames");
    }
    println!("encode: {} frames -> {} packets", sent, received);
    Ok(())
}

fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            print_usage();
            return ExitCode::from(1);
        }
    };

    println!();
    println!("========================================");
    println!("Fake xcoder");
    println!("========================================");
    println!("Picture:   {}x{}", args.width, args.height);
    println!("Inputs:    {}", args.frames);
    println!("I/O size:  {} bytes", args.io_size);
    println!("Workers:   {} per direction", args.threads);
    println!("========================================");
    println!();

    let mut result = Ok(());
    if matches!(args.mode, Mode::Decode | Mode::Both) {
        result = decode(&args);
    }
    if result.is_ok() && matches!(args.mode, Mode::Encode | Mode::Both) {
        result = encode(&args);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fake-xcoder failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}
