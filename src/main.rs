use std::fs;
use std::path::PathBuf;
use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use imu_session::logging::init_logging_with;
use imu_session::{
    available_ports, ConnectionState, Endpoint, LogStatus, ReturnRate, Session, SessionConfig,
    DEFAULT_BAUD_RATE,
};

#[derive(Parser, Debug)]
#[command(name = "imu-session", about = "Stream and log acceleration from a serial IMU")]
struct Args {
    /// Log level (error, warn, info, debug, trace); defaults to IMU_LOG/RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,
    /// Connect, stream for a while, optionally logging to a file
    Stream(StreamArgs),
}

#[derive(clap::Args, Debug)]
struct StreamArgs {
    /// Serial port (e.g., /dev/rfcomm0 or COM5)
    port: String,
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
    /// Device return rate to set before streaming (e.g., 100Hz)
    #[arg(long)]
    rate: Option<ReturnRate>,
    /// Run accelerometer calibration first (sensor still and level)
    #[arg(long)]
    calibrate: bool,
    /// Directory to write a log file into; no log without it
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Log file name without extension; empty uses the current time
    #[arg(long, default_value = "")]
    log_name: String,
    /// How long to stream, in seconds
    #[arg(short, long, default_value_t = 10.0)]
    duration: f64,
    /// Status poll interval in milliseconds
    #[arg(long, default_value_t = 50)]
    interval_ms: u64,
    /// Samples kept for display
    #[arg(long)]
    plot_capacity: Option<usize>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging_with(args.log_level.as_deref());

    match args.command {
        Command::Ports => {
            let ports = available_ports();
            if ports.is_empty() {
                println!("No serial ports found.");
            }
            for port in ports {
                println!("{port}");
            }
            Ok(())
        }
        Command::Stream(stream) => run_stream(stream),
    }
}

fn run_stream(args: StreamArgs) -> Result<()> {
    if !args.duration.is_finite() || args.duration < 0.0 {
        bail!("duration must be a non-negative number of seconds");
    }

    let mut config = SessionConfig::default();
    if let Some(capacity) = args.plot_capacity {
        config.plot_capacity = capacity;
    }
    let mut session = Session::new(config);

    println!("Connecting to {} at {} baud...", args.port, args.baud);
    session
        .connect(Endpoint::new(&args.port, args.baud))
        .with_context(|| format!("could not connect to {}", args.port))?;

    if let Some(rate) = args.rate {
        println!("Setting return rate to {rate}");
        session.set_return_rate(rate)?;
    }
    if args.calibrate {
        println!("Calibrating accelerometer; keep the sensor still...");
        session.calibrate_acceleration()?;
    }

    if let Some(dir) = &args.log_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("could not create log directory {}", dir.display()))?;
        let path = session.start_logging_in(dir, &args.log_name)?;
        println!("Logging to {}", path.display());
    }

    let interval = Duration::from_millis(args.interval_ms.max(1));
    let deadline = Instant::now() + Duration::from_secs_f64(args.duration);
    let mut last_report = Instant::now();
    let mut log_failure_reported = false;
    while Instant::now() < deadline {
        thread::sleep(interval);

        if let ConnectionState::Failed(reason) = session.connection_state() {
            bail!("connection lost: {reason}");
        }
        if let LogStatus::Failed { path, reason } = session.log_status() {
            if !log_failure_reported {
                eprintln!("Logging to {} stopped: {reason}", path.display());
                log_failure_reported = true;
            }
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            match session.latest_sample() {
                Some(s) => println!(
                    "[{:>8.3}s] x={:+.3} y={:+.3} z={:+.3} |a|={:.3} g  lines={}",
                    s.timestamp.as_secs_f64(),
                    s.acceleration.x,
                    s.acceleration.y,
                    s.acceleration.z,
                    s.norm,
                    session.line_count()
                ),
                None => println!("Waiting for data..."),
            }
        }
    }

    if let Some(summary) = session.stop_logging() {
        println!(
            "Logged {} lines to {} ({} .. {})",
            summary.line_count,
            summary.path.display(),
            summary.started_at.format("%H:%M:%S"),
            summary.ended_at.format("%H:%M:%S")
        );
    }
    let stats = session.decode_stats();
    println!(
        "Frames: {} | checksum errors: {} | unknown types: {}",
        stats.frames, stats.checksum_errors, stats.unknown_types
    );
    session.disconnect();
    println!("Done.");
    Ok(())
}
