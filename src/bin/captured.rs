//! captured - camera capture daemon
//!
//! This daemon:
//! 1. Loads configuration (file from --config / CAPTURE_CONFIG, then env overrides)
//! 2. Starts continuous acquisition into the latest-frame buffer
//! 3. Optionally saves a still and records a clip at startup
//! 4. Logs health every few seconds until Ctrl-C or --duration elapses

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use capture_kernel::{CaptureConfig, CaptureService};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);
const FIRST_FRAME_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera capture daemon")]
struct Args {
    /// Config file (TOML when the extension is .toml, JSON otherwise).
    #[arg(long, env = "CAPTURE_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many seconds (0 runs until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    duration: u64,

    /// Record a clip of this many seconds at startup.
    #[arg(long)]
    record: Option<u64>,

    /// Save one still once the first frame arrives.
    #[arg(long)]
    snapshot: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = CaptureConfig::load_with(args.config.as_deref()).context("load capture config")?;
    let service = CaptureService::from_config(cfg).context("start capture service")?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .context("install Ctrl-C handler")?;

    if args.snapshot {
        if wait_for_first_frame(&service, &running) {
            let path = service.save_frame(None).context("save startup still")?;
            log::info!("startup still saved to {}", path);
        } else {
            log::warn!("no frame within {:?}; skipping startup still", FIRST_FRAME_WAIT);
        }
    }

    let mut recording_until = None;
    if let Some(secs) = args.record {
        let filename = service.start_recording(None).context("start startup recording")?;
        log::info!("recording {} for {}s", filename, secs);
        recording_until = Some(Instant::now() + Duration::from_secs(secs));
    }

    let started = Instant::now();
    let mut last_health_log = Instant::now();
    log::info!("captured running (Ctrl-C to stop)");

    while running.load(Ordering::SeqCst) {
        if args.duration > 0 && started.elapsed() >= Duration::from_secs(args.duration) {
            log::info!("duration of {}s reached", args.duration);
            break;
        }

        if recording_until.map_or(false, |until| Instant::now() >= until) {
            recording_until = None;
            match service.stop_recording() {
                Ok(done) => log::info!(
                    "recording saved to {} ({:.1}s)",
                    done.path.display(),
                    done.duration.as_secs_f64()
                ),
                Err(err) => log::error!("recording failed: {}", err),
            }
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let status = service.status();
            log::info!(
                "health: running={} healthy={} frames={} errors={} last_frame_age={}",
                status.running,
                status.sensor_healthy,
                status.frames_captured,
                status.capture_errors,
                status
                    .last_frame_age_seconds
                    .map(|age| format!("{:.2}s", age))
                    .unwrap_or_else(|| "n/a".to_string())
            );
            if !status.sensor_healthy {
                if let Some(err) = &status.last_error {
                    log::warn!("last sensor error: {}", err);
                }
            }
            last_health_log = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("shutting down...");
    service.shutdown();
    Ok(())
}

fn wait_for_first_frame(service: &CaptureService, running: &AtomicBool) -> bool {
    let deadline = Instant::now() + FIRST_FRAME_WAIT;
    while Instant::now() < deadline && running.load(Ordering::SeqCst) {
        if service.status().frame_available {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}
