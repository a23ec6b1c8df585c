//! # emuloop Runner
//!
//! Headless front end: drives a reference machine through the thread
//! controller with a consumer thread on the other side of the frame sync,
//! then reports what happened.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{info, warn};

use emuloop_core::machine::reference::ReferenceMachine;
use emuloop_core::{CallbackContext, ThreadCallbacks, ThreadConfig, ThreadController};

// ============================================================================
// Options
// ============================================================================

struct RunOptions {
    frames: u64,
    config: Option<PathBuf>,
    fast_forward: bool,
    rewind: u64,
    json: bool,
}

fn parse_args(args: &[String]) -> Result<RunOptions> {
    let mut options = RunOptions {
        frames: 600,
        config: None,
        fast_forward: false,
        rewind: 0,
        json: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--frames" | "-n" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --frames"))?;
                options.frames = value
                    .parse::<u64>()
                    .map_err(|e| anyhow::anyhow!("Invalid frame count {}: {}", value, e))?;
                i += 2;
            }
            "--config" | "-c" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --config"))?;
                options.config = Some(PathBuf::from(value));
                i += 2;
            }
            "--rewind" | "-r" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --rewind"))?;
                options.rewind = value
                    .parse::<u64>()
                    .map_err(|e| anyhow::anyhow!("Invalid rewind count {}: {}", value, e))?;
                i += 2;
            }
            "--fast-forward" | "-f" => {
                options.fast_forward = true;
                i += 1;
            }
            "--json" => {
                options.json = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                warn!("Ignoring unknown argument {:?}", other);
                i += 1;
            }
        }
    }

    Ok(options)
}

fn print_usage() {
    eprintln!("Usage: emuloop [options]");
    eprintln!();
    eprintln!("  -n, --frames <N>      Frames to run before stopping (default 600)");
    eprintln!("  -c, --config <PATH>   Thread configuration (JSON)");
    eprintln!("  -f, --fast-forward    Disable video sync and allow frame drops");
    eprintln!("  -r, --rewind <N>      Rewind N snapshots after the run");
    eprintln!("      --json            Print the summary as JSON on stdout");
}

// ============================================================================
// Callbacks / Consumer
// ============================================================================

/// Pauses the thread once the requested number of frames is reached
struct StopAfter {
    frames: u64,
}

impl ThreadCallbacks<ReferenceMachine> for StopAfter {
    fn on_start(&mut self, _ctx: &mut CallbackContext<'_, ReferenceMachine>) {
        if let Some(logger) = emuloop_core::logging::current() {
            logger.info(format_args!("Running {} frames", self.frames));
        }
    }

    fn on_frame(&mut self, ctx: &mut CallbackContext<'_, ReferenceMachine>) {
        if ctx.frame >= self.frames {
            ctx.thread.pause_from_thread();
        }
    }

    fn on_cleanup(&mut self, ctx: &mut CallbackContext<'_, ReferenceMachine>) {
        ctx.thread
            .logger()
            .debug(format_args!("Clean-up at frame {}", ctx.frame));
    }
}

#[derive(Debug, Default)]
struct ConsumerStats {
    frames: u64,
    last_frame: u64,
    checksum: u64,
    audio_samples: u64,
}

fn spawn_consumer(
    controller: &ThreadController<ReferenceMachine>,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<ConsumerStats>>,
) -> Result<thread::JoinHandle<()>> {
    let handle = controller.handle().clone();
    let join = thread::Builder::new()
        .name("emuloop-consumer".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let sync = handle.sync();
                if let Some(frame) = sync.frame_available(Duration::from_millis(20)) {
                    let mut stats = stats.lock();
                    stats.frames += 1;
                    stats.last_frame = frame.number;
                    stats.checksum = frame
                        .pixels
                        .iter()
                        .fold(stats.checksum, |sum, byte| sum.rotate_left(5) ^ *byte as u64);
                    drop(stats);
                    sync.consumer_ready();
                } else {
                    thread::sleep(Duration::from_millis(1));
                }
                let audio = sync.consume_audio(4096);
                stats.lock().audio_samples += audio.len() as u64;
            }
        })?;
    Ok(join)
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("emuloop=info".parse()?),
        )
        .with_writer(io::stderr)
        .init();

    info!("emuloop v{}", emuloop_core::VERSION);

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let mut config = match &options.config {
        Some(path) => ThreadConfig::load(path)?,
        None => ThreadConfig::default(),
    };
    if options.fast_forward {
        config.sync.video_sync = false;
        config.sync.drop_frames = true;
    }
    info!(
        "Config: name={}, video_sync={}, drop_frames={}, rewind={} x{} every {}",
        config.name,
        config.sync.video_sync,
        config.sync.drop_frames,
        config.rewind.enabled,
        config.rewind.capacity,
        config.rewind.interval
    );

    let controller = ThreadController::with_machine(ReferenceMachine::default(), config);
    controller.set_callbacks(StopAfter {
        frames: options.frames,
    })?;

    let stop = Arc::new(AtomicBool::new(false));
    let consumer_stats = Arc::new(Mutex::new(ConsumerStats::default()));
    let consumer = spawn_consumer(&controller, stop.clone(), consumer_stats.clone())?;

    let started = Instant::now();
    controller.start()?;
    while !controller.is_paused() && !controller.has_exited() {
        thread::sleep(Duration::from_millis(5));
    }
    let elapsed = started.elapsed();

    if controller.has_crashed() {
        warn!("Execution thread crashed at frame {}", controller.frame_count());
    } else {
        controller.interrupt();
        let machine_info = controller.run_function(|machine| {
            (
                machine.timing().cycles(),
                machine.serviced_interrupts(),
                machine.timing().dma.completed(),
            )
        });
        controller.resume();
        if let Some((cycles, interrupts, dma)) = machine_info {
            info!(
                "Machine: cycles={}, interrupts serviced={}, dma transfers={}",
                cycles, interrupts, dma
            );
        }

        if options.rewind > 0 {
            let from = controller.frame_count();
            if let Some(landed) = controller.rewind_frames(options.rewind) {
                info!("Rewound from frame {} to frame {}", from, landed);
            }
        }
    }

    let frames = controller.frame_count();
    controller.end();
    controller.join();
    stop.store(true, Ordering::Release);
    if consumer.join().is_err() {
        warn!("Consumer thread panicked");
    }

    let sync_stats = controller.sync().stats();
    let rewind_stats = controller.rewind_stats();
    let consumer_stats = consumer_stats.lock();
    let fps = if elapsed.as_secs_f64() > 0.0 {
        frames as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };

    info!(
        "Run complete: frames={}, elapsed={:?}, fps={:.1}, delivered={}, dropped={}, consumed={}",
        frames,
        elapsed,
        fps,
        sync_stats.delivered,
        sync_stats.dropped,
        consumer_stats.frames
    );
    info!(
        "Rewind: {} snapshots ({} captured, {} evicted), {} KB",
        rewind_stats.len,
        rewind_stats.captured,
        rewind_stats.evicted,
        rewind_stats.memory_bytes / 1024
    );

    if options.json {
        let summary = serde_json::json!({
            "frames": frames,
            "elapsed_ms": elapsed.as_millis() as u64,
            "fps": fps,
            "crashed": controller.has_crashed(),
            "sync": {
                "produced": sync_stats.produced,
                "delivered": sync_stats.delivered,
                "dropped": sync_stats.dropped,
                "skipped": sync_stats.skipped,
                "audio_discarded": sync_stats.audio_discarded,
            },
            "consumer": {
                "frames": consumer_stats.frames,
                "last_frame": consumer_stats.last_frame,
                "checksum": consumer_stats.checksum,
                "audio_samples": consumer_stats.audio_samples,
            },
            "rewind": {
                "len": rewind_stats.len,
                "captured": rewind_stats.captured,
                "evicted": rewind_stats.evicted,
                "memory_bytes": rewind_stats.memory_bytes,
                "oldest_frame": rewind_stats.oldest_frame,
                "newest_frame": rewind_stats.newest_frame,
            },
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    if controller.has_crashed() {
        return Err(anyhow::anyhow!("emulation crashed"));
    }
    Ok(())
}
