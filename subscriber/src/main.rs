use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shmem::{frame, SMQueue, ShmemConfig, ShmemLibError};

/// Transfer times above this are treated as bogus.
const MAX_TRANSFER_MS: f64 = 10_000.0;

#[derive(clap::Parser)]
#[clap(about = "Polls a shared-memory queue and reports transfer latency")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmem-subscriber.toml")]
    config: String,
    /// Overrides `shmem.name`.
    #[clap(long)]
    name: Option<String>,
    /// Stop after this many messages instead of running until a signal.
    #[clap(long)]
    count: Option<u64>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct SubscriberConfig {
    shmem: ShmemConfig,
}

/// Exponential moving average of transfer times.
struct RunningAverage {
    alpha: f64,
    value: Option<f64>,
    samples: u64,
}

impl RunningAverage {
    fn new(alpha: f64) -> Self {
        RunningAverage {
            alpha,
            value: None,
            samples: 0,
        }
    }

    fn add(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(avg) => (1.0 - self.alpha) * avg + self.alpha * sample,
        };
        self.value = Some(next);
        self.samples += 1;
        next
    }
}

/// Tracks message ids and counts breaks in the sequence.
#[derive(Default)]
struct GapTracker {
    expected: Option<u64>,
    gaps: u64,
}

impl GapTracker {
    /// Records `id`; returns the id that was expected if it differs.
    fn observe(&mut self, id: u64) -> Option<u64> {
        let missed = self.expected.filter(|&expected| expected != id);
        if missed.is_some() {
            self.gaps += 1;
        }
        self.expected = Some(id.wrapping_add(1));
        missed
    }

    fn reset(&mut self) {
        self.expected = None;
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let opts: Opts = Opts::parse();
    let mut cfg: SubscriberConfig = confy::load_path(&opts.config)?;
    if let Some(name) = &opts.name {
        cfg.shmem.name = name.clone();
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    let queue = match open_with_retry(&cfg.shmem, &shutdown)? {
        Some(q) => q,
        None => return Ok(()),
    };
    println!("Subscriber started. Press Ctrl+C to stop.");
    println!(
        "Element size: {} bytes, Max elements: {}",
        queue.element_size(),
        queue.max_elements()
    );

    run(queue, &cfg.shmem, opts.count, &shutdown)?;
    println!("\nShutting down subscriber...");
    Ok(())
}

/// Opens the queue, waiting for a publisher to create it.
///
/// Returns `Ok(None)` if shutdown was requested first.
fn open_with_retry(cfg: &ShmemConfig, shutdown: &AtomicBool) -> Result<Option<SMQueue>, ShmemLibError> {
    let poll = Duration::from_micros(cfg.poll_interval_us.max(1_000));
    let mut announced = false;
    while !shutdown.load(Ordering::Relaxed) {
        match SMQueue::open(&cfg.name) {
            Ok(queue) => {
                info!(name = queue.name(), "queue opened");
                return Ok(Some(queue));
            }
            Err(e) if e.is_retryable() => {
                if !announced {
                    info!(name = %cfg.name, "waiting for the queue to be created");
                    announced = true;
                }
                thread::sleep(poll);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

fn run(
    mut queue: SMQueue,
    cfg: &ShmemConfig,
    count: Option<u64>,
    shutdown: &AtomicBool,
) -> Result<(), Box<dyn Error>> {
    let poll = Duration::from_micros(cfg.poll_interval_us);
    let mut buffer = vec![0u8; queue.element_size()];
    let mut average = RunningAverage::new(0.1);
    let mut ids = GapTracker::default();

    while !shutdown.load(Ordering::Relaxed) && count.map_or(true, |c| average.samples < c) {
        let len = match queue.try_pop(&mut buffer) {
            Ok(Some(len)) => len,
            Ok(None) => {
                thread::sleep(poll);
                continue;
            }
            Err(ShmemLibError::SegmentUnavailable { name }) => {
                warn!(%name, "queue was destroyed, reopening");
                queue = match open_with_retry(cfg, shutdown)? {
                    Some(q) => q,
                    None => break,
                };
                buffer.resize(queue.element_size(), 0);
                ids.reset();
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let receive_time = frame::mono_time_us();

        let window = cfg.header_size.min(len);
        let (msg_id, send_time) = match frame::parse_header(&buffer[..window]) {
            Some(v) => v,
            None => {
                warn!(
                    header = %String::from_utf8_lossy(&buffer[..window]),
                    "failed to parse header"
                );
                continue;
            }
        };
        if send_time == 0 || send_time > receive_time {
            warn!(send_time, receive_time, "invalid timestamp");
            continue;
        }
        let transfer_ms = (receive_time - send_time) as f64 / 1000.0;
        if transfer_ms > MAX_TRANSFER_MS {
            warn!(transfer_ms, "suspicious transfer time, ignoring");
            continue;
        }
        if let Some(expected) = ids.observe(msg_id) {
            warn!(expected, got = msg_id, "message id mismatch");
        }

        let avg = average.add(transfer_ms);
        println!("Received: Message #{}", msg_id);
        println!("  Transfer time: {:.3} ms", transfer_ms);
        println!(
            "  Running average: {:.3} ms (over {} messages)",
            avg, average.samples
        );
    }

    let stats = queue.stats();
    info!(
        received = average.samples,
        gaps = ids.gaps,
        skipped = stats.skipped,
        "subscriber finished"
    );
    queue.close();
    Ok(())
}
