use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shmem::{frame, SMQueue, ShmemConfig};

#[derive(clap::Parser)]
#[clap(about = "Pushes framed payloads into a shared-memory queue")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmem-publisher.toml")]
    config: String,
    /// Overrides `shmem.name`.
    #[clap(long)]
    name: Option<String>,
    #[clap(long)]
    max_elements: Option<usize>,
    #[clap(long)]
    element_size: Option<usize>,
    /// Stop after this many messages instead of running until a signal.
    #[clap(long)]
    count: Option<u64>,
    /// Leave the queue in place on exit.
    #[clap(long)]
    keep: bool,
    /// Destroy the queue and exit.
    #[clap(long)]
    cleanup: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct PublisherConfig {
    shmem: ShmemConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let opts: Opts = Opts::parse();
    let mut cfg: PublisherConfig = confy::load_path(&opts.config)?;
    if let Some(name) = &opts.name {
        cfg.shmem.name = name.clone();
    }
    if let Some(max_elements) = opts.max_elements {
        cfg.shmem.max_elements = max_elements;
    }
    if let Some(element_size) = opts.element_size {
        cfg.shmem.element_size = element_size;
    }

    if opts.cleanup {
        println!("Cleaning up shared memory...");
        SMQueue::destroy(&cfg.shmem.name)?;
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    // A previous run may have left the queue behind.
    SMQueue::destroy(&cfg.shmem.name)?;
    let mut queue = SMQueue::create_from(&cfg.shmem)?;
    info!(config = ?cfg.shmem, "queue created");
    println!("Publisher started. Press Ctrl+C to stop.");
    println!(
        "Message size: {} bytes, Max elements: {}",
        queue.element_size(),
        queue.max_elements()
    );

    run(&mut queue, &cfg.shmem, opts.count, &shutdown)?;

    println!("\nShutting down publisher...");
    let stats = queue.stats();
    info!(pushed = stats.pushed, dropped = stats.dropped, "publisher finished");
    queue.close();
    if !opts.keep {
        println!("Cleaning up shared memory...");
        SMQueue::destroy(&cfg.shmem.name)?;
    }
    Ok(())
}

/// Fills everything past the frame header once; only the header changes
/// between messages.
fn fill_pattern(body: &mut [u8]) {
    for (i, b) in body.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
}

fn run(
    queue: &mut SMQueue,
    cfg: &ShmemConfig,
    count: Option<u64>,
    shutdown: &AtomicBool,
) -> Result<(), Box<dyn Error>> {
    let mut message = vec![0u8; queue.element_size()];
    let header_size = cfg.header_size.min(message.len());
    fill_pattern(&mut message[header_size..]);
    let interval = Duration::from_millis(cfg.publish_interval_ms);

    let mut counter = 0u64;
    while !shutdown.load(Ordering::Relaxed) && count.map_or(true, |c| counter < c) {
        frame::write_header(&mut message, counter, frame::mono_time_us(), header_size);
        if queue.push(&message)? {
            println!("Published: Message #{}", counter);
        } else {
            println!("Published (with drop): Message #{}", counter);
        }
        counter += 1;
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_fill_skips_nothing() {
        let mut body = vec![0xFF_u8; 600];
        fill_pattern(&mut body);
        assert_eq!(body[0], 0);
        assert_eq!(body[250], 250);
        assert_eq!(body[251], 0);
    }

    #[test]
    fn parses_overrides() {
        let opts = Opts::parse_from(["publisher", "--name", "/other", "--count", "5", "--keep"]);
        assert_eq!(opts.name.as_deref(), Some("/other"));
        assert_eq!(opts.count, Some(5));
        assert!(opts.keep);
        assert!(!opts.cleanup);
        assert_eq!(opts.config, "shmem-publisher.toml");
    }
}
