//! Hot cache operational binary
//!
//! - `run`: drive a load through a cache backed by the in-memory store and
//!   report throughput, hit rate and flush progress
//! - `check-config`: validate a configuration file and print the effective
//!   settings
//! - `version`
//!
//! # Examples
//!
//! ```bash
//! hotcache run --entries 1000000 --writers 4 --payload-size 256
//! hotcache check-config --config hotcache.toml
//! ```

use clap::{Args, Parser, Subcommand};
use hotcache::storage::MockStore;
use hotcache::{CacheConfig, SharedHotCache};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Ring-buffer hot cache for a message store
#[derive(Parser, Debug)]
#[command(name = "hotcache")]
#[command(version = hotcache::VERSION)]
#[command(about = "Ring-buffer hot cache for a message store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); HOTCACHE_* environment variables override it
    #[arg(short, long, global = true, env = "HOTCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "HOTCACHE_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a load against an in-memory backed cache
    Run(RunArgs),

    /// Validate configuration and print the effective settings
    CheckConfig,

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Total entries to append
    #[arg(short, long, default_value = "100000")]
    entries: u64,

    /// Concurrent writer tasks
    #[arg(short, long, default_value = "4")]
    writers: u64,

    /// Payload size in bytes
    #[arg(long, default_value = "128")]
    payload_size: usize,

    /// Read back every n-th offset after the load
    #[arg(long, default_value = "10")]
    read_every: u64,

    /// Simulated durable store latency per batch (ms)
    #[arg(long, default_value = "0")]
    store_latency_ms: u64,

    /// Print final statistics as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Version needs neither logging nor config
    if let Commands::Version = cli.command {
        println!("hotcache {}", hotcache::VERSION);
        return Ok(());
    }

    setup_logging(&cli)?;
    let config = CacheConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => run_command(config, args).await,
        Commands::CheckConfig => {
            info!("Configuration is valid");
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Version => Ok(()),
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "hotcache.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .compact(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

async fn run_command(config: CacheConfig, args: RunArgs) -> anyhow::Result<()> {
    if args.writers == 0 {
        anyhow::bail!("--writers must be at least 1");
    }

    let store = Arc::new(MockStore::new());
    if args.store_latency_ms > 0 {
        store.set_insert_delay(Some(Duration::from_millis(args.store_latency_ms)));
    }

    let cache: Arc<SharedHotCache<MockStore>> =
        Arc::new(SharedHotCache::<MockStore>::open(config, store.clone()).await?);
    info!(
        entries = args.entries,
        writers = args.writers,
        payload_size = args.payload_size,
        "Starting load"
    );

    let payload = bytes::Bytes::from(vec![0xabu8; args.payload_size]);
    let per_writer = args.entries / args.writers;
    let started = Instant::now();

    let mut handles = Vec::with_capacity(args.writers as usize);
    for writer in 0..args.writers {
        let cache = cache.clone();
        let payload = payload.clone();
        let count = if writer == args.writers - 1 {
            args.entries - per_writer * (args.writers - 1)
        } else {
            per_writer
        };
        handles.push(tokio::spawn(async move {
            let key = bytes::Bytes::from(format!("writer-{}", writer));
            for i in 0..count {
                cache.store(key.clone(), payload.clone())?;
                if i % 4096 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            Ok::<_, hotcache::error::Error>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }
    let elapsed = started.elapsed();
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        per_sec = (args.entries as f64 / elapsed.as_secs_f64().max(1e-9)) as u64,
        "Load complete"
    );

    if args.read_every > 0 {
        let mut served = 0u64;
        let mut offset = 0u64;
        while offset < args.entries {
            if cache.get(offset).await?.is_some() {
                served += 1;
            }
            offset += args.read_every;
        }
        info!(served, "Read back sampled offsets");
    }

    cache.shutdown().await?;
    let stats = cache.stats();
    if stats.flush.overwritten_unflushed > 0 {
        warn!(
            lost = stats.flush.overwritten_unflushed,
            "Entries were overwritten before they could be flushed; consider a larger capacity"
        );
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Appended:             {}", stats.ring.appends);
        println!("Flushed:              {}", stats.flush.entries_flushed);
        println!("Batches:              {}", stats.flush.batches);
        println!("Overwritten unflushed: {}", stats.flush.overwritten_unflushed);
        println!("Durable entries:      {}", store.len());
        println!("Hit rate:             {:.2}%", stats.hit_rate() * 100.0);
    }

    Ok(())
}
