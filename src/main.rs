use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use frametap::config::{Config, RingMode};
use frametap::poller::Poller;
use frametap::ring::{self, RingWriter, WriteOutcome};
use frametap::session::Session;
use frametap::stats::window::SwapChainStats;
use frametap::synth::{FrameGenerator, CPU_CAPS, GPU_CAPS};

/// Shared-ring frame telemetry pipeline demo.
#[derive(Parser)]
#[command(name = "frametap", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("frametap {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting frametap",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    let (writer, reader) = ring::create(cfg.ring.options()).context("creating frame ring")?;
    writer.set_gpu_caps(GPU_CAPS);
    writer.set_cpu_caps(CPU_CAPS);

    let pid = cfg.producer.process_id;
    let session = Arc::new(Session::new());
    session.open_stream(pid, reader);

    let mut elements = cfg.consumer.query_elements()?;
    let query = session
        .register_query(&mut elements)
        .context("registering frame query")?;
    for el in &elements {
        tracing::debug!(
            metric = %el.metric,
            offset = el.data_offset,
            size = el.data_size,
            "query element",
        );
    }

    // Producer.
    let stop = Arc::new(AtomicBool::new(false));
    let producer = {
        let stop = Arc::clone(&stop);
        let settings = producer_settings(&cfg);
        tokio::task::spawn_blocking(move || produce(writer, settings, stop))
    };

    // Frame-event consumer.
    let poller = Poller::new(
        Arc::clone(&session),
        query,
        pid,
        cfg.consumer.poll_interval,
        cfg.consumer.frames_per_poll,
    )?;
    poller.on_batch(Box::new(|bytes: &[u8], frames: usize| {
        tracing::debug!(frames, bytes = bytes.len(), "frame batch");
    }));
    poller.start();

    // Windowed statistics, once per second.
    let requests = cfg.consumer.stat_requests()?;
    let labels: Vec<String> = cfg
        .consumer
        .stats
        .iter()
        .map(|s| format!("{}:{}", s.metric, s.stat))
        .collect();
    let window = cfg.consumer.window();

    let mut shutdown_rx = shutdown_rx;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                match session.poll_statistics(pid, &requests, &window) {
                    Ok(chains) => println!("{}", stats_line(pid, &labels, &chains)),
                    Err(e) => {
                        tracing::warn!(pid, error = %e, "statistics poll failed");
                        if !session.has_stream(pid) {
                            break;
                        }
                    }
                }

                for (counter, value) in session.stats_snapshot() {
                    tracing::debug!(counter = counter.as_str(), value, "consume counter");
                }
            }
        }
    }

    // Graceful shutdown.
    poller.stop();
    stop.store(true, Ordering::SeqCst);
    producer.await.context("joining producer")?;

    tracing::info!(frames = poller.frames_total(), "frametap stopped");

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}

/// Settings the producer thread needs.
struct ProducerSettings {
    params: frametap::synth::FrameParams,
    qpc_frequency: u64,
    backpressured: bool,
    backpressure_timeout: Duration,
    backpressure_retry: Duration,
}

fn producer_settings(cfg: &Config) -> ProducerSettings {
    ProducerSettings {
        params: cfg.producer.frame_params(),
        qpc_frequency: cfg.ring.qpc_frequency,
        backpressured: cfg.ring.mode == RingMode::Backpressured,
        backpressure_timeout: cfg.ring.backpressure_timeout,
        backpressure_retry: cfg.ring.backpressure_retry,
    }
}

/// Write synthetic frames at the configured rate until `stop` is set.
fn produce(mut writer: RingWriter, cfg: ProducerSettings, stop: Arc<AtomicBool>) {
    let period = Duration::from_secs_f64(1.0 / cfg.params.fps);
    let mut gen = FrameGenerator::new(cfg.params, cfg.qpc_frequency, 1);
    let started = Instant::now();
    let mut evicted = 0u64;
    let mut refused = 0u64;

    tracing::info!(period = ?period, "producer started");

    while !stop.load(Ordering::Relaxed) {
        let frame = gen.next_frame();
        let outcome = if cfg.backpressured {
            writer.write_with_backpressure(&frame, cfg.backpressure_timeout, cfg.backpressure_retry)
        } else {
            writer.write(&frame)
        };

        match outcome {
            Ok(WriteOutcome::Written) => {}
            Ok(WriteOutcome::Evicted) => evicted += 1,
            Ok(WriteOutcome::Full) => refused += 1,
            Err(e) => {
                tracing::warn!(error = %e, "producer write failed");
                break;
            }
        }

        let deadline = started + period.mul_f64(gen.generated() as f64);
        if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
    }

    tracing::info!(
        frames = gen.generated(),
        evicted,
        refused,
        "producer stopping",
    );
    writer.shutdown();
}

/// One JSON line per statistics poll.
fn stats_line(pid: u32, labels: &[String], chains: &[SwapChainStats]) -> String {
    let swap_chains: Vec<serde_json::Value> = chains
        .iter()
        .map(|c| {
            let values: serde_json::Map<String, serde_json::Value> = labels
                .iter()
                .zip(&c.values)
                .map(|(label, v)| (label.clone(), serde_json::json!(v)))
                .collect();
            serde_json::json!({
                "swap_chain_address": format!("{:#x}", c.swap_chain_address),
                "values": values,
            })
        })
        .collect();

    serde_json::json!({
        "pid": pid,
        "swap_chains": swap_chains,
    })
    .to_string()
}
