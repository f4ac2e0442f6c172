use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::{spawn_sweeper, LimiterRegistry, RateLimiter};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Per-key rate limiting for sensitive endpoints")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json), overriding the configuration
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run admission checks for keys in order and print each decision
    Check {
        /// Endpoint family, e.g. `login`
        family: String,
        /// Keys to check; repeat a key to consume its quota
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Drive one limiter from several threads with random keys
    Simulate {
        #[arg(long, default_value = "login")]
        family: String,
        /// Number of distinct keys to draw from
        #[arg(long, default_value_t = 1_000)]
        keys: usize,
        /// Total requests across all threads
        #[arg(long, default_value_t = 100_000)]
        requests: u64,
        #[arg(long, default_value_t = 4)]
        threads: usize,
    },
    /// Read `family key` lines from stdin and answer each one
    Repl,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    family: String,
    requests: u64,
    admitted: u64,
    denied: u64,
    distinct_keys: usize,
    max_buckets: usize,
    peak_buckets: usize,
    final_buckets: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TurnstileConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging)?;

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let registry = LimiterRegistry::from_config(&config)?;

    match cli.command {
        Command::Check { family, keys } => {
            for key in keys {
                let admitted = registry.allow(&family, &key)?;
                println!("{}\t{}", if admitted { "ALLOW" } else { "DENY" }, key);
            }
        }
        Command::Simulate {
            family,
            keys,
            requests,
            threads,
        } => {
            let limiter = registry
                .get(&family)
                .with_context(|| format!("no limiter configured for `{}`", family))?;
            let report = simulate(&family, limiter, keys.max(1), requests, threads.max(1));
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Repl => repl(&config, &registry).await?,
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

fn simulate(
    family: &str,
    limiter: Arc<RateLimiter>,
    keys: usize,
    requests: u64,
    threads: usize,
) -> SimulationReport {
    info!(family, keys, requests, threads, "Starting simulation");

    let admitted = AtomicU64::new(0);
    let peak = AtomicUsize::new(0);
    let per_thread = requests / threads as u64;
    let extra = requests % threads as u64;

    std::thread::scope(|scope| {
        for worker in 0..threads {
            let limiter = &limiter;
            let admitted = &admitted;
            let peak = &peak;
            let quota = per_thread + u64::from((worker as u64) < extra);
            scope.spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..quota {
                    let key = format!("key-{}", rng.gen_range(0..keys));
                    if limiter.allow(&key) {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    }
                    peak.fetch_max(limiter.approximate_bucket_count(), Ordering::Relaxed);
                }
            });
        }
    });

    let admitted = admitted.into_inner();
    SimulationReport {
        family: family.to_string(),
        requests,
        admitted,
        denied: requests - admitted,
        distinct_keys: keys,
        max_buckets: limiter.settings().max_buckets,
        peak_buckets: peak.into_inner(),
        final_buckets: limiter.approximate_bucket_count(),
    }
}

async fn repl(config: &TurnstileConfig, registry: &LimiterRegistry) -> anyhow::Result<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let sweeper = config.sweeper.enabled.then(|| {
        spawn_sweeper(
            registry.limiters(),
            config.sweeper.interval(),
            shutdown_rx.clone(),
        )
    });
    let relay = tokio::spawn(relay_shutdown(os_signal(), shutdown_tx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    info!(families = ?registry.families().collect::<Vec<_>>(), "Reading `family key` lines");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown_rx.changed() => break,
        };
        let Some(line) = line else { break };

        let mut parts = line.split_whitespace();
        let (Some(family), Some(key)) = (parts.next(), parts.next()) else {
            if !line.trim().is_empty() {
                warn!(line = %line, "Expected `family key`");
            }
            continue;
        };

        let reply = match registry.allow(family, key) {
            Ok(true) => format!("ALLOW\t{}\t{}\n", family, key),
            Ok(false) => format!("DENY\t{}\t{}\n", family, key),
            Err(e) => format!("ERROR\t{}\n", e),
        };
        stdout.write_all(reply.as_bytes()).await?;
        stdout.flush().await?;
    }

    // On EOF the relay still owns the sender; dropping it stops the sweeper.
    relay.abort();
    if let Some(handle) = sweeper {
        handle.await?;
    }

    info!(buckets = registry.total_buckets(), "Turnstile stopped");
    Ok(())
}

/// Flip `shutdown` to `true` once `signal` resolves, naming its source.
async fn relay_shutdown<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: Future<Output = &'static str>,
{
    let source = signal.await;
    info!(signal = source, "Shutdown requested, stopping REPL and sweeper");
    let _ = shutdown.send(true);
}

/// Resolve on Ctrl+C or SIGTERM. A handler that cannot be installed never fires.
async fn os_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
