use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use logtide_hub::{Envelope, Hub};
use logtide_logs::{LiveTail, LogAdapter, LogFilter};

mod config;
mod metrics;

use config::{Config, SourceKind};
use metrics::{MetricsProvider, ProcMetrics, run_metrics_pump};

/// Logtide - fan out host metrics and service logs to live observers
///
/// All output is newline-delimited JSON on stdout; diagnostics go to stderr.
#[derive(Parser, Debug)]
#[command(name = "logtide")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: ./logtide.toml if present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log source, overriding the config file
    #[arg(long, global = true, value_enum)]
    source: Option<SourceKind>,

    /// Directory for the file source, overriding the config file
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// More diagnostics on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream metrics envelopes, and optionally live log envelopes
    Serve {
        /// Also follow the unit's log
        #[arg(long)]
        follow: bool,

        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Print a bounded, filtered slice of a unit's log
    Logs {
        /// Number of most recent lines to read
        #[arg(short = 'n', long)]
        lines: Option<usize>,

        /// Only records newer than this (5m, 1h, 2d or a timestamp)
        #[arg(long)]
        since: Option<String>,

        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Follow a unit's log until interrupted
    Tail {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// List units known to the log source
    Units,
    /// Print one metrics sample
    Metrics,
}

#[derive(ClapArgs, Debug)]
struct FilterArgs {
    /// Unit to read (default from config)
    #[arg(value_name = "UNIT")]
    unit: Option<String>,

    /// Keep only this level (exact token, e.g. ERROR)
    #[arg(short, long)]
    level: Option<String>,

    /// Case-insensitive text to look for in messages
    #[arg(short, long)]
    search: Option<String>,
}

impl FilterArgs {
    fn filter(&self) -> LogFilter {
        let mut filter = LogFilter::new();
        if let Some(level) = &self.level {
            filter = filter.with_level(level);
        }
        if let Some(search) = &self.search {
            filter = filter.with_search(search);
        }
        filter
    }

    fn unit<'a>(&'a self, config: &'a Config) -> &'a str {
        self.unit.as_deref().unwrap_or(&config.unit)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(source) = args.source {
        config.source = source;
    }
    if let Some(dir) = args.log_dir {
        config.log_dir = dir;
    }
    debug!(?config, "configuration loaded");

    let adapter = LogAdapter::new(config.log_source(), config.adapter_config());
    let cancel = cancel_on_ctrl_c();

    match args.command {
        Command::Serve { follow, filter } => serve(&config, adapter, follow, &filter, cancel).await,
        Command::Logs {
            lines,
            since,
            filter,
        } => {
            let mut query = filter
                .filter()
                .with_max_lines(lines.unwrap_or(config.default_lines));
            if let Some(since) = &since {
                query = query.with_since(since);
            }
            let result = adapter.fetch(filter.unit(&config), &query, &cancel).await?;
            print_json(&result)
        }
        Command::Tail { filter } => tail(&config, adapter, &filter, cancel).await,
        Command::Units => {
            let units = adapter.list_units(&cancel).await?;
            print_json(&units)
        }
        Command::Metrics => {
            let snapshot = ProcMetrics::new().sample_now()?;
            print_json(&snapshot)
        }
    }
}

/// Token cancelled on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            trigger.cancel();
        }
    });
    cancel
}

/// Write one value as a JSON line
fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, value).context("failed to encode output")?;
    writeln!(out).context("failed to write output")?;
    out.flush().context("failed to write output")
}

async fn tail(
    config: &Config,
    adapter: LogAdapter,
    filter: &FilterArgs,
    cancel: CancellationToken,
) -> Result<()> {
    let unit = filter.unit(config);
    let mut tail = LiveTail::start(adapter, unit, &filter.filter(), config.hub_config()).await?;
    info!(unit, "tailing");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            entry = tail.recv() => match entry {
                Some(entry) => print_json(entry.as_ref())?,
                None => break,
            },
        }
    }

    if !tail.stop().await {
        warn!(unit, "log source did not stop in time");
    }
    Ok(())
}

async fn serve(
    config: &Config,
    adapter: LogAdapter,
    follow: bool,
    filter: &FilterArgs,
    cancel: CancellationToken,
) -> Result<()> {
    let hub: Hub<Envelope> = Hub::spawn(config.hub_config());
    let mut output = hub.register().await?;

    let pump = {
        let hub = hub.clone();
        let cancel = cancel.clone();
        let interval = config.metrics_interval();
        tokio::spawn(async move {
            let provider = ProcMetrics::new();
            run_metrics_pump(&provider, hub, interval, cancel).await;
        })
    };

    let follower = follow.then(|| {
        let hub = hub.clone();
        let cancel = cancel.clone();
        let unit = filter.unit(config).to_string();
        let filter = filter.filter();
        tokio::spawn(follow_into_hub(adapter, unit, filter, hub, cancel))
    });

    info!(follow, subscribers = hub.subscriber_count(), "serving");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = output.recv() => match envelope {
                Some(envelope) => print_json(envelope.as_ref())?,
                None => {
                    warn!(stats = ?hub.stats(), "output dropped by hub");
                    break;
                }
            },
        }
    }

    cancel.cancel();
    let _ = pump.await;
    if let Some(follower) = follower {
        let _ = follower.await;
    }
    debug!(stats = ?hub.stats(), "hub stopped");
    hub.shutdown();
    Ok(())
}

async fn follow_into_hub(
    adapter: LogAdapter,
    unit: String,
    filter: LogFilter,
    hub: Hub<Envelope>,
    cancel: CancellationToken,
) {
    adapter
        .follow_in_band(
            &unit,
            &filter,
            move |entry| {
                hub.publish(Envelope::Log(entry));
            },
            cancel,
        )
        .await;
}
