use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mirra_api::Engine;
use mirra_core::{KindSelection, MirrorConfig, ModifyStrategy, ResourceRef};
use mirra_kubehub::KubeHub;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "mirractl", version, about = "Mirror the objects of one namespace into another")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-addr", env = "MIRRA_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Strategy { CreateFirst, UpdateFirst }

impl From<Strategy> for ModifyStrategy {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::CreateFirst => ModifyStrategy::CreateFirst,
            Strategy::UpdateFirst => ModifyStrategy::UpdateFirst,
        }
    }
}

#[derive(Args, Debug)]
struct KindArgs {
    /// Mirror only this kind, e.g. "deployments.v1.apps" or "configmaps.v1" (repeatable)
    #[arg(long = "kind", env = "MIRRA_KINDS", value_delimiter = ',')]
    kinds: Vec<String>,
    /// Skip this kind when discovering (repeatable)
    #[arg(long = "exclude", env = "MIRRA_EXCLUDE", value_delimiter = ',', conflicts_with = "kinds")]
    exclude: Vec<String>,
}

impl KindArgs {
    fn selection(&self) -> Result<KindSelection> {
        let parse = |v: &[String]| -> Result<Vec<ResourceRef>> {
            v.iter().map(|s| s.parse::<ResourceRef>().with_context(|| format!("invalid kind {:?}", s))).collect()
        };
        if self.kinds.is_empty() {
            Ok(KindSelection::Discover { exclude: parse(&self.exclude)? })
        } else {
            Ok(KindSelection::Fixed(parse(&self.kinds)?))
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror until interrupted
    Run {
        /// Source namespace
        #[arg(long = "from", env = "MIRRA_FROM", default_value = "from")]
        from: String,
        /// Destination namespace
        #[arg(long = "to", env = "MIRRA_TO", default_value = "to")]
        to: String,
        #[command(flatten)]
        kinds: KindArgs,
        /// Seconds between full re-deliveries of the cached source state
        #[arg(long = "resync-secs", env = "MIRRA_RESYNC_SECS", default_value_t = 3600)]
        resync_secs: u64,
        /// Treat a watch silent for this long as broken
        #[arg(long = "watch-idle-secs", env = "MIRRA_WATCH_IDLE_SECS", default_value_t = 300)]
        watch_idle_secs: u64,
        /// Label selector applied to the source, e.g. "app=web"
        #[arg(long = "selector", env = "MIRRA_SELECTOR")]
        selector: Option<String>,
        /// Per-kind event queue capacity
        #[arg(long = "queue-cap", env = "MIRRA_QUEUE_CAP", default_value_t = mirra_core::config::DEFAULT_QUEUE_CAP)]
        queue_cap: usize,
        /// Concurrent writes per kind
        #[arg(long = "max-in-flight", env = "MIRRA_MAX_IN_FLIGHT", default_value_t = mirra_core::config::DEFAULT_MAX_IN_FLIGHT)]
        max_in_flight: usize,
        /// How Modified events are written
        #[arg(long = "modify-strategy", env = "MIRRA_MODIFY_STRATEGY", value_enum, default_value_t = Strategy::CreateFirst)]
        modify_strategy: Strategy,
    },
    /// Print the kinds that would be mirrored
    Discover {
        #[command(flatten)]
        kinds: KindArgs,
    },
}

impl Commands {
    fn config(&self) -> Result<MirrorConfig> {
        match self {
            Commands::Run {
                from,
                to,
                kinds,
                resync_secs,
                watch_idle_secs,
                selector,
                queue_cap,
                max_in_flight,
                modify_strategy,
            } => {
                let mut cfg = MirrorConfig::new(from.as_str(), to.as_str());
                cfg.selection = kinds.selection()?;
                cfg.resync_interval = Duration::from_secs(*resync_secs);
                cfg.watch_idle_timeout = Duration::from_secs(*watch_idle_secs);
                cfg.label_selector = selector.clone().filter(|s| !s.trim().is_empty());
                cfg.queue_cap = *queue_cap;
                cfg.max_in_flight = *max_in_flight;
                cfg.modify_strategy = (*modify_strategy).into();
                Ok(cfg)
            }
            Commands::Discover { kinds } => {
                let mut cfg = MirrorConfig::new("from", "to");
                cfg.selection = kinds.selection()?;
                Ok(cfg)
            }
        }
    }
}

/// Used when `MIRRA_LOG` is unset or unparsable: mirra crates at info, kube/hyper noise at warn.
const DEFAULT_LOG_FILTER: &str = "warn,mirra=info";

fn log_filter(raw: Option<&str>) -> tracing_subscriber::EnvFilter {
    raw.and_then(|s| tracing_subscriber::EnvFilter::from_str(s).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn init_tracing() {
    let raw = std::env::var("MIRRA_LOG").ok();
    tracing_subscriber::fmt().with_env_filter(log_filter(raw.as_deref())).with_target(true).init();
}

/// Prometheus endpoint for the mirror counters. A requested exporter that
/// cannot bind is a startup failure.
fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else { return Ok(()) };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("starting metrics exporter on {}", addr))?;
    info!(addr = %addr, "metrics exporter listening");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received; shutting down"),
        _ = term => info!("SIGTERM received; shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    init_metrics(cli.metrics_addr)?;
    let cfg = cli.command.config()?;

    let hub = Arc::new(KubeHub::try_default().await?);
    let engine = Engine::new(cfg, hub.clone(), hub.clone(), hub);

    match cli.command {
        Commands::Discover { .. } => {
            info!("discover invoked");
            let kinds = engine.discover().await.context("discovering resource kinds")?;
            match cli.output {
                Output::Human => {
                    for k in &kinds {
                        let verbs: Vec<&str> = k.verbs.iter().map(String::as_str).collect();
                        println!("{:<40} {:<24} {}", k.to_string(), k.kind, verbs.join(","));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
        }
        Commands::Run { .. } => {
            let handle = match engine.start().await {
                Ok(h) => h,
                Err(e) => {
                    error!(error = %e, "mirror failed to start");
                    bail!("startup failed: {}", e);
                }
            };
            let reports = handle.run_until(shutdown_signal()).await;
            match cli.output {
                Output::Human => {
                    for r in &reports {
                        info!(kind = %r.kind, handled = r.handled, failed = r.failed, coalesced = r.coalesced, "pipeline stopped");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
            }
        }
    }

    Ok(())
}
