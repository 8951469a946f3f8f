//! uptrail - endpoint uptime and latency monitor
//!
//! Probes HTTP endpoints on a fixed cadence, folds the results into rolling
//! per-endpoint summaries and streams those summaries to live subscribers.
//! The three stages talk over an event channel and can run in one process or
//! as separate processes sharing a NATS broker.

mod aggregator;
mod broker;
mod config;
mod model;
mod probe;
mod scheduler;
mod web;

use aggregator::Aggregator;
use config::{BrokerKind, Config, ConfigError};
use probe::HttpProber;
use scheduler::Scheduler;
use web::Presenter;

use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "uptrail", version, about = "Endpoint uptime and latency monitor")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "UPTRAIL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Address the live feed listens on
    #[arg(long, global = true)]
    listen: Option<String>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Probe endpoints and publish observations
    Agent,
    /// Fold observations into rolling summaries
    Aggregator,
    /// Stream summaries to WebSocket subscribers
    Presenter,
    /// Run every stage in this process
    Standalone,
}

impl Mode {
    fn runs_agent(self) -> bool {
        matches!(self, Mode::Agent | Mode::Standalone)
    }

    fn runs_aggregator(self) -> bool {
        matches!(self, Mode::Aggregator | Mode::Standalone)
    }

    fn runs_presenter(self) -> bool {
        matches!(self, Mode::Presenter | Mode::Standalone)
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        cfg.presenter.listen_addr = listen;
    }
    check_mode(cli.mode, &cfg)?;

    tracing::info!("Starting uptrail in {:?} mode", cli.mode);

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    let channel = broker::connect(&cfg.broker).await?;
    let mut tasks: JoinSet<Result<(), BoxError>> = JoinSet::new();

    // Consumers first so the in-process queues have a reader before probing starts
    if cli.mode.runs_presenter() {
        let presenter = Presenter::new(cfg.presenter.clone());
        spawn_stage(&mut tasks, {
            let (channel, broker, cancel) = (channel.clone(), cfg.broker.clone(), cancel.clone());
            async move { presenter.run(channel, &broker, cancel).await }
        });
    }

    if cli.mode.runs_aggregator() {
        let aggregator = Aggregator::new(cfg.window_size);
        spawn_stage(&mut tasks, {
            let (channel, broker, cancel) = (channel.clone(), cfg.broker.clone(), cancel.clone());
            async move { aggregator.run(channel, &broker, cancel).await }
        });
    }

    if cli.mode.runs_agent() {
        tracing::info!("Request timeout: {:?}", cfg.timeout());
        let prober = HttpProber::new(cfg.timeout())?.with_jitter(cfg.jitter());
        let scheduler = Scheduler::new(
            cfg.endpoints.clone(),
            cfg.interval(),
            Arc::new(prober),
            channel.clone(),
            cfg.broker.observations_topic.clone(),
        );
        spawn_stage(&mut tasks, scheduler.run(cancel.clone()));
    }

    let grace = cfg.shutdown_grace();
    let Some(outcome) = supervise(tasks, &cancel, grace).await else {
        tracing::error!("Components did not stop within {:?}, forcing exit", grace);
        std::process::exit(1);
    };

    channel.close().await;
    tracing::info!("Shutdown complete");
    outcome
}

fn check_mode(mode: Mode, cfg: &Config) -> Result<(), ConfigError> {
    if mode.runs_agent() {
        cfg.require_endpoints()?;
    }
    if mode != Mode::Standalone && cfg.broker.kind == BrokerKind::Memory {
        return Err(ConfigError::Invalid(
            "the memory broker only works in standalone mode; configure broker.kind: nats".to_string(),
        ));
    }
    Ok(())
}

fn spawn_stage<F, E>(tasks: &mut JoinSet<Result<(), BoxError>>, stage: F)
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    tasks.spawn(async move { stage.await.map_err(BoxError::from) });
}

/// Wait until a stage returns or shutdown is requested, then give every
/// stage `grace` from that point to stop.
///
/// Returns `None` when some stage outlived the grace period.
async fn supervise(
    mut tasks: JoinSet<Result<(), BoxError>>,
    cancel: &CancellationToken,
    grace: Duration,
) -> Option<Result<(), BoxError>> {
    let mut outcome = Ok(());

    // Any stage returning ends the process
    tokio::select! {
        Some(joined) = tasks.join_next() => record(&mut outcome, joined),
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            record(&mut outcome, joined);
        }
    })
    .await;

    drained.ok().map(|_| outcome)
}

fn record(
    outcome: &mut Result<(), BoxError>,
    joined: Result<Result<(), BoxError>, tokio::task::JoinError>,
) {
    let result = match joined {
        Ok(result) => result,
        Err(e) => Err(BoxError::from(e)),
    };
    if let Err(e) = result {
        tracing::error!("Stage failed: {}", e);
        if outcome.is_ok() {
            *outcome = Err(e);
        }
    }
}

/// First signal cancels gracefully; a second one exits immediately.
async fn watch_signals(cancel: CancellationToken) {
    shutdown_signal().await;
    tracing::info!("Shutdown requested, stopping components");
    cancel.cancel();

    shutdown_signal().await;
    tracing::warn!("Second signal received, exiting now");
    std::process::exit(130);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
