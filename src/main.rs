use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use edgeguard::api::{create_router, AppState};
use edgeguard::client::MitigationClient;
use edgeguard::config::{Cli, Command, Config, KpiArgs, PushBlockArgs};
use edgeguard::decision_log::{DecisionLogger, FileSink, LogFileReader};
use edgeguard::domain::Action;
use edgeguard::engine::RuleMatcher;
use edgeguard::kpi::{KpiAggregator, KpiWindow};
use edgeguard::mitigation::{ExpirySweeper, MitigationPublisher, MitigationRequest};
use edgeguard::observability::{init_tracing, install_recorder};
use edgeguard::policy::{PolicyLoader, PolicyStore, PolicyWatcher, PromotionGate};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.log_json);

    match cli.command {
        Command::Serve(config) => serve(config).await,
        Command::PushBlock(args) => push_block(args).await,
        Command::Kpi(args) => kpi(args),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting edgeguard policy engine"
    );

    let metrics = match install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
            None
        }
    };

    let retry = config.publish_retry();
    let mitigation_config = config.mitigation_config();
    let store = Arc::new(PolicyStore::with_history_limit(
        Action::Allow,
        config.history_limit,
    ));

    // Initial policy; refuse to start without one
    let mut watcher = PolicyWatcher::new(
        PolicyLoader::new(&config.policy_path).with_mitigation_band(mitigation_config.band()),
        store.clone(),
        retry,
        config.policy_reload_interval(),
    );
    let version = watcher
        .load_initial()
        .await
        .with_context(|| format!("failed to load {}", config.policy_path.display()))?;
    info!(path = %config.policy_path.display(), version, "Policy loaded");
    let policy_handle = watcher.start();

    let sweep_handle =
        ExpirySweeper::new(store.clone(), retry, config.sweep_interval()).start();

    let sink = Arc::new(
        FileSink::open(&config.decision_log_path).with_context(|| {
            format!(
                "failed to open decision log {}",
                config.decision_log_path.display()
            )
        })?,
    );
    info!(path = %sink.path().display(), "Decision log opened");
    let (logger, flusher) = DecisionLogger::start(sink.clone(), config.logger_config());

    let state = Arc::new(AppState {
        store: store.clone(),
        matcher: RuleMatcher::new(store.clone()),
        logger: logger.clone(),
        publisher: MitigationPublisher::new(store.clone(), mitigation_config),
        gate: PromotionGate::new(config.approval_token.as_deref())
            .with_mitigation_band(mitigation_config.band()),
        aggregator: KpiAggregator::new(sink),
        retry,
        trusted_proxies: config.trusted_proxies.clone(),
        metrics,
        start_time: Instant::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = config.listen_addr.parse()?;

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    if config.graceful_shutdown {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        axum::serve(listener, app).await?;
    }

    info!("Shutting down...");
    policy_handle.abort();
    sweep_handle.abort();

    // Drain buffered decisions before exiting
    logger.close();
    if tokio::time::timeout(config.shutdown_timeout(), flusher)
        .await
        .is_err()
    {
        warn!("Decision log flush did not finish before the shutdown timeout");
    }

    let stats = logger.stats();
    info!(
        submitted = stats.submitted,
        delivered = stats.delivered,
        dropped = stats.dropped,
        "Shutdown complete"
    );
    Ok(())
}

async fn push_block(args: PushBlockArgs) -> anyhow::Result<()> {
    let client = MitigationClient::new(&args.server, Duration::from_secs(args.timeout_secs))?;

    let mut request = MitigationRequest::new(args.indicator_type.into(), args.indicator);
    if let Some(ttl) = args.ttl {
        request = request.with_ttl(ttl);
    }

    let outcome = client.push_block(&request).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.accepted {
        bail!("mitigation {} was not confirmed active", outcome.rule_id);
    }
    Ok(())
}

fn kpi(args: KpiArgs) -> anyhow::Result<()> {
    let window = KpiWindow::from_millis(args.start, args.end, Utc::now())?;
    let aggregator = KpiAggregator::new(Arc::new(LogFileReader::new(&args.log_path)));

    let snapshot = aggregator
        .aggregate(&window)
        .with_context(|| format!("failed to read {}", args.log_path.display()))?;
    if snapshot.malformed_records > 0 {
        warn!(
            malformed = snapshot.malformed_records,
            "Skipped malformed decision records"
        );
    }

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
