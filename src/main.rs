use axum::serve;
use clap::Parser;
use netmond::command::SystemCommandRunner;
use netmond::config::Config;
use netmond::discovery::build_discoverers;
use netmond::entity::now_unix_ms;
use netmond::http;
use netmond::metrics::Metrics;
use netmond::monitor::{Monitor, MonitorState};
use netmond::persist::{JsonSnapshotFile, SnapshotStore};
use netmond::report::{TelegramReporter, TracingReporter};
use reqwest::Client;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::SystemExt;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netmond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Run a single discovery cycle, print the result as JSON and exit.
    #[arg(long, conflicts_with = "capture_nominal")]
    once: bool,
    /// Run a single cycle and save its snapshot as the nominal baseline.
    #[arg(long, value_name = "PATH")]
    capture_nominal: Option<String>,
    #[arg(long, conflicts_with = "telegram_off")]
    telegram_on: bool,
    #[arg(long, conflicts_with = "telegram_on")]
    telegram_off: bool,
}

#[derive(Serialize)]
struct OnceOutput<'a> {
    state: &'a MonitorState,
    transitions: &'a [netmond::report::TransitionReport],
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if cli.telegram_on {
        cfg.telegram.enabled = true;
    } else if cli.telegram_off {
        cfg.telegram.enabled = false;
    }

    let system_name = cfg.system_name.clone().unwrap_or_else(local_host_name);
    let nominal = match &cfg.snapshots.nominal_path {
        Some(path) if cli.capture_nominal.is_none() => {
            match JsonSnapshotFile::new(path).load() {
                Ok(Some(snapshot)) => {
                    info!(path = %path, entries = snapshot.len(), "loaded nominal snapshot");
                    Some(snapshot)
                }
                Ok(None) => {
                    warn!(path = %path, "nominal snapshot not found, drift reporting disabled");
                    None
                }
                Err(err) => {
                    error!(error = %err, "failed to load nominal snapshot");
                    std::process::exit(1);
                }
            }
        }
        _ => None,
    };

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };

    let client = Client::builder()
        .user_agent("netmond/0.1.0")
        .build()
        .unwrap_or_else(|_| Client::new());
    let discoverers = match build_discoverers(&cfg, Arc::new(SystemCommandRunner), client) {
        Ok(d) => d,
        Err(err) => {
            error!(error = %err, "failed to build discoverers");
            std::process::exit(1);
        }
    };

    let shared_state = Arc::new(RwLock::new(
        MonitorState::new(system_name.clone(), now_unix_ms()).with_nominal(nominal),
    ));
    let mut monitor = Monitor::new(
        shared_state.clone(),
        discoverers,
        metrics.clone(),
        Duration::from_millis(cfg.discovery_timeout_ms),
    )
    .with_alert_keys(cfg.alert_keys())
    .with_reporter(Arc::new(TracingReporter));

    if cfg.telegram.enabled {
        match TelegramReporter::from_config(&cfg.telegram) {
            Ok(reporter) => monitor = monitor.with_reporter(Arc::new(reporter)),
            Err(err) => {
                error!(error = %err, "failed to set up Telegram alerts");
                std::process::exit(1);
            }
        }
    }
    if let Some(path) = &cfg.snapshots.current_path {
        monitor = monitor.with_current_store(Arc::new(JsonSnapshotFile::new(path)));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if cli.once || cli.capture_nominal.is_some() {
        let mut shutdown = shutdown_rx.clone();
        let report = monitor.run_cycle(&mut shutdown).await;
        let guard = shared_state.read().await;

        if let Some(path) = &cli.capture_nominal {
            let Some(snapshot) = &guard.last_snapshot else {
                error!("cycle produced no snapshot");
                std::process::exit(1);
            };
            if let Err(err) = JsonSnapshotFile::new(path).save(snapshot) {
                error!(error = %err, "failed to save nominal snapshot");
                std::process::exit(1);
            }
            info!(path = %path, entries = snapshot.len(), "nominal snapshot captured");
            return;
        }

        let out = OnceOutput {
            state: &guard,
            transitions: &report.transitions,
        };
        match serde_json::to_string_pretty(&out) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                error!(error = %err, "failed to serialize cycle result");
                std::process::exit(1);
            }
        }
        return;
    }

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        system = %system_name,
        "starting netmond"
    );

    let http_task = {
        let listen = cfg.listen.clone();
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, http_state);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let monitor_task = {
        let interval = Duration::from_secs(cfg.interval_secs);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { monitor.run(interval, shutdown).await })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = monitor_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn local_host_name() -> String {
    sysinfo::System::new()
        .host_name()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
