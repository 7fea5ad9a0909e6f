//! Bidboard sync service
//!
//! Loads the bid hierarchy from the remote database, keeps the forecast-
//! augmented snapshot current as changes stream in, and logs a periodic
//! status line until Ctrl-C.

use anyhow::{bail, Context, Result};
use bidboard_backend::{
    config::SyncConfig,
    remote::{FirebaseStore, RemoteStore},
    sync::{SnapshotState, SnapshotStore, SyncController, WriteBackGateway},
};
use clap::Parser;
use dotenv::dotenv;
use serde_json::Value;
use std::{path::Path, path::PathBuf, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::interval};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "bidboard")]
#[command(about = "Sync and forecast pipeline for the public bid dashboard")]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(long, env = "BIDBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Number of future years to forecast
    #[arg(long)]
    forecast_years: Option<u32>,

    /// Reload once and exit instead of following changes
    #[arg(long, default_value = "false")]
    once: bool,

    /// With --once, print the dataset rows as JSON to stdout
    #[arg(long, default_value = "false")]
    json: bool,

    /// Send one edit (record id, field, value) and exit
    #[arg(long, num_args = 3, value_names = ["ID", "FIELD", "VALUE"])]
    set: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)?.with_env_overrides(),
        None => SyncConfig::from_env(),
    };
    if let Some(years) = cli.forecast_years {
        config.forecast_years = years;
    }
    config.validate()?;

    info!(
        bids = %config.bids_path,
        overrides = %config.overrides_path,
        forecast_years = config.forecast_years,
        "Bidboard sync starting"
    );

    let remote: Arc<dyn RemoteStore> =
        Arc::new(FirebaseStore::new(&config).context("Failed to build remote store client")?);
    let snapshot = SnapshotStore::new();
    let controller = SyncController::new(Arc::clone(&remote), Arc::clone(&snapshot), config.clone());

    let initial = controller.trigger_reload("startup").await;
    match &initial {
        Ok(summary) => {
            let ds = snapshot.read_or_empty();
            info!(
                version = summary.version,
                historical = summary.historical,
                forecast = summary.forecast,
                latest = ?ds.latest_historical_period().map(|p| p.label()),
                max_year = ?ds.historical().map(|r| r.year()).max(),
                "Initial load complete"
            );
        }
        Err(e) => error!(error = ?e, "Initial load failed"),
    }

    if let Some(args) = cli.set.as_deref() {
        let [id, field, value] = args else {
            bail!("--set takes exactly three values");
        };
        let gateway = WriteBackGateway::new(remote, Arc::clone(&snapshot), &config);
        return match gateway
            .update_field(id, field, &Value::String(value.clone()))
            .await
        {
            Ok(ack) => {
                println!("{}", ack.message());
                Ok(())
            }
            Err(e) => bail!("{}", e),
        };
    }

    if cli.once {
        initial?;
        if cli.json {
            let rows = snapshot.read_or_empty().to_rows();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        return Ok(());
    }

    let handle = controller.spawn().await?;

    let status_task = config
        .status_interval()
        .map(|every| spawn_status_log(Arc::clone(handle.controller()), every));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    if let Some(task) = status_task {
        task.abort();
    }
    handle.shutdown();
    Ok(())
}

fn spawn_status_log(status_controller: Arc<SyncController>, status_every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(status_every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let metrics = status_controller.metrics().summary();
            match status_controller.snapshot().state() {
                SnapshotState::Ready { version } => {
                    let ds = status_controller.snapshot().read_or_empty();
                    info!(
                        version,
                        historical = ds.historical_count(),
                        forecast = ds.forecast_count(),
                        built_at = %ds.built_at(),
                        notifications = metrics.notifications,
                        reloads = metrics.reloads_completed,
                        failed = metrics.reloads_failed,
                        coalesced = metrics.reloads_coalesced,
                        "Status"
                    );
                }
                SnapshotState::Empty => warn!(
                    failed = metrics.reloads_failed,
                    "Status: no snapshot loaded yet"
                ),
            }
        }
    })
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bidboard_backend=info,bidboard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_env() {
    let _ = dotenv();

    // Also try the crate root when started from another directory
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
