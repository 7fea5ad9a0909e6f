//! Sync controller: fetch -> flatten -> forecast -> publish
//!
//! Reloads are serialized by an async mutex, so at most one is in flight.
//! Change notifications never run a reload inline: they set a dirty flag and
//! wake a single worker task, which keeps reloading until the flag stays
//! clear. A burst of notifications therefore collapses into one or two passes,
//! and the last pass always starts after the last notification.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{
    flatten::{flatten, Overrides},
    forecast::{ForecastGenerator, SeasonalForecast},
    snapshot::SnapshotStore,
};
use crate::{config::SyncConfig, models::Dataset, remote::RemoteStore};

/// Outcome of one successful reload pass
#[derive(Debug, Clone, Serialize)]
pub struct ReloadSummary {
    pub version: u64,
    pub historical: usize,
    pub forecast: usize,
    pub skipped: usize,
    pub overrides_applied: usize,
    pub malformed_overrides: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub notifications: AtomicU64,
    pub reloads_started: AtomicU64,
    pub reloads_completed: AtomicU64,
    pub reloads_failed: AtomicU64,
    /// Requests folded into an already pending reload
    pub reloads_coalesced: AtomicU64,
    /// Malformed leaves/overrides skipped, summed over all reloads
    pub records_skipped: AtomicU64,
}

impl SyncMetrics {
    pub fn summary(&self) -> SyncMetricsSummary {
        SyncMetricsSummary {
            notifications: self.notifications.load(Ordering::Relaxed),
            reloads_started: self.reloads_started.load(Ordering::Relaxed),
            reloads_completed: self.reloads_completed.load(Ordering::Relaxed),
            reloads_failed: self.reloads_failed.load(Ordering::Relaxed),
            reloads_coalesced: self.reloads_coalesced.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncMetricsSummary {
    pub notifications: u64,
    pub reloads_started: u64,
    pub reloads_completed: u64,
    pub reloads_failed: u64,
    pub reloads_coalesced: u64,
    pub records_skipped: u64,
}

pub struct SyncController {
    remote: Arc<dyn RemoteStore>,
    snapshot: Arc<SnapshotStore>,
    forecaster: Arc<dyn ForecastGenerator>,
    config: SyncConfig,
    /// Held for the duration of a reload pass
    reload_lock: Mutex<()>,
    /// Set by notifications, cleared by the worker before each pass
    pending: AtomicBool,
    wake: Notify,
    shutdown: AtomicBool,
    metrics: Arc<SyncMetrics>,
}

impl SyncController {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        snapshot: Arc<SnapshotStore>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Self::with_forecaster(remote, snapshot, Arc::new(SeasonalForecast::default()), config)
    }

    pub fn with_forecaster(
        remote: Arc<dyn RemoteStore>,
        snapshot: Arc<SnapshotStore>,
        forecaster: Arc<dyn ForecastGenerator>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            snapshot,
            forecaster,
            config,
            reload_lock: Mutex::new(()),
            pending: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            metrics: Arc::new(SyncMetrics::default()),
        })
    }

    pub fn snapshot(&self) -> &Arc<SnapshotStore> {
        &self.snapshot
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one full reload and wait for it. Waits for any reload already in
    /// flight first. On error the published snapshot is left untouched.
    pub async fn trigger_reload(&self, reason: &str) -> Result<ReloadSummary> {
        let _guard = self.reload_lock.lock().await;
        self.metrics.reloads_started.fetch_add(1, Ordering::Relaxed);
        debug!(reason, "Reload started");

        match self.reload_pass().await {
            Ok(summary) => {
                self.metrics.reloads_completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    reason,
                    version = summary.version,
                    historical = summary.historical,
                    forecast = summary.forecast,
                    skipped = summary.skipped,
                    elapsed_ms = summary.elapsed_ms,
                    "Dataset reloaded"
                );
                Ok(summary)
            }
            Err(e) => {
                self.metrics.reloads_failed.fetch_add(1, Ordering::Relaxed);
                warn!(reason, error = %e, "Reload abandoned, keeping previous snapshot");
                Err(e)
            }
        }
    }

    /// Ask the worker for a reload. Never blocks; requests made while one is
    /// already pending are folded into it.
    pub fn request_reload(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            self.metrics.reloads_coalesced.fetch_add(1, Ordering::Relaxed);
        }
        self.wake.notify_one();
    }

    /// Subscribe to both remote paths and start the reload worker.
    pub async fn spawn(self: &Arc<Self>) -> Result<SyncHandle> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(3);

        let worker = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            worker.run_worker().await;
        }));

        for path in [self.config.bids_path.clone(), self.config.overrides_path.clone()] {
            let mut rx = match self.remote.listen(&path).await {
                Ok(rx) => rx,
                Err(e) => {
                    for task in &tasks {
                        task.abort();
                    }
                    return Err(e).with_context(|| format!("Failed to listen on {}", path));
                }
            };

            let controller = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    controller.metrics.notifications.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        listen_path = %event.listen_path,
                        path = %event.path,
                        kind = event.kind.as_str(),
                        "Change notification"
                    );
                    controller.request_reload();
                }
                warn!(path = %path, "Change stream closed");
            }));
        }

        info!(
            bids = %self.config.bids_path,
            overrides = %self.config.overrides_path,
            "Change listeners started"
        );

        Ok(SyncHandle {
            controller: Arc::clone(self),
            tasks,
        })
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            self.wake.notified().await;
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            while self.pending.swap(false, Ordering::AcqRel) {
                // Failures are logged in trigger_reload; the next
                // notification retries.
                let _ = self.trigger_reload("change notification").await;
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }
            }
        }
    }

    async fn reload_pass(&self) -> Result<ReloadSummary> {
        let started = Instant::now();

        let (bids, overrides) = tokio::try_join!(
            self.fetch(&self.config.bids_path),
            self.fetch(&self.config.overrides_path)
        )?;

        // Everything below is in-memory and builds a new dataset from scratch
        let overrides = Overrides::from_value(&overrides);
        let flat = flatten(&bids, &overrides);

        let mut records = flat.records;
        let historical = records.len();
        let forecasts = self
            .forecaster
            .generate(&records, self.config.forecast_years);
        let forecast = forecasts.len();
        records.extend(forecasts);

        let dataset = Dataset::new(records);
        debug!(by_year = ?dataset.counts_by_year(), "Records per year");

        let skipped = flat.stats.skipped + overrides.malformed;
        if skipped > 0 {
            warn!(
                leaves = flat.stats.skipped,
                overrides = overrides.malformed,
                "Skipped malformed records"
            );
        }
        self.metrics
            .records_skipped
            .fetch_add(skipped as u64, Ordering::Relaxed);

        let version = self.snapshot.replace(dataset);

        Ok(ReloadSummary {
            version,
            historical,
            forecast,
            skipped: flat.stats.skipped,
            overrides_applied: flat.stats.overrides_applied,
            malformed_overrides: overrides.malformed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Fetch a subtree; anything other than an object/array/absent is a
    /// malformed payload and aborts the reload.
    async fn fetch(&self, path: &str) -> Result<Value> {
        let value = self
            .remote
            .get(path)
            .await
            .with_context(|| format!("Failed to fetch {}", path))?
            .unwrap_or(Value::Null);

        match value {
            Value::Object(_) | Value::Array(_) | Value::Null => Ok(value),
            other => bail!("Malformed payload at {}: expected a collection, got {}", path, other),
        }
    }
}

/// Running listeners + worker. Dropping the handle leaves them running.
pub struct SyncHandle {
    controller: Arc<SyncController>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn controller(&self) -> &Arc<SyncController> {
        &self.controller
    }

    pub fn shutdown(self) {
        self.controller.shutdown.store(true, Ordering::Release);
        self.controller.wake.notify_one();
        for task in &self.tasks {
            task.abort();
        }
        info!("Sync controller stopped");
    }
}
