//! Sync pipeline: remote hierarchy -> flat records -> forecast -> snapshot,
//! plus the write-back path for user edits.

pub mod controller;
pub mod flatten;
pub mod forecast;
pub mod snapshot;
pub mod writeback;

pub use controller::{ReloadSummary, SyncController, SyncHandle, SyncMetrics, SyncMetricsSummary};
pub use flatten::{flatten, FlattenOutput, FlattenStats, Overrides};
pub use forecast::{ForecastGenerator, SeasonalForecast};
pub use snapshot::{SnapshotState, SnapshotStore};
pub use writeback::{WriteAck, WriteBackGateway};
