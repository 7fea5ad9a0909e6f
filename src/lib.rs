//! Bidboard Backend Library
//!
//! Keeps an in-memory, forecast-augmented snapshot of the bid hierarchy in
//! sync with the remote database and writes user edits back to it.

pub mod config;
pub mod error;
pub mod models;
pub mod remote;
pub mod schema;
pub mod sync;

pub use config::SyncConfig;
pub use error::{PatchError, WriteBackError};
pub use models::{Dataset, Period, Record};
