//! Remote record store contract
//!
//! The dashboard only ever talks to its backing database through three calls:
//! read a subtree, overwrite a subtree, and subscribe to changes under a path.

pub mod firebase;
pub mod memory;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc;

pub use firebase::FirebaseStore;
pub use memory::MemoryStore;

/// Kind of mutation reported by a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Subtree at `path` was overwritten
    Put,
    /// Children of `path` were merged
    Patch,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Put => "put",
            ChangeKind::Patch => "patch",
        }
    }
}

/// One mutation delivered to a listener
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Path the listener was registered on
    pub listen_path: String,
    /// Mutated path, relative to `listen_path` ("/" for the whole subtree)
    pub path: String,
    pub kind: ChangeKind,
    pub data: Value,
}

#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the subtree at `path`. `None` when nothing is stored there.
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Overwrite the subtree at `path` (a JSON `null` deletes it).
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Subscribe to every mutation under `path`. The stream ends when the
    /// receiver is dropped.
    async fn listen(&self, path: &str) -> Result<mpsc::UnboundedReceiver<ChangeEvent>>;
}

/// Split a slash-separated path into its non-empty segments
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Join path segments with a leading slash
pub fn join_path(parent: &str, child: &str) -> String {
    let mut segments = path_segments(parent);
    segments.extend(path_segments(child));
    format!("/{}", segments.join("/"))
}
