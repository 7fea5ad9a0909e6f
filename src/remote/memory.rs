//! In-process remote store
//!
//! A JSON tree behind a lock with path-scoped listeners. Used for local runs
//! and tests; it can simulate an outage and counts every call so callers can
//! assert on remote traffic.

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

use super::{path_segments, ChangeEvent, ChangeKind, RemoteStore};

struct Listener {
    path: Vec<String>,
    listen_path: String,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

pub struct MemoryStore {
    root: RwLock<Value>,
    listeners: Mutex<Vec<Listener>>,
    offline: AtomicBool,
    gets: AtomicU64,
    sets: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_root(Value::Null)
    }

    pub fn with_root(root: Value) -> Self {
        Self {
            root: RwLock::new(root),
            listeners: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            gets: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    /// While offline every get/set fails as if the network were down
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Successful and failed `get` calls
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Successful `set` calls
    pub fn set_count(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
    }

    /// Synchronous read, for assertions
    pub fn snapshot(&self, path: &str) -> Option<Value> {
        let root = self.root.read();
        lookup(&root, &path_segments(path)).filter(|v| !v.is_null()).cloned()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::Acquire) {
            return Err(anyhow!("remote store unreachable"));
        }
        Ok(())
    }

    fn write(&self, segments: &[&str], value: Value) {
        let mut root = self.root.write();
        let Some((last, parents)) = segments.split_last() else {
            *root = value;
            return;
        };

        // Scalars (or arrays) along the way are replaced by objects
        let mut node = &mut *root;
        for segment in parents {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let Value::Object(map) = node else {
                return;
            };
            node = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        if let Value::Object(map) = node {
            if value.is_null() {
                map.remove(*last);
            } else {
                map.insert(last.to_string(), value);
            }
        }
    }

    fn notify(&self, segments: &[&str], value: &Value) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| !l.tx.is_closed());

        for listener in listeners.iter() {
            let common = listener
                .path
                .iter()
                .zip(segments.iter())
                .take_while(|(a, b)| a.as_str() == **b)
                .count();

            // Listener path is a prefix of the write: report the relative path
            if common == listener.path.len() {
                let relative = format!("/{}", segments[common..].join("/"));
                let _ = listener.tx.send(ChangeEvent {
                    listen_path: listener.listen_path.clone(),
                    path: relative,
                    kind: ChangeKind::Put,
                    data: value.clone(),
                });
            // Write replaced an ancestor of the listener: report the new subtree
            } else if common == segments.len() {
                let data = {
                    let root = self.root.read();
                    let listened: Vec<&str> = listener.path.iter().map(String::as_str).collect();
                    lookup(&root, &listened).cloned().unwrap_or(Value::Null)
                };
                let _ = listener.tx.send(ChangeEvent {
                    listen_path: listener.listen_path.clone(),
                    path: "/".to_string(),
                    kind: ChangeKind::Put,
                    data,
                });
            }
        }
    }
}

fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = match node {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

#[async_trait::async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.check_online()?;
        Ok(self.snapshot(path))
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        self.check_online()?;
        let segments = path_segments(path);
        self.write(&segments, value.clone());
        self.sets.fetch_add(1, Ordering::Relaxed);
        trace!(path = path, "memory store write");
        self.notify(&segments, &value);
        Ok(())
    }

    async fn listen(&self, path: &str) -> Result<mpsc::UnboundedReceiver<ChangeEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(Listener {
            path: path_segments(path).into_iter().map(str::to_string).collect(),
            listen_path: path.to_string(),
            tx,
        });
        Ok(rx)
    }
}
