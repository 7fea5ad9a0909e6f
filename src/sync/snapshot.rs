//! Snapshot store: the single published dataset
//!
//! Readers get an `Arc<Dataset>` that never changes underneath them. A full
//! reload swaps in a freshly built dataset; a field patch copies the current
//! dataset, edits the copy and swaps it in. Writers are serialized by a small
//! mutex so versions are published in the order they are handed out; readers
//! never take it.

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, trace};

use crate::{error::PatchError, models::Dataset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Empty,
    Ready { version: u64 },
}

#[derive(Default)]
pub struct SnapshotStore {
    current: ArcSwapOption<Dataset>,
    /// Held while a version is assigned and its dataset stored
    writer: Mutex<()>,
    /// Last version handed out; versions start at 1
    version_seq: AtomicU64,
    /// Successful replaces
    replaces: AtomicU64,
    /// Successful patches
    patches: AtomicU64,
}

impl SnapshotStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> SnapshotState {
        let guard = self.current.load();
        match &*guard {
            Some(ds) => SnapshotState::Ready {
                version: ds.version(),
            },
            None => SnapshotState::Empty,
        }
    }

    /// Current dataset, or None before the first successful reload
    #[inline]
    pub fn read(&self) -> Option<Arc<Dataset>> {
        self.current.load_full()
    }

    /// Current dataset, or an empty one before the first successful reload
    pub fn read_or_empty(&self) -> Arc<Dataset> {
        self.read().unwrap_or_else(|| Arc::new(Dataset::empty()))
    }

    /// Publish a complete dataset. Returns the version it was published as.
    pub fn replace(&self, mut dataset: Dataset) -> u64 {
        let records = dataset.len();
        let version = {
            let _writer = self.writer.lock();
            let version = self.next_version();
            dataset.set_version(version);
            self.current.store(Some(Arc::new(dataset)));
            version
        };
        self.replaces.fetch_add(1, Ordering::Relaxed);
        debug!(version, records, "Snapshot replaced");
        version
    }

    /// Set `field` on the record(s) with `record_id` in the visible dataset.
    pub fn patch_field(
        &self,
        record_id: &str,
        field: &str,
        value: Value,
    ) -> Result<u64, PatchError> {
        let version = {
            let _writer = self.writer.lock();
            let Some(current) = self.current.load_full() else {
                return Err(PatchError::Empty);
            };
            if !current.contains(record_id) {
                return Err(PatchError::NotFound {
                    record_id: record_id.to_string(),
                });
            }

            let mut next = Dataset::clone(&current);
            next.set_field(record_id, field, value);
            let version = self.next_version();
            next.set_version(version);
            self.current.store(Some(Arc::new(next)));
            version
        };

        self.patches.fetch_add(1, Ordering::Relaxed);
        trace!(record_id, field, version, "Snapshot patched");
        Ok(version)
    }

    pub fn replace_count(&self) -> u64 {
        self.replaces.load(Ordering::Relaxed)
    }

    pub fn patch_count(&self) -> u64 {
        self.patches.load(Ordering::Relaxed)
    }

    /// Only called with `writer` held
    fn next_version(&self) -> u64 {
        self.version_seq.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{test_support::record, Record};
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn dataset(generation: i64, size: usize) -> Dataset {
        Dataset::new(
            (0..size)
                .map(|i| record(&format!("b{}", i), 2024, 1, json!({ "gen": generation })))
                .collect(),
        )
    }

    #[test]
    fn test_empty_then_ready() {
        let store = SnapshotStore::new();
        assert_eq!(store.state(), SnapshotState::Empty);
        assert!(store.read().is_none());
        assert!(store.read_or_empty().is_empty());

        let v1 = store.replace(dataset(1, 3));
        assert_eq!(store.state(), SnapshotState::Ready { version: v1 });
        let v2 = store.replace(dataset(2, 3));
        assert!(v2 > v1);
        assert_eq!(store.read().unwrap().version(), v2);
    }

    #[test]
    fn test_patch_field() {
        let store = SnapshotStore::new();
        store.replace(dataset(1, 3));

        let before = store.read().unwrap();
        let version = store.patch_field("b1", "물동량 평균", json!(42)).unwrap();

        let after = store.read().unwrap();
        assert_eq!(after.version(), version);
        assert_eq!(after.get("b1").and_then(|r| r.number("물동량 평균")), Some(42.0));
        // Earlier readers keep their unchanged copy
        assert!(before.get("b1").unwrap().field("물동량 평균").is_none());
        assert_eq!(store.patch_count(), 1);
    }

    #[test]
    fn test_patch_soft_failures() {
        let store = SnapshotStore::new();
        assert_eq!(
            store.patch_field("b1", "x", json!(1)),
            Err(PatchError::Empty)
        );

        store.replace(dataset(1, 1));
        let version = store.read().unwrap().version();
        assert_eq!(
            store.patch_field("nope", "x", json!(1)),
            Err(PatchError::NotFound {
                record_id: "nope".to_string()
            })
        );
        // Not-found leaves the dataset untouched
        assert_eq!(store.read().unwrap().version(), version);
        assert_eq!(store.patch_count(), 0);
    }

    #[test]
    fn test_concurrent_replace_never_mixes() {
        let store = SnapshotStore::new();
        store.replace(dataset(0, 64));
        let stop = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..200 {
                        store.replace(dataset(w * 1000 + i, 64));
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut checked = 0u64;
                    while !stop.load(Ordering::Relaxed) || checked == 0 {
                        let ds = store.read().unwrap();
                        let gens: Vec<&serde_json::Value> =
                            ds.records().iter().filter_map(|r| r.field("gen")).collect();
                        assert_eq!(gens.len(), 64);
                        assert!(gens.iter().all(|g| *g == gens[0]), "mixed snapshot");
                        checked += 1;
                    }
                    checked
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            assert!(r.join().unwrap() > 0);
        }
    }

    #[test]
    fn test_concurrent_patch_and_replace() {
        let store = SnapshotStore::new();
        store.replace(dataset(0, 16));

        let patcher = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..500 {
                    let _ = store.patch_field("b3", "물동량 평균", json!(i));
                }
            })
        };
        let replacer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..100 {
                    store.replace(dataset(i, 16));
                }
            })
        };
        patcher.join().unwrap();
        replacer.join().unwrap();

        let ds = store.read().unwrap();
        assert_eq!(ds.len(), 16);
        let gens: Vec<_> = ds.records().iter().map(|r: &Record| r.field("gen").cloned()).collect();
        assert!(gens.iter().all(|g| *g == gens[0]));
    }

    #[test]
    fn test_published_versions_never_go_backwards() {
        let store = SnapshotStore::new();
        store.replace(dataset(0, 8));
        let stop = Arc::new(AtomicBool::new(false));

        let observer = {
            let store = Arc::clone(&store);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut last = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    if let SnapshotState::Ready { version } = store.state() {
                        assert!(version >= last, "version went from {} to {}", last, version);
                        last = version;
                    }
                }
                last
            })
        };

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..300 {
                        if w % 2 == 0 {
                            store.replace(dataset(i, 8));
                        } else {
                            let _ = store.patch_field("b2", "물동량 평균", json!(i));
                        }
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        let last_seen = observer.join().unwrap();

        let final_version = store.read().unwrap().version();
        assert!(last_seen <= final_version);
        assert_eq!(store.replace_count() + store.patch_count(), final_version);
    }
}
