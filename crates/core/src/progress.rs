use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// Upload state of one file, keyed by its source path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub identity: String,
    pub consumed_bytes: i64,
    pub total_bytes: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub total_consumed: i64,
    pub total_size: i64,
}

/// Shared registry of per-file upload progress.
///
/// Every worker writes only the entries of the files it is currently uploading, so the
/// map never sees two writers for one identity. Readers get a consistent sum because
/// `snapshot` holds the same lock as the writers.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    entries: Mutex<HashMap<String, FileProgress>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, FileProgress>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn register(&self, identity: &str, total_bytes: i64) {
        self.lock().insert(
            identity.to_string(),
            FileProgress {
                identity: identity.to_string(),
                consumed_bytes: 0,
                total_bytes,
            },
        );
    }

    pub fn update(&self, identity: &str, consumed_bytes: i64, total_bytes: i64) {
        let mut entries = self.lock();
        let entry = entries
            .entry(identity.to_string())
            .or_insert_with(|| FileProgress {
                identity: identity.to_string(),
                ..FileProgress::default()
            });
        entry.consumed_bytes = consumed_bytes;
        entry.total_bytes = total_bytes;
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        self.lock()
            .values()
            .fold(AggregateSnapshot::default(), |acc, p| AggregateSnapshot {
                total_consumed: acc.total_consumed + p.consumed_bytes,
                total_size: acc.total_size + p.total_bytes,
            })
    }

    pub fn get(&self, identity: &str) -> Option<FileProgress> {
        self.lock().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub phase: String,
    pub files_total: u64,
    pub files_done: u64,
    pub bytes_consumed: i64,
    pub bytes_total: i64,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: UploadProgress);
}

/// Surrounding status line (spinner, stage text). All calls are best-effort.
pub trait StatusDisplay: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    fn update(&self, message: &str);
}

/// Keeps a display paused for as long as the guard lives.
pub(crate) struct PausedDisplay<'a> {
    display: Option<&'a dyn StatusDisplay>,
}

impl<'a> PausedDisplay<'a> {
    pub(crate) fn new(display: Option<&'a dyn StatusDisplay>) -> Self {
        if let Some(d) = display {
            d.pause();
        }
        Self { display }
    }
}

impl Drop for PausedDisplay<'_> {
    fn drop(&mut self) {
        if let Some(d) = self.display {
            d.resume();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn snapshot_sums_all_registered_files() {
        let agg = ProgressAggregator::new();
        agg.register("a.txt", 10);
        agg.register("b.txt", 32);
        agg.update("a.txt", 4, 10);

        assert_eq!(
            agg.snapshot(),
            AggregateSnapshot {
                total_consumed: 4,
                total_size: 42
            }
        );
    }

    #[test]
    fn register_overwrites_and_reset_clears() {
        let agg = ProgressAggregator::new();
        agg.register("a.txt", 10);
        agg.update("a.txt", 10, 10);
        agg.register("a.txt", 12);
        assert_eq!(agg.get("a.txt").unwrap().consumed_bytes, 0);
        assert_eq!(agg.get("a.txt").unwrap().total_bytes, 12);

        agg.reset();
        assert!(agg.is_empty());
        assert_eq!(agg.snapshot(), AggregateSnapshot::default());
    }

    #[test]
    fn concurrent_writers_on_distinct_identities() {
        let agg = Arc::new(ProgressAggregator::new());
        for i in 0..8 {
            agg.register(&format!("f{i}"), 1000);
        }

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    let id = format!("f{i}");
                    for step in 1..=100 {
                        agg.update(&id, step * 10, 1000);
                        let snap = agg.snapshot();
                        assert_eq!(snap.total_size, 8000);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = agg.snapshot();
        assert_eq!(snap.total_consumed, snap.total_size);
        assert_eq!(agg.len(), 8);
    }
}
