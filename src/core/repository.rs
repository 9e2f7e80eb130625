//! Thread-safe store of download items and their lifecycle.
//!
//! One mutex guards the list for the whole read-modify-write of every
//! operation. Readers always get clones. Observers are called after the lock
//! is released, with the snapshot taken under it. Each snapshot carries a
//! revision taken under the same lock, and a snapshot older than the last one
//! delivered is skipped, so observers never end on stale state.

use crate::core::model::{DownloadItem, DownloadStatus, ItemId};
use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Observer = Arc<dyn Fn(&[DownloadItem]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct DownloadRepository {
    items: Mutex<Vec<DownloadItem>>,
    observers: RwLock<Vec<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
    revision: AtomicU64,
    // Reentrant so an observer may call back into the repository.
    delivered: ReentrantMutex<Cell<u64>>,
}

impl DownloadRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, item: DownloadItem) {
        let (rev, snapshot) = {
            let mut items = self.items.lock();
            items.push(item);
            (self.next_revision(), items.clone())
        };
        self.notify(rev, &snapshot);
    }

    /// Removes by position, highest index first. Out-of-range indices are ignored.
    pub fn remove(&self, indices: &[usize]) {
        let mut sorted = indices.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted.dedup();

        let (rev, snapshot) = {
            let mut items = self.items.lock();
            for idx in sorted {
                if idx < items.len() {
                    items.remove(idx);
                }
            }
            (self.next_revision(), items.clone())
        };
        self.notify(rev, &snapshot);
    }

    pub fn clear(&self) {
        let rev = {
            let mut items = self.items.lock();
            items.clear();
            self.next_revision()
        };
        self.notify(rev, &[]);
    }

    pub fn get_all(&self) -> Vec<DownloadItem> {
        self.items.lock().clone()
    }

    pub fn get(&self, id: ItemId) -> Option<DownloadItem> {
        self.items.lock().iter().find(|i| i.id == id).cloned()
    }

    pub fn get_by_status(&self, status: DownloadStatus) -> Vec<DownloadItem> {
        self.items
            .lock()
            .iter()
            .filter(|i| i.status == status)
            .cloned()
            .collect()
    }

    pub fn get_pending(&self) -> Vec<DownloadItem> {
        self.get_by_status(DownloadStatus::Pending)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn add_observer<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&[DownloadItem]) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, Arc::new(callback)));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut obs = self.observers.write();
        let before = obs.len();
        obs.retain(|(oid, _)| *oid != id);
        obs.len() != before
    }

    /// Pending -> Downloading. Only one caller can win for a given item.
    pub fn claim(&self, id: ItemId) -> bool {
        self.mutate(id, |item| {
            if item.status != DownloadStatus::Pending {
                return false;
            }
            item.status = DownloadStatus::Downloading;
            item.progress = 0.0;
            item.speed = 0.0;
            item.error_message = None;
            true
        })
    }

    /// Clamps to 0..=100 and never moves progress backwards while downloading.
    pub fn update_progress(&self, id: ItemId, progress: f64, speed: f64) -> bool {
        self.mutate(id, |item| {
            if item.status != DownloadStatus::Downloading {
                return false;
            }
            let p = if progress.is_finite() { progress.clamp(0.0, 100.0) } else { item.progress };
            if p > item.progress {
                item.progress = p;
            }
            if speed.is_finite() && speed >= 0.0 {
                item.speed = speed;
            }
            true
        })
    }

    pub fn mark_completed(&self, id: ItemId) -> bool {
        self.mutate(id, |item| {
            item.status = DownloadStatus::Completed;
            item.progress = 100.0;
            item.speed = 0.0;
            item.error_message = None;
            item.completed_at = Some(Utc::now());
            true
        })
    }

    pub fn mark_failed(&self, id: ItemId, message: impl Into<String>) -> bool {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "Download failed: unknown error".to_string();
        }
        self.mutate(id, move |item| {
            item.status = DownloadStatus::Failed;
            item.speed = 0.0;
            item.error_message = Some(message);
            item.completed_at = None;
            true
        })
    }

    pub fn mark_cancelled(&self, id: ItemId) -> bool {
        self.mutate(id, |item| {
            if item.status.is_terminal() {
                return false;
            }
            item.status = DownloadStatus::Cancelled;
            item.speed = 0.0;
            true
        })
    }

    /// Puts a failed, cancelled or paused item back in the queue with its progress reset.
    pub fn requeue(&self, id: ItemId) -> bool {
        self.mutate(id, |item| {
            if !matches!(
                item.status,
                DownloadStatus::Failed | DownloadStatus::Cancelled | DownloadStatus::Paused
            ) {
                return false;
            }
            item.status = DownloadStatus::Pending;
            item.progress = 0.0;
            item.speed = 0.0;
            item.error_message = None;
            item.completed_at = None;
            true
        })
    }

    fn mutate<F>(&self, id: ItemId, f: F) -> bool
    where
        F: FnOnce(&mut DownloadItem) -> bool,
    {
        let (rev, snapshot) = {
            let mut items = self.items.lock();
            let Some(item) = items.iter_mut().find(|i| i.id == id) else {
                return false;
            };
            if !f(item) {
                return false;
            }
            (self.next_revision(), items.clone())
        };
        self.notify(rev, &snapshot);
        true
    }

    /// Must be called with `items` locked.
    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn notify(&self, rev: u64, snapshot: &[DownloadItem]) {
        let delivered = self.delivered.lock();
        if rev <= delivered.get() {
            return;
        }
        delivered.set(rev);
        let observers: Vec<Observer> = self.observers.read().iter().map(|(_, o)| o.clone()).collect();
        for obs in observers {
            if catch_unwind(AssertUnwindSafe(|| obs(snapshot))).is_err() {
                tracing::error!("repository observer panicked; continuing");
            }
        }
    }
}
