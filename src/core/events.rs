use crate::core::model::{BatchId, DownloadStatus, ItemId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    BatchStarted { batch_id: BatchId, items: usize },
    BatchFinished { batch_id: BatchId, completed: usize, failed: usize },
    ItemStatusChanged { item_id: ItemId, status: DownloadStatus },
    Progress { item_id: ItemId, progress: f64, speed_bps: f64 },
    Error { item_id: Option<ItemId>, scope: String, message: String },
    Info { scope: String, message: String },
}

/// Producer half of the worker -> UI hand-off. Cheap to clone, one per worker.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EngineEvent>,
}

/// Single consumer owned by the UI loop.
pub struct EventReceiver {
    rx: mpsc::Receiver<EngineEvent>,
}

pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, EventReceiver { rx })
}

impl EventSender {
    /// Lifecycle events wait for room in the queue.
    pub async fn send(&self, event: EngineEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::trace!("event receiver dropped");
        }
    }

    /// Non-blocking send for advisory events (progress). Dropped when the queue is full.
    pub fn emit(&self, event: EngineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(e)) => tracing::trace!(event = ?e, "event queue full, dropping"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl EventReceiver {
    /// Waits until a worker pushes an event. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    /// Everything queued right now, without waiting.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(e) = self.rx.try_recv() {
            out.push(e);
        }
        out
    }
}

/// `(progress 0..=100, speed bytes/s)` callback handed to strategies.
#[derive(Clone)]
pub struct ProgressSink {
    f: Arc<dyn Fn(f64, f64) + Send + Sync>,
}

impl ProgressSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(f64, f64) + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    pub fn report(&self, progress: f64, speed: f64) {
        (self.f)(progress, speed)
    }

    /// Terminal 100% report; strategies without granular progress still call this.
    pub fn finish(&self) {
        self.report(100.0, 0.0)
    }

    /// Sink for part `index` of `count` equal parts, mapped onto this sink's range.
    pub fn part(&self, index: usize, count: usize) -> ProgressSink {
        let count = count.max(1) as f64;
        let offset = index as f64 / count * 100.0;
        let parent = self.clone();
        ProgressSink::new(move |p, s| parent.report(offset + p.clamp(0.0, 100.0) / count, s))
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressSink")
    }
}
