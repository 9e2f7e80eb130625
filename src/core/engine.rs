use crate::core::error::DownloadError;
use crate::core::events::{EngineEvent, EventSender, ProgressSink};
use crate::core::model::{BatchId, DownloadItem, DownloadStatus, ItemId};
use crate::core::repository::DownloadRepository;
use crate::core::retry::RetryPolicy;
use crate::core::sanitize::sanitize_filename;
use crate::plugins::registry::{DownloadOutcome, StrategyRequest, StrategyRouter};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub download_root: PathBuf,
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_root: dirs::download_dir().unwrap_or_else(|| PathBuf::from("downloads")),
            max_concurrent: 3,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    fn record(&mut self, status: Option<DownloadStatus>) {
        match status {
            Some(DownloadStatus::Completed) => self.completed += 1,
            Some(DownloadStatus::Failed) => self.failed += 1,
            Some(DownloadStatus::Cancelled) => self.cancelled += 1,
            _ => {}
        }
    }
}

/// A running `start()` call.
pub struct BatchHandle {
    pub batch_id: BatchId,
    pub items: Vec<ItemId>,
    handle: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    pub async fn wait(self) -> BatchSummary {
        match self.handle.await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(batch_id = %self.batch_id, error = %e, "batch task died");
                BatchSummary::default()
            }
        }
    }
}

/// Pulls pending items from the repository and runs each through its routed strategy.
///
/// Items are dispatched in list order; at most `max_concurrent` run at once
/// across every batch. Lifecycle events are awaited on the event channel, so the
/// receiving end must be drained.
#[derive(Clone)]
pub struct DownloadOrchestrator {
    repo: Arc<DownloadRepository>,
    router: Arc<StrategyRouter>,
    config: Arc<EngineConfig>,
    events: EventSender,
    permits: Arc<Semaphore>,
    cancel: Arc<Mutex<CancellationToken>>,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
}

/// Holds a destination for one running item; released on drop.
struct DestinationLease {
    reserved: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl Drop for DestinationLease {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.path);
    }
}

impl DownloadOrchestrator {
    pub fn new(repo: Arc<DownloadRepository>, router: StrategyRouter, config: EngineConfig, events: EventSender) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            repo,
            router: Arc::new(router),
            config: Arc::new(config),
            events,
            permits,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn repository(&self) -> &Arc<DownloadRepository> {
        &self.repo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshots the pending items and processes them in the background.
    pub fn start(&self) -> BatchHandle {
        let batch_id = Uuid::new_v4();
        let items: Vec<ItemId> = self.repo.get_pending().into_iter().map(|i| i.id).collect();
        let token = self.cancel.lock().clone();

        let engine = self.clone();
        let ids = items.clone();
        let handle = tokio::spawn(async move { engine.run_batch(batch_id, ids, token).await });
        BatchHandle { batch_id, items, handle }
    }

    /// Best-effort: running transfers finish their current attempt, nothing new starts.
    pub fn cancel(&self) {
        let mut token = self.cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
        tracing::info!("cancellation requested");
    }

    async fn run_batch(&self, batch_id: BatchId, ids: Vec<ItemId>, token: CancellationToken) -> BatchSummary {
        tracing::info!(batch_id = %batch_id, items = ids.len(), "batch started");
        self.events.send(EngineEvent::BatchStarted { batch_id, items: ids.len() }).await;

        let mut workers: Vec<(ItemId, JoinHandle<()>)> = Vec::with_capacity(ids.len());
        for id in &ids {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                p = self.permits.clone().acquire_owned() => p.ok(),
            };
            let Some(permit) = permit else {
                self.cancel_pending(*id).await;
                continue;
            };

            let engine = self.clone();
            let (id, token) = (*id, token.clone());
            workers.push((id, tokio::spawn(async move { engine.process_item(id, token, permit).await })));
        }

        let mut summary = BatchSummary::default();
        for (id, worker) in workers {
            if let Err(e) = worker.await {
                // A strategy panic must still leave the item in a terminal state.
                tracing::error!(item_id = %id, error = %e, "worker aborted");
                let message = format!("Download failed: worker aborted ({})", e);
                if self.repo.mark_failed(id, message.clone()) {
                    self.status_changed(id, DownloadStatus::Failed).await;
                    self.events.send(EngineEvent::Error { item_id: Some(id), scope: "worker".into(), message }).await;
                }
            }
        }
        for id in &ids {
            summary.record(self.repo.get(*id).map(|i| i.status));
        }

        tracing::info!(batch_id = %batch_id, ?summary, "batch finished");
        self.events
            .send(EngineEvent::BatchFinished { batch_id, completed: summary.completed, failed: summary.failed })
            .await;
        summary
    }

    async fn cancel_pending(&self, id: ItemId) {
        let still_pending = self.repo.get(id).is_some_and(|i| i.status == DownloadStatus::Pending);
        if still_pending && self.repo.mark_cancelled(id) {
            self.status_changed(id, DownloadStatus::Cancelled).await;
        }
    }

    async fn process_item(&self, id: ItemId, token: CancellationToken, _permit: OwnedSemaphorePermit) {
        if token.is_cancelled() {
            self.cancel_pending(id).await;
            return;
        }
        let Some(item) = self.repo.get(id) else {
            tracing::debug!(item_id = %id, "item removed before it started");
            return;
        };
        if !self.repo.claim(id) {
            tracing::debug!(item_id = %id, status = ?item.status, "item not pending, skipping");
            return;
        }
        self.status_changed(id, DownloadStatus::Downloading).await;

        match self.run_strategy(&item, token).await {
            Ok(outcome) => {
                for w in &outcome.warnings {
                    self.events.send(EngineEvent::Info { scope: format!("item({})", item.name), message: w.clone() }).await;
                }
                if self.repo.mark_completed(id) {
                    tracing::info!(item_id = %id, files = outcome.files.len(), "download completed");
                    self.status_changed(id, DownloadStatus::Completed).await;
                } else {
                    tracing::debug!(item_id = %id, "item removed during download");
                }
            }
            Err(DownloadError::Cancelled) => {
                if self.repo.mark_cancelled(id) {
                    self.status_changed(id, DownloadStatus::Cancelled).await;
                }
            }
            Err(e) => {
                tracing::warn!(item_id = %id, kind = ?e.kind(), error = %e, "download failed");
                let message = e.to_string();
                if self.repo.mark_failed(id, message.clone()) {
                    self.status_changed(id, DownloadStatus::Failed).await;
                    self.events
                        .send(EngineEvent::Error { item_id: Some(id), scope: format!("item({})", item.name), message })
                        .await;
                }
            }
        }
    }

    async fn run_strategy(&self, item: &DownloadItem, token: CancellationToken) -> Result<DownloadOutcome, DownloadError> {
        let strategy = self.router.route(&item.url).ok_or_else(|| {
            let host = url::Url::parse(&item.url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| item.url.clone());
            DownloadError::UnsupportedDomain(host)
        })?;
        tracing::info!(item_id = %item.id, strategy = strategy.name(), url = %item.url, "dispatching");

        let lease = self.reserve_destination(&item.name);
        let request = StrategyRequest {
            url: item.url.clone(),
            destination: lease.path.clone(),
            options: item.options.clone(),
            cancel: token,
        };

        let (repo, events, id) = (self.repo.clone(), self.events.clone(), item.id);
        let sink = ProgressSink::new(move |progress, speed| {
            if repo.update_progress(id, progress, speed) {
                events.emit(EngineEvent::Progress { item_id: id, progress, speed_bps: speed });
            }
        });

        let outcome = strategy.download(&request, &sink).await?;
        if outcome.files.is_empty() {
            return Err(DownloadError::Verification(format!("{} reported success without output files", strategy.name())));
        }
        Ok(outcome)
    }

    /// Items whose names sanitize alike must not share a `.part` file, so a
    /// running item's base path gets ` (2)`, ` (3)`... for later claimants.
    fn reserve_destination(&self, name: &str) -> DestinationLease {
        let base = sanitize_filename(name);
        let mut reserved = self.in_flight.lock();
        let mut path = self.config.download_root.join(&base);
        let mut n = 2;
        while reserved.contains(&path) {
            path = self.config.download_root.join(format!("{base} ({n})"));
            n += 1;
        }
        reserved.insert(path.clone());
        DestinationLease { reserved: self.in_flight.clone(), path }
    }

    async fn status_changed(&self, item_id: ItemId, status: DownloadStatus) {
        self.events.send(EngineEvent::ItemStatusChanged { item_id, status }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connectivity::Service;
    use crate::core::error::ErrorKind;
    use crate::core::events::{channel, EventReceiver};
    use crate::plugins::registry::PlatformStrategy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Records start order and peak concurrency, sleeping `delay` per item.
    #[derive(Default)]
    struct Recorder {
        delay: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
        destinations: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl PlatformStrategy for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        fn service(&self) -> Service {
            Service::VideoSite
        }
        async fn download(&self, req: &StrategyRequest, sink: &ProgressSink) -> Result<DownloadOutcome, DownloadError> {
            self.started.lock().push(req.url.clone());
            self.destinations.lock().push(req.destination.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sink.report(50.0, 10.0);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            sink.finish();
            Ok(DownloadOutcome { files: vec![req.destination.clone()], warnings: vec![] })
        }
    }

    struct Scripted(Box<dyn Fn() -> Result<DownloadOutcome, DownloadError> + Send + Sync>);

    fn scripted<F>(f: F) -> Arc<Scripted>
    where
        F: Fn() -> Result<DownloadOutcome, DownloadError> + Send + Sync + 'static,
    {
        Arc::new(Scripted(Box::new(f)))
    }

    #[async_trait]
    impl PlatformStrategy for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn service(&self) -> Service {
            Service::ImagePin
        }
        async fn download(&self, _req: &StrategyRequest, _sink: &ProgressSink) -> Result<DownloadOutcome, DownloadError> {
            (self.0)()
        }
    }

    /// Blocks until released so tests can act while an item is Downloading.
    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PlatformStrategy for Gate {
        fn name(&self) -> &'static str {
            "gate"
        }
        fn service(&self) -> Service {
            Service::ShortPost
        }
        async fn download(&self, req: &StrategyRequest, sink: &ProgressSink) -> Result<DownloadOutcome, DownloadError> {
            self.entered.notify_one();
            self.release.notified().await;
            sink.report(80.0, 0.0);
            Ok(DownloadOutcome { files: vec![req.destination.clone()], warnings: vec![] })
        }
    }

    fn engine(strategy: Arc<dyn PlatformStrategy>, max_concurrent: usize) -> (DownloadOrchestrator, EventReceiver) {
        let mut router = StrategyRouter::new();
        router.add_exact("media.test", strategy);
        let (tx, rx) = channel(1024);
        let config = EngineConfig {
            download_root: std::env::temp_dir().join("media-grabber-engine-tests"),
            max_concurrent,
            retry: RetryPolicy::default(),
        };
        (DownloadOrchestrator::new(Arc::new(DownloadRepository::new()), router, config, tx), rx)
    }

    fn add(e: &DownloadOrchestrator, name: &str, url: &str) -> ItemId {
        let item = DownloadItem::with_defaults(name, url).unwrap();
        let id = item.id;
        e.repository().add(item);
        id
    }

    #[tokio::test]
    async fn dispatches_in_list_order_within_the_cap() {
        let rec = Arc::new(Recorder { delay: Duration::from_millis(30), ..Default::default() });
        let (e, _rx) = engine(rec.clone(), 2);
        for i in 0..5 {
            add(&e, &format!("item{i}"), &format!("https://media.test/{i}"));
        }

        let summary = e.start().wait().await;
        assert_eq!(summary, BatchSummary { completed: 5, failed: 0, cancelled: 0 });
        assert!(rec.peak.load(Ordering::SeqCst) <= 2);
        let started = rec.started.lock().clone();
        let expected: Vec<String> = (0..5).map(|i| format!("https://media.test/{i}")).collect();
        assert_eq!(started, expected);
        for item in e.repository().get_all() {
            assert_eq!(item.status, DownloadStatus::Completed);
            assert_eq!(item.progress, 100.0);
        }
    }

    #[tokio::test]
    async fn same_named_items_get_distinct_destinations() {
        let rec = Arc::new(Recorder { delay: Duration::from_millis(100), ..Default::default() });
        let (e, _rx) = engine(rec.clone(), 2);
        add(&e, "clip", "https://media.test/1");
        add(&e, "clip", "https://media.test/2");

        assert_eq!(e.start().wait().await.completed, 2);
        let mut dests = rec.destinations.lock().clone();
        dests.sort();
        let root = &e.config().download_root;
        assert_eq!(dests, vec![root.join("clip"), root.join("clip (2)")]);
        assert!(e.in_flight.lock().is_empty());
    }

    #[test]
    fn names_colliding_after_sanitizing_are_suffixed_while_held() {
        let (e, _rx) = engine(Arc::new(Recorder::default()), 1);
        let root = e.config().download_root.clone();

        let first = e.reserve_destination("\u{4e2d}\u{6587}");
        let second = e.reserve_destination("\u{65e5}\u{672c}");
        let third = e.reserve_destination("  ");
        assert_eq!(first.path, root.join("download"));
        assert_eq!(second.path, root.join("download (2)"));
        assert_eq!(third.path, root.join("download (3)"));

        drop(first);
        assert_eq!(e.reserve_destination("?").path, root.join("_"));
        assert_eq!(e.reserve_destination("").path, root.join("download"));
    }

    #[tokio::test]
    async fn unknown_host_fails_with_unsupported_domain() {
        let (e, _rx) = engine(Arc::new(Recorder::default()), 1);
        let id = add(&e, "x", "https://unknown-host.example/x");
        let summary = e.start().wait().await;

        assert_eq!(summary.failed, 1);
        let item = e.repository().get(id).unwrap();
        assert_eq!(item.status, DownloadStatus::Failed);
        assert!(item.error_message.unwrap().contains("Unsupported domain"));
    }

    #[tokio::test]
    async fn strategy_errors_keep_their_kind_in_the_message() {
        let s = scripted(|| Err(DownloadError::AuthenticationRequired("log in".into())));
        let (e, mut rx) = engine(s, 1);
        let id = add(&e, "p", "https://media.test/p");
        e.start().wait().await;

        let item = e.repository().get(id).unwrap();
        assert!(item.error_message.unwrap().starts_with("Authentication required"));
        let errors: Vec<_> = rx.drain().into_iter().filter(|ev| matches!(ev, EngineEvent::Error { .. })).collect();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn empty_outcome_is_a_verification_failure() {
        let s = scripted(|| Ok(DownloadOutcome::default()));
        let (e, _rx) = engine(s, 1);
        let id = add(&e, "p", "https://media.test/p");
        e.start().wait().await;
        let msg = e.repository().get(id).unwrap().error_message.unwrap();
        assert!(msg.starts_with("Verification failed"), "{msg}");
    }

    #[tokio::test]
    async fn panicking_strategy_marks_item_failed() {
        let s = scripted(|| panic!("boom"));
        let (e, _rx) = engine(s, 1);
        let id = add(&e, "p", "https://media.test/p");
        let summary = e.start().wait().await;

        assert_eq!(summary.failed, 1);
        let item = e.repository().get(id).unwrap();
        assert_eq!(item.status, DownloadStatus::Failed);
        assert!(item.error_message.unwrap().contains("worker aborted"));
    }

    #[tokio::test]
    async fn cancel_stops_items_that_have_not_started() {
        let gate = Arc::new(Gate::default());
        let (e, _rx) = engine(gate.clone(), 1);
        let first = add(&e, "a", "https://media.test/a");
        let second = add(&e, "b", "https://media.test/b");

        let batch = e.start();
        gate.entered.notified().await;
        e.cancel();
        gate.release.notify_one();
        let summary = batch.wait().await;

        assert_eq!(e.repository().get(first).unwrap().status, DownloadStatus::Completed);
        assert_eq!(e.repository().get(second).unwrap().status, DownloadStatus::Cancelled);
        assert_eq!(summary, BatchSummary { completed: 1, failed: 0, cancelled: 1 });

        // A fresh start after cancel works again.
        assert!(e.repository().requeue(second));
        let again = e.start();
        assert_eq!(again.items, vec![second]);
        gate.entered.notified().await;
        gate.release.notify_one();
        assert_eq!(again.wait().await.completed, 1);
    }

    #[tokio::test]
    async fn removal_during_download_is_harmless() {
        let gate = Arc::new(Gate::default());
        let (e, _rx) = engine(gate.clone(), 1);
        add(&e, "a", "https://media.test/a");

        let batch = e.start();
        gate.entered.notified().await;
        e.repository().remove(&[0]);
        gate.release.notify_one();
        let summary = batch.wait().await;

        assert!(e.repository().is_empty());
        assert_eq!(summary, BatchSummary::default());
    }

    #[tokio::test]
    async fn emits_lifecycle_events() {
        let (e, mut rx) = engine(Arc::new(Recorder::default()), 1);
        let id = add(&e, "a", "https://media.test/a");
        let batch = e.start();
        let batch_id = batch.batch_id;
        batch.wait().await;

        let events = rx.drain();
        assert_eq!(events.first(), Some(&EngineEvent::BatchStarted { batch_id, items: 1 }));
        assert_eq!(events.last(), Some(&EngineEvent::BatchFinished { batch_id, completed: 1, failed: 0 }));
        let statuses: Vec<DownloadStatus> = events
            .iter()
            .filter_map(|ev| match ev {
                EngineEvent::ItemStatusChanged { item_id, status } if *item_id == id => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![DownloadStatus::Downloading, DownloadStatus::Completed]);
        assert!(events.iter().any(|ev| matches!(ev, EngineEvent::Progress { progress, .. } if *progress == 50.0)));
    }

    #[test]
    fn error_kind_is_preserved() {
        assert_eq!(DownloadError::UnsupportedDomain("x".into()).kind(), ErrorKind::UnsupportedDomain);
    }
}
