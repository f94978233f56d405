//! Download orchestration.
//!
//! One worker thread per download. Workers never touch shared maps: each one owns its
//! cancellation flag (`Arc<AtomicBool>`) and a clone of the event sender. Everything
//! else (active records, worker handles, flags by id, history writes) belongs to the
//! thread that calls [`DownloadManager::poll`], which is expected to be the UI thread.

use crate::config::ConfigStore;
use crate::eventlog::{now_ms, EventLog};
use crate::fetch::{FetchControl, FetchRequest, MediaFetcher};
use crate::history::{HistoryEntry, HistoryStore, RemoveOutcome};
use crate::paths::AppPaths;
use crate::{media_files, EngineError, Result};
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use url::Url;

/// How often the UI loop is expected to call [`DownloadManager::poll`].
pub const UI_POLL_INTERVAL: Duration = Duration::from_millis(50);

static NEXT_DOWNLOAD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started { id: u64, url: String },
    Progress { id: u64, percent: f64, speed_mb_s: f64 },
    Completed { id: u64, path: PathBuf },
    Failed { id: u64, error: String },
    Canceled { id: u64 },
}

impl DownloadEvent {
    pub fn id(&self) -> u64 {
        match self {
            DownloadEvent::Started { id, .. }
            | DownloadEvent::Progress { id, .. }
            | DownloadEvent::Completed { id, .. }
            | DownloadEvent::Failed { id, .. }
            | DownloadEvent::Canceled { id } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Completed { .. }
                | DownloadEvent::Failed { .. }
                | DownloadEvent::Canceled { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveDownload {
    pub id: u64,
    pub url: String,
    pub quality: Option<String>,
    pub output_dir: PathBuf,
    pub percent: f64,
    pub speed_mb_s: f64,
    pub cancel_requested: bool,
    pub started_at_ms: i64,
}

/// What a UI refresh renders: live rows on top, durable history below.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadsView {
    pub active: Vec<ActiveDownload>,
    pub history: Vec<HistoryEntry>,
}

pub struct DownloadManager {
    config: Arc<ConfigStore>,
    history: HistoryStore,
    fetcher: Arc<dyn MediaFetcher>,
    log: EventLog,
    cleanup_canceled: bool,
    events_tx: Sender<DownloadEvent>,
    events_rx: Receiver<DownloadEvent>,
    active: BTreeMap<u64, ActiveDownload>,
    cancel_flags: BTreeMap<u64, Arc<AtomicBool>>,
    workers: BTreeMap<u64, JoinHandle<()>>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("active", &self.active)
            .field("cleanup_canceled", &self.cleanup_canceled)
            .finish()
    }
}

impl DownloadManager {
    pub fn new(
        paths: &AppPaths,
        config: Arc<ConfigStore>,
        fetcher: Arc<dyn MediaFetcher>,
        log: EventLog,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            config,
            history: HistoryStore::new(paths, log.clone()),
            fetcher,
            log,
            cleanup_canceled: true,
            events_tx,
            events_rx,
            active: BTreeMap::new(),
            cancel_flags: BTreeMap::new(),
            workers: BTreeMap::new(),
        }
    }

    /// Whether temp files of canceled downloads are deleted. On by default.
    pub fn with_temp_cleanup(mut self, enabled: bool) -> Self {
        self.cleanup_canceled = enabled;
        self
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Starts a download on its own worker thread and returns its id.
    ///
    /// `quality` overrides the configured selector; an empty selector means best available.
    pub fn start(&mut self, url: &str, quality: Option<&str>) -> Result<u64> {
        let url = normalize_video_url(url)?;
        let output_dir = self.config.download_dir()?;
        let quality = match quality {
            Some(q) => q.trim().to_string(),
            None => self.config.quality(),
        };
        let quality = if quality.is_empty() { None } else { Some(quality) };

        let id = NEXT_DOWNLOAD_ID.fetch_add(1, Ordering::SeqCst);
        let cancel = Arc::new(AtomicBool::new(false));

        let request = FetchRequest {
            url: url.clone(),
            format: quality.clone(),
            output_dir: output_dir.clone(),
            temp_stem: media_files::temp_stem(id),
        };
        let worker = Worker {
            id,
            request,
            fetcher: self.fetcher.clone(),
            cancel: cancel.clone(),
            events: self.events_tx.clone(),
            log: self.log.clone(),
            cleanup_canceled: self.cleanup_canceled,
        };

        let handle = thread::Builder::new()
            .name(format!("vidsave-download-{id}"))
            .spawn(move || worker.run())?;

        let _ = self.log.download_line(
            id,
            "info",
            "download_queued",
            serde_json::json!({
                "url": redact_url_for_log(&url),
                "quality": quality,
                "output_dir": output_dir.to_string_lossy()
            }),
        );

        self.active.insert(
            id,
            ActiveDownload {
                id,
                url,
                quality,
                output_dir,
                percent: 0.0,
                speed_mb_s: 0.0,
                cancel_requested: false,
                started_at_ms: now_ms(),
            },
        );
        self.cancel_flags.insert(id, cancel);
        self.workers.insert(id, handle);
        Ok(id)
    }

    /// Requests cooperative cancellation. The worker notices at its next progress callback.
    pub fn cancel(&mut self, id: u64) -> Result<()> {
        let flag = self
            .cancel_flags
            .get(&id)
            .ok_or(EngineError::UnknownDownload(id))?;
        flag.store(true, Ordering::SeqCst);
        if let Some(record) = self.active.get_mut(&id) {
            record.cancel_requested = true;
        }
        let _ = self
            .log
            .download_line(id, "info", "cancel_requested", serde_json::json!({}));
        Ok(())
    }

    pub fn cancel_all(&mut self) -> usize {
        let ids: Vec<u64> = self.cancel_flags.keys().copied().collect();
        for id in &ids {
            let _ = self.cancel(*id);
        }
        ids.len()
    }

    pub fn is_active(&self, id: u64) -> bool {
        self.active.contains_key(&id)
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active(&self) -> Vec<ActiveDownload> {
        self.active.values().cloned().collect()
    }

    /// Drains pending worker events without blocking and applies them.
    ///
    /// Returns the applied events in arrival order so the caller can render them.
    pub fn poll(&mut self) -> Vec<DownloadEvent> {
        let mut applied = Vec::new();
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => {
                    if self.apply(&event) {
                        applied.push(event);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        applied
    }

    fn apply(&mut self, event: &DownloadEvent) -> bool {
        let id = event.id();
        if !self.active.contains_key(&id) {
            return false;
        }

        match event {
            DownloadEvent::Started { .. } => {}
            DownloadEvent::Progress {
                percent,
                speed_mb_s,
                ..
            } => {
                if let Some(record) = self.active.get_mut(&id) {
                    record.percent = *percent;
                    record.speed_mb_s = *speed_mb_s;
                }
            }
            DownloadEvent::Completed { path, .. } => {
                if let Err(e) = self.history.record_completed(path) {
                    let _ = self.log.download_line(
                        id,
                        "error",
                        "history_append_failed",
                        serde_json::json!({
                            "path": path.to_string_lossy(),
                            "error": e.to_string()
                        }),
                    );
                }
                self.retire(id);
            }
            DownloadEvent::Failed { .. } | DownloadEvent::Canceled { .. } => {
                self.retire(id);
            }
        }
        true
    }

    fn retire(&mut self, id: u64) {
        self.active.remove(&id);
        self.cancel_flags.remove(&id);
        if let Some(handle) = self.workers.remove(&id) {
            // The terminal event is the worker's last action, so this join is short.
            let _ = handle.join();
        }
    }

    /// Current active rows plus the history as stored on disk.
    pub fn snapshot(&self) -> DownloadsView {
        DownloadsView {
            active: self.active(),
            history: self.history.load(),
        }
    }

    pub fn history_count(&self) -> usize {
        self.history.count()
    }

    pub fn remove_history_entry(&self, path: &str, delete_file: bool) -> Result<RemoveOutcome> {
        let outcome = self.history.remove(path, delete_file)?;
        let _ = self.log.line(
            "info",
            "history_entry_removed",
            serde_json::json!({
                "path": path,
                "removed_entries": outcome.removed_entries,
                "file_deleted": outcome.file_deleted
            }),
        );
        Ok(outcome)
    }

    /// Cancels everything still running and waits for the workers to finish.
    pub fn shutdown(&mut self) -> Vec<DownloadEvent> {
        self.cancel_all();
        let mut applied = Vec::new();
        while self.has_active() {
            match self.events_rx.recv_timeout(UI_POLL_INTERVAL) {
                Ok(event) => {
                    if self.apply(&event) {
                        applied.push(event);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let finished: Vec<u64> = self
                        .workers
                        .iter()
                        .filter(|(_, h)| h.is_finished())
                        .map(|(id, _)| *id)
                        .collect();
                    // A finished worker always posted its terminal event first; drain before retiring.
                    applied.extend(self.poll());
                    for id in finished {
                        self.retire(id);
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        applied
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        for flag in self.cancel_flags.values() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

struct Worker {
    id: u64,
    request: FetchRequest,
    fetcher: Arc<dyn MediaFetcher>,
    cancel: Arc<AtomicBool>,
    events: Sender<DownloadEvent>,
    log: EventLog,
    cleanup_canceled: bool,
}

impl Worker {
    fn run(self) {
        let id = self.id;
        let _ = self.events.send(DownloadEvent::Started {
            id,
            url: self.request.url.clone(),
        });
        let _ = self
            .log
            .download_line(id, "info", "download_started", serde_json::json!({}));

        let outcome = if self.cancel.load(Ordering::SeqCst) {
            Err(EngineError::Canceled)
        } else {
            let cancel = self.cancel.clone();
            let events = self.events.clone();
            let mut on_progress = move |update: &crate::fetch::ProgressUpdate| {
                if cancel.load(Ordering::SeqCst) {
                    return FetchControl::Cancel;
                }
                let _ = events.send(DownloadEvent::Progress {
                    id,
                    percent: update.percent,
                    speed_mb_s: update.speed_mb_s,
                });
                FetchControl::Continue
            };
            let fetched = panic::catch_unwind(AssertUnwindSafe(|| {
                self.fetcher.fetch(&self.request, &mut on_progress)
            }));
            match fetched {
                Ok(result) => result.and_then(|fetched| {
                    media_files::finalize(&fetched, &self.request.output_dir, id)
                }),
                Err(payload) => Err(EngineError::DownloadFailed(format!(
                    "download worker panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            }
        };

        let terminal = match outcome {
            Ok(path) => {
                let _ = self.log.download_line(
                    id,
                    "info",
                    "download_completed",
                    serde_json::json!({ "path": path.to_string_lossy() }),
                );
                DownloadEvent::Completed { id, path }
            }
            Err(EngineError::Canceled) => {
                let removed = if self.cleanup_canceled {
                    media_files::cleanup_temp_files(&self.request.output_dir, id).unwrap_or(0)
                } else {
                    0
                };
                let _ = self.log.download_line(
                    id,
                    "info",
                    "download_canceled",
                    serde_json::json!({ "temp_files_removed": removed }),
                );
                DownloadEvent::Canceled { id }
            }
            Err(e) => {
                let error = e.to_string();
                let _ = self.log.download_line(
                    id,
                    "error",
                    "download_failed",
                    serde_json::json!({ "error": error }),
                );
                DownloadEvent::Failed { id, error }
            }
        };

        let _ = self.events.send(terminal);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Accepts pasted http(s) links; surrounding whitespace is ignored.
pub fn normalize_video_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidUrl("URL is empty".to_string()));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|e| EngineError::InvalidUrl(format!("{e}: {}", redact_url_for_log(trimmed))))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(EngineError::InvalidUrl(format!(
            "unsupported URL scheme {}; only http/https are allowed",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(EngineError::InvalidUrl("URL is missing host".to_string()));
    }
    Ok(trimmed.to_string())
}

fn redact_url_for_log(value: &str) -> String {
    match Url::parse(value.trim()) {
        Ok(url) => format!(
            "{}://{}/...",
            url.scheme(),
            url.host_str().unwrap_or("unknown-host")
        ),
        Err(_) => "[invalid-url]".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchedMedia, ProgressUpdate};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl MediaFetcher for CountingFetcher {
        fn fetch(
            &self,
            _request: &FetchRequest,
            _on_progress: &mut dyn FnMut(&ProgressUpdate) -> FetchControl,
        ) -> Result<FetchedMedia> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::DownloadFailed("should not run".to_string()))
        }
    }

    struct PanickingFetcher;

    impl MediaFetcher for PanickingFetcher {
        fn fetch(
            &self,
            _request: &FetchRequest,
            _on_progress: &mut dyn FnMut(&ProgressUpdate) -> FetchControl,
        ) -> Result<FetchedMedia> {
            panic!("extractor blew up");
        }
    }

    fn worker_for(
        dir: &std::path::Path,
        fetcher: Arc<dyn MediaFetcher>,
        canceled: bool,
    ) -> (Worker, Receiver<DownloadEvent>) {
        let (tx, rx) = mpsc::channel();
        let worker = Worker {
            id: 42,
            request: FetchRequest {
                url: "https://videos.example.com/clip".to_string(),
                format: None,
                output_dir: dir.to_path_buf(),
                temp_stem: media_files::temp_stem(42),
            },
            fetcher,
            cancel: Arc::new(AtomicBool::new(canceled)),
            events: tx,
            log: EventLog::new(dir.join("events.jsonl")),
            cleanup_canceled: true,
        };
        (worker, rx)
    }

    #[test]
    fn worker_canceled_before_start_skips_the_fetcher() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = Arc::new(CountingFetcher::default());
        let (worker, rx) = worker_for(dir.path(), fetcher.clone(), true);

        worker.run();

        let events: Vec<DownloadEvent> = rx.try_iter().collect();
        assert!(matches!(events[0], DownloadEvent::Started { id: 42, .. }));
        assert_eq!(events[1], DownloadEvent::Canceled { id: 42 });
        assert_eq!(events.len(), 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn worker_panic_becomes_a_failed_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (worker, rx) = worker_for(dir.path(), Arc::new(PanickingFetcher), false);

        worker.run();

        let terminal: Vec<DownloadEvent> = rx.try_iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        match &terminal[0] {
            DownloadEvent::Failed { id, error } => {
                assert_eq!(*id, 42);
                assert!(error.contains("extractor blew up"));
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[test]
    fn poll_ignores_events_for_unknown_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let log = EventLog::new(paths.event_log_path());
        let config = Arc::new(ConfigStore::load(paths.clone(), log.clone()));
        let mut manager =
            DownloadManager::new(&paths, config, Arc::new(CountingFetcher::default()), log);

        manager
            .events_tx
            .send(DownloadEvent::Completed {
                id: u64::MAX,
                path: dir.path().join("ghost.mp4"),
            })
            .expect("send");
        manager
            .events_tx
            .send(DownloadEvent::Progress {
                id: u64::MAX,
                percent: 10.0,
                speed_mb_s: 1.0,
            })
            .expect("send");

        assert!(manager.poll().is_empty());
        assert!(!manager.has_active());
        assert_eq!(manager.history_count(), 0);
    }

    #[test]
    fn normalize_video_url_allows_http_https_only() {
        assert!(normalize_video_url("https://www.youtube.com/watch?v=abc").is_ok());
        assert!(normalize_video_url("  http://example.com/v  ").is_ok());
        assert!(normalize_video_url("ftp://example.com/v.mp4").is_err());
        assert!(normalize_video_url("file:///tmp/v.mp4").is_err());
        assert!(normalize_video_url("").is_err());
        assert!(normalize_video_url("not a url").is_err());
    }

    #[test]
    fn redact_keeps_only_scheme_and_host() {
        assert_eq!(
            redact_url_for_log("https://www.youtube.com/watch?v=secret"),
            "https://www.youtube.com/..."
        );
        assert_eq!(redact_url_for_log("::"), "[invalid-url]");
    }

    #[test]
    fn event_ids_and_terminal_flags() {
        let started = DownloadEvent::Started {
            id: 3,
            url: "https://example.com".to_string(),
        };
        let done = DownloadEvent::Canceled { id: 4 };
        assert_eq!(started.id(), 3);
        assert!(!started.is_terminal());
        assert_eq!(done.id(), 4);
        assert!(done.is_terminal());
    }

    #[test]
    fn events_serialize_with_a_kind_tag() {
        let event = DownloadEvent::Progress {
            id: 1,
            percent: 50.0,
            speed_mb_s: 2.5,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["kind"], "progress");
        assert_eq!(json["percent"], 50.0);
    }
}
