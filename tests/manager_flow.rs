use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vidsave_engine::config::ConfigStore;
use vidsave_engine::eventlog::EventLog;
use vidsave_engine::fetch::{FetchControl, FetchRequest, FetchedMedia, MediaFetcher, ProgressUpdate};
use vidsave_engine::manager::{DownloadEvent, DownloadManager, UI_POLL_INTERVAL};
use vidsave_engine::paths::AppPaths;
use vidsave_engine::{EngineError, Result};

/// Behaves like yt-dlp against a URL whose last path segment picks the outcome:
/// `hang-*` runs until canceled, `broken-*` fails, `crash-*` panics, anything else finishes
/// after a few ticks.
struct FakeFetcher;

impl MediaFetcher for FakeFetcher {
    fn fetch(
        &self,
        request: &FetchRequest,
        on_progress: &mut dyn FnMut(&ProgressUpdate) -> FetchControl,
    ) -> Result<FetchedMedia> {
        let title = request
            .url
            .rsplit('/')
            .next()
            .unwrap_or("clip")
            .to_string();
        let part = request
            .output_dir
            .join(format!("{}.mp4.part", request.temp_stem));
        std::fs::write(&part, b"partial")?;

        if title.starts_with("crash") {
            panic!("extractor crashed on {title}");
        }
        if title.starts_with("broken") {
            let _ = std::fs::remove_file(&part);
            return Err(EngineError::DownloadFailed("HTTP Error 404".to_string()));
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut percent = 0.0;
        loop {
            let update = ProgressUpdate {
                percent,
                speed_mb_s: 1.5,
            };
            if on_progress(&update) == FetchControl::Cancel {
                return Err(EngineError::Canceled);
            }
            if !title.starts_with("hang") && percent >= 100.0 {
                break;
            }
            if Instant::now() > deadline {
                return Err(EngineError::DownloadFailed("fake fetch timed out".to_string()));
            }
            percent = (percent + 25.0_f64).min(100.0);
            std::thread::sleep(Duration::from_millis(10));
        }

        let done = request.output_dir.join(format!("{}.mp4", request.temp_stem));
        std::fs::rename(&part, &done)?;
        Ok(FetchedMedia {
            path: done,
            title,
            ext: "mp4".to_string(),
        })
    }
}

fn manager_in(base: &Path) -> (AppPaths, DownloadManager) {
    let paths = AppPaths::new(base.to_path_buf());
    paths.ensure_dirs().expect("ensure dirs");
    let log = EventLog::new(paths.event_log_path());
    let config = Arc::new(ConfigStore::load(paths.clone(), log.clone()));
    let manager = DownloadManager::new(&paths, config, Arc::new(FakeFetcher), log);
    (paths, manager)
}

fn run_until_idle(manager: &mut DownloadManager) -> Vec<DownloadEvent> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut events = Vec::new();
    while manager.has_active() {
        assert!(Instant::now() < deadline, "downloads did not finish in time");
        events.extend(manager.poll());
        std::thread::sleep(UI_POLL_INTERVAL);
    }
    events
}

fn temp_files_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with("vidsave_tmp_"))
                .unwrap_or(false)
        })
        .collect()
}

#[test]
fn completed_download_adds_one_history_entry_for_an_existing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (paths, mut manager) = manager_in(dir.path());

    let id = manager
        .start("https://videos.example.com/watch/My Clip", None)
        .expect("start");
    assert!(manager.is_active(id));

    let events = run_until_idle(&mut manager);

    assert!(matches!(events.first(), Some(DownloadEvent::Started { .. })));
    let terminal: Vec<&DownloadEvent> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    let saved = match terminal[0] {
        DownloadEvent::Completed { path, .. } => path.clone(),
        other => panic!("unexpected terminal event: {other:?}"),
    };
    assert_eq!(saved, paths.default_download_dir().join("My Clip.mp4"));
    assert!(saved.is_file());

    let progress: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));

    let history = manager.snapshot().history;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].name, "My Clip");
    assert!(Path::new(&history[0].path).is_file());
    assert!(temp_files_in(&paths.default_download_dir()).is_empty());
    assert!(!manager.is_active(id));
}

#[test]
fn concurrent_downloads_finish_independently() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_paths, mut manager) = manager_in(dir.path());

    let ids: Vec<u64> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|name| {
            manager
                .start(&format!("https://videos.example.com/{name}"), Some("best"))
                .expect("start")
        })
        .collect();
    assert_eq!(manager.active().len(), 3);

    let events = run_until_idle(&mut manager);
    for id in ids {
        let completed = events
            .iter()
            .filter(|e| e.id() == id && matches!(e, DownloadEvent::Completed { .. }))
            .count();
        assert_eq!(completed, 1, "download {id} should complete once");
    }
    assert_eq!(manager.history_count(), 3);
}

#[test]
fn canceled_download_leaves_no_history_and_no_temp_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (paths, mut manager) = manager_in(dir.path());

    let id = manager
        .start("https://videos.example.com/hang-forever", None)
        .expect("start");
    std::thread::sleep(Duration::from_millis(50));
    manager.cancel(id).expect("cancel");
    assert!(manager.active()[0].cancel_requested);

    let events = run_until_idle(&mut manager);
    assert!(events
        .iter()
        .any(|e| matches!(e, DownloadEvent::Canceled { id: got } if *got == id)));
    assert!(!events
        .iter()
        .any(|e| matches!(e, DownloadEvent::Completed { .. } | DownloadEvent::Failed { .. })));

    assert_eq!(manager.history_count(), 0);
    assert!(temp_files_in(&paths.default_download_dir()).is_empty());
    assert!(matches!(
        manager.cancel(id),
        Err(EngineError::UnknownDownload(got)) if got == id
    ));
}

#[test]
fn failed_download_reports_the_error_and_records_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_paths, mut manager) = manager_in(dir.path());

    manager
        .start("https://videos.example.com/broken-link", None)
        .expect("start");
    let events = run_until_idle(&mut manager);

    let error = events
        .iter()
        .find_map(|e| match e {
            DownloadEvent::Failed { error, .. } => Some(error.clone()),
            _ => None,
        })
        .expect("failed event");
    assert!(error.contains("404"));
    assert_eq!(manager.history_count(), 0);
}

#[test]
fn invalid_urls_are_rejected_before_a_worker_starts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_paths, mut manager) = manager_in(dir.path());

    assert!(matches!(
        manager.start("ftp://example.com/file", None),
        Err(EngineError::InvalidUrl(_))
    ));
    assert!(matches!(
        manager.start("   ", None),
        Err(EngineError::InvalidUrl(_))
    ));
    assert!(!manager.has_active());
}

#[test]
fn missing_configured_folder_falls_back_to_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (paths, mut manager) = manager_in(dir.path());

    let chosen = dir.path().join("chosen");
    manager
        .config()
        .set_download_dir(&chosen)
        .expect("set download dir");
    std::fs::remove_dir_all(&chosen).expect("remove chosen dir");

    manager
        .start("https://videos.example.com/fallback", None)
        .expect("start");
    let events = run_until_idle(&mut manager);

    let saved = events
        .iter()
        .find_map(|e| match e {
            DownloadEvent::Completed { path, .. } => Some(path.clone()),
            _ => None,
        })
        .expect("completed event");
    assert_eq!(saved.parent(), Some(paths.default_download_dir().as_path()));
}

#[test]
fn removing_a_history_entry_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_paths, mut manager) = manager_in(dir.path());

    manager
        .start("https://videos.example.com/keepsake", None)
        .expect("start");
    run_until_idle(&mut manager);

    let entry = manager.snapshot().history[0].clone();
    let first = manager
        .remove_history_entry(&entry.path, true)
        .expect("first remove");
    assert_eq!(first.removed_entries, 1);
    assert!(first.file_deleted);
    assert!(!Path::new(&entry.path).exists());

    let second = manager
        .remove_history_entry(&entry.path, true)
        .expect("second remove");
    assert_eq!(second.removed_entries, 0);
    assert!(!second.file_deleted);
    assert_eq!(manager.history_count(), 0);
}

#[test]
fn shutdown_cancels_running_downloads() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_paths, mut manager) = manager_in(dir.path());

    manager
        .start("https://videos.example.com/hang-a", None)
        .expect("start a");
    manager
        .start("https://videos.example.com/hang-b", None)
        .expect("start b");

    let events = manager.shutdown();
    assert!(!manager.has_active());
    let canceled = events
        .iter()
        .filter(|e| matches!(e, DownloadEvent::Canceled { .. }))
        .count();
    assert_eq!(canceled, 2);
}

#[test]
fn panicking_fetcher_fails_the_download_instead_of_hanging() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_paths, mut manager) = manager_in(dir.path());

    let id = manager
        .start("https://videos.example.com/crash-now", None)
        .expect("start");
    let events = run_until_idle(&mut manager);

    assert!(!manager.is_active(id));
    let terminal: Vec<&DownloadEvent> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    assert!(matches!(
        terminal[0],
        DownloadEvent::Failed { error, .. } if error.contains("panicked")
    ));
    assert_eq!(manager.history_count(), 0);
}
