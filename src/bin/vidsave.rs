use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use vidsave_engine::config::ConfigStore;
use vidsave_engine::eventlog::EventLog;
use vidsave_engine::history::format_size;
use vidsave_engine::manager::{DownloadEvent, DownloadManager, UI_POLL_INTERVAL};
use vidsave_engine::paths::AppPaths;
use vidsave_engine::ytdlp::{self, YtDlpFetcher};

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut rest: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            other => rest.push(other.to_string()),
        }
        i += 1;
    }

    let base_dir = base_dir
        .or_else(AppPaths::default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    let log = EventLog::new(paths.event_log_path());

    let (command, command_args) = rest
        .split_first()
        .ok_or_else(|| "missing command (try --help)".to_string())?;

    match command.as_str() {
        "download" => download(&paths, log, command_args),
        "history" => history(&paths, log),
        "remove" => remove(&paths, log, command_args),
        "formats" => formats(&paths, command_args),
        "config" => config(&paths, log, command_args),
        "status" => {
            let status = ytdlp::status(&paths);
            println!(
                "{}",
                serde_json::to_string_pretty(&status).map_err(|e| e.to_string())?
            );
            Ok(())
        }
        "install-ytdlp" => {
            println!("yt-dlp: installing...");
            let status = ytdlp::install(&paths).map_err(|e| e.to_string())?;
            println!("yt-dlp: installed ({})", status.bundled_path);
            Ok(())
        }
        other => Err(format!("unknown command: {other} (try --help)")),
    }
}

fn download(paths: &AppPaths, log: EventLog, args: &[String]) -> Result<(), String> {
    let mut urls: Vec<String> = Vec::new();
    let mut quality: Option<String> = None;
    let mut cancel_after: Option<Duration> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--quality" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--quality requires a value".to_string())?;
                quality = Some(v.to_string());
            }
            "--cancel-after" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--cancel-after requires a value".to_string())?;
                let secs: f64 = v
                    .parse()
                    .map_err(|_| format!("invalid --cancel-after value: {v}"))?;
                cancel_after = Some(Duration::from_secs_f64(secs.max(0.0)));
            }
            other if other.starts_with("--") => {
                return Err(format!("unknown download option: {other}"));
            }
            url => urls.push(url.to_string()),
        }
        i += 1;
    }
    if urls.is_empty() {
        return Err("download requires at least one URL".to_string());
    }

    let config = Arc::new(ConfigStore::load(paths.clone(), log.clone()));
    let fetcher = Arc::new(YtDlpFetcher::new(paths.clone()));
    let mut manager = DownloadManager::new(paths, config, fetcher, log);

    for url in &urls {
        match manager.start(url, quality.as_deref()) {
            Ok(id) => println!("[{id}] queued {url}"),
            Err(e) => eprintln!("skipping {url}: {e}"),
        }
    }

    let started = Instant::now();
    let mut failures = 0usize;
    while manager.has_active() {
        if let Some(limit) = cancel_after {
            if started.elapsed() >= limit {
                let n = manager.cancel_all();
                if n > 0 {
                    println!("canceling {n} download(s)");
                }
                cancel_after = None;
            }
        }

        for event in manager.poll() {
            match event {
                DownloadEvent::Started { id, url } => println!("[{id}] started {url}"),
                DownloadEvent::Progress {
                    id,
                    percent,
                    speed_mb_s,
                } => println!("[{id}] {percent:5.1}%  {speed_mb_s:.2} MB/s"),
                DownloadEvent::Completed { id, path } => {
                    println!("[{id}] saved {}", path.to_string_lossy())
                }
                DownloadEvent::Failed { id, error } => {
                    failures += 1;
                    eprintln!("[{id}] failed: {error}");
                }
                DownloadEvent::Canceled { id } => println!("[{id}] canceled"),
            }
        }
        std::thread::sleep(UI_POLL_INTERVAL);
    }

    if failures > 0 {
        return Err(format!("{failures} download(s) failed"));
    }
    Ok(())
}

fn history(paths: &AppPaths, log: EventLog) -> Result<(), String> {
    let store = vidsave_engine::history::HistoryStore::new(paths, log);
    let entries = store.load();
    if entries.is_empty() {
        println!("No downloads yet.");
        return Ok(());
    }
    for entry in entries {
        let size = entry
            .size
            .clone()
            .or_else(|| entry.size_bytes.map(format_size))
            .unwrap_or_else(|| "missing".to_string());
        println!("{}\t{}\t{}", entry.name, size, entry.path);
    }
    Ok(())
}

fn remove(paths: &AppPaths, log: EventLog, args: &[String]) -> Result<(), String> {
    let mut target: Option<String> = None;
    let mut delete_file = false;
    for arg in args {
        match arg.as_str() {
            "--delete-file" => delete_file = true,
            other if other.starts_with("--") => {
                return Err(format!("unknown remove option: {other}"));
            }
            other => target = Some(other.to_string()),
        }
    }
    let target = target.ok_or_else(|| "remove requires a path".to_string())?;

    let store = vidsave_engine::history::HistoryStore::new(paths, log);
    let outcome = store
        .remove(&target, delete_file)
        .map_err(|e| e.to_string())?;
    println!(
        "removed {} entr{}{}",
        outcome.removed_entries,
        if outcome.removed_entries == 1 { "y" } else { "ies" },
        if outcome.file_deleted { ", file deleted" } else { "" }
    );
    Ok(())
}

fn formats(paths: &AppPaths, args: &[String]) -> Result<(), String> {
    let url = args
        .first()
        .ok_or_else(|| "formats requires a URL".to_string())?;
    let url = vidsave_engine::manager::normalize_video_url(url).map_err(|e| e.to_string())?;
    let fetcher = YtDlpFetcher::new(paths.clone());
    let options = fetcher.quality_options(&url).map_err(|e| e.to_string())?;
    for option in options {
        println!(
            "{:<28} {:<40} {:<6} {}",
            option.format_id, option.label, option.extension, option.approx_size
        );
    }
    Ok(())
}

fn config(paths: &AppPaths, log: EventLog, args: &[String]) -> Result<(), String> {
    let store = ConfigStore::load(paths.clone(), log);

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--dir requires a value".to_string())?;
                let dir = store
                    .set_download_dir(&PathBuf::from(v))
                    .map_err(|e| e.to_string())?;
                println!("download dir set to {}", dir.to_string_lossy());
            }
            "--reset-dir" => {
                store.reset_download_dir();
                println!("download dir reset to default");
            }
            "--quality" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--quality requires a value".to_string())?;
                store.set_quality(v);
            }
            other => return Err(format!("unknown config option: {other}")),
        }
        i += 1;
    }

    let effective = store.download_dir().map_err(|e| e.to_string())?;
    let snapshot = store.snapshot();
    println!(
        "download_dir: {}",
        snapshot.download_dir.as_deref().unwrap_or("(default)")
    );
    println!("effective_download_dir: {}", effective.to_string_lossy());
    println!(
        "video_quality: {}",
        if snapshot.video_quality.is_empty() {
            "(best available)"
        } else {
            snapshot.video_quality.as_str()
        }
    );
    Ok(())
}

fn print_help() {
    println!(
        r#"vidsave

Downloads videos with yt-dlp and keeps a local history of finished files.

Usage:
  vidsave [--base-dir <path>] <command> [args]

Commands:
  download <url>... [--quality <fmt>] [--cancel-after <secs>]
                            Download one or more URLs concurrently
  history                   List finished downloads, newest first
  remove <path> [--delete-file]
                            Drop a history entry (and optionally the file)
  formats <url>             List selectable quality options for a URL
  config [--dir <path>] [--reset-dir] [--quality <fmt>]
                            Show or change settings
  status                    Show which yt-dlp will be used
  install-ytdlp             Download the standalone yt-dlp into <base-dir>/tools (Windows)

Options:
  --base-dir <path>   Override base dir (default: $VIDSAVE_HOME, %APPDATA%\vidsave, or ~/.local/share/vidsave)
"#
    );
}
