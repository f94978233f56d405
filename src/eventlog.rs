use crate::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

const EVENT_LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const EVENT_LOG_MAX_BACKUPS: usize = 3;

/// Append-only JSONL event log shared by the stores and the download workers.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&self, level: &str, event: &str, data: serde_json::Value) -> Result<()> {
        self.write(serde_json::json!({
            "ts_ms": now_ms(),
            "level": level,
            "event": event,
            "data": data
        }))
    }

    pub fn download_line(
        &self,
        download_id: u64,
        level: &str,
        event: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        self.write(serde_json::json!({
            "ts_ms": now_ms(),
            "download_id": download_id,
            "level": level,
            "event": event,
            "data": data
        }))
    }

    fn write(&self, value: serde_json::Value) -> Result<()> {
        let line = value.to_string();
        // Workers log concurrently; rotation and append must not interleave.
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        rotate_if_needed(&self.path)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }
}

fn rotate_if_needed(path: &Path) -> Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };

    if len < EVENT_LOG_ROTATE_BYTES {
        return Ok(());
    }

    rotate_file_backups(path, EVENT_LOG_MAX_BACKUPS)?;
    Ok(())
}

fn rotate_file_backups(path: &Path, max_backups: usize) -> std::io::Result<()> {
    if max_backups == 0 {
        let _ = std::fs::remove_file(path);
        return Ok(());
    }

    for i in (1..=max_backups).rev() {
        let dst = path_with_suffix(path, &format!(".{i}"));
        let src = if i == 1 {
            path.to_path_buf()
        } else {
            path_with_suffix(path, &format!(".{}", i - 1))
        };

        if !src.exists() {
            continue;
        }

        if dst.exists() {
            let _ = std::fs::remove_file(&dst);
        }
        std::fs::rename(src, dst)?;
    }
    Ok(())
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let file_name = match path.file_name() {
        Some(n) => n.to_string_lossy().to_string(),
        None => suffix.to_string(),
    };
    path.with_file_name(format!("{file_name}{suffix}"))
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
