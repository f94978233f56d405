use crate::eventlog::{now_ms, EventLog};
use crate::paths::AppPaths;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub name: String,
    pub path: String,
    pub downloaded_at_ms: i64,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoveOutcome {
    pub removed_entries: usize,
    pub file_deleted: bool,
}

/// JSON array of completed downloads, newest first, rewritten on every mutation.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    log: EventLog,
}

impl HistoryStore {
    pub fn new(paths: &AppPaths, log: EventLog) -> Self {
        Self {
            path: paths.history_path(),
            log,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the history, backfilling sizes of entries whose file is still on disk.
    pub fn load(&self) -> Vec<HistoryEntry> {
        if !self.path.exists() {
            return Vec::new();
        }

        let mut entries = match read_entries(&self.path) {
            Ok(v) => v,
            Err(e) => {
                let _ = self.log.line(
                    "warn",
                    "history_load_failed",
                    serde_json::json!({ "error": e.to_string() }),
                );
                return Vec::new();
            }
        };

        let mut backfilled = false;
        for entry in entries.iter_mut() {
            let missing = entry.size.as_deref().map(str::is_empty).unwrap_or(true);
            if !missing {
                continue;
            }
            if let Ok(meta) = std::fs::metadata(&entry.path) {
                entry.size_bytes = Some(meta.len());
                entry.size = Some(format_size(meta.len()));
                backfilled = true;
            }
        }
        if backfilled {
            self.save(&entries);
        }

        entries
    }

    pub fn count(&self) -> usize {
        self.load().len()
    }

    /// Adds an entry for a file that exists on disk. Any older entry for the same path
    /// is replaced.
    pub fn add(&self, name: &str, path: &Path) -> Result<HistoryEntry> {
        let size_bytes = std::fs::metadata(path)?.len();
        let entry = HistoryEntry {
            name: name.to_string(),
            path: path.to_string_lossy().to_string(),
            downloaded_at_ms: now_ms(),
            size_bytes: Some(size_bytes),
            size: Some(format_size(size_bytes)),
        };

        let mut entries = self.load();
        entries.retain(|e| e.path != entry.path);
        entries.insert(0, entry.clone());
        self.save(&entries);
        Ok(entry)
    }

    /// Records a finished download under the file's stem.
    pub fn record_completed(&self, path: &Path) -> Result<HistoryEntry> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        self.add(&name, path)
    }

    pub fn remove(&self, path: &str, delete_file: bool) -> Result<RemoveOutcome> {
        let mut entries = self.load();
        let before = entries.len();
        entries.retain(|e| e.path != path);
        let removed_entries = before - entries.len();
        if removed_entries > 0 {
            self.save(&entries);
        }

        let mut file_deleted = false;
        if delete_file {
            let target = Path::new(path);
            if target.is_file() {
                std::fs::remove_file(target)?;
                file_deleted = true;
            }
        }

        Ok(RemoveOutcome {
            removed_entries,
            file_deleted,
        })
    }

    fn save(&self, entries: &[HistoryEntry]) {
        if let Err(e) = write_entries(&self.path, entries) {
            let _ = self.log.line(
                "error",
                "history_save_failed",
                serde_json::json!({ "error": e.to_string() }),
            );
        }
    }
}

fn read_entries(path: &Path) -> Result<Vec<HistoryEntry>> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_entries(path: &Path, entries: &[HistoryEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(entries)?;
    std::fs::write(path, format!("{json}\n"))?;
    Ok(())
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes < KB {
        format!("{bytes} B")
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    }
}
