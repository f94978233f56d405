use crate::eventlog::EventLog;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const WRITE_PROBE_FILE_NAME: &str = ".vidsave-write-probe";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// User-chosen destination; `None` means the default folder under the base dir.
    #[serde(default)]
    pub download_dir: Option<String>,
    /// yt-dlp format selector. Empty means best available.
    #[serde(default)]
    pub video_quality: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    DownloadDir(PathBuf),
    Quality(String),
}

type Observer = Box<dyn Fn(&ConfigChange) + Send + Sync>;

pub struct ConfigStore {
    paths: AppPaths,
    log: EventLog,
    current: Mutex<AppConfig>,
    observers: Mutex<Vec<Observer>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.paths.config_path())
            .field("current", &self.snapshot())
            .finish()
    }
}

impl ConfigStore {
    /// Loads `settings.json`. A missing or unreadable file yields defaults.
    pub fn load(paths: AppPaths, log: EventLog) -> Self {
        let path = paths.config_path();
        let current = if !path.exists() {
            AppConfig::default()
        } else {
            match read_config(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    let _ = log.line(
                        "warn",
                        "config_load_failed",
                        serde_json::json!({
                            "path": path.to_string_lossy(),
                            "error": e.to_string()
                        }),
                    );
                    AppConfig::default()
                }
            }
        };

        Self {
            paths,
            log,
            current: Mutex::new(current),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> AppConfig {
        self.lock().clone()
    }

    pub fn quality(&self) -> String {
        self.lock().video_quality.clone()
    }

    pub fn configured_download_dir(&self) -> Option<PathBuf> {
        self.lock()
            .download_dir
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.paths.default_download_dir()
    }

    /// Effective destination folder.
    ///
    /// The configured folder wins only when it exists, is a directory and accepts writes.
    /// Otherwise the default folder is used and created on demand.
    pub fn download_dir(&self) -> Result<PathBuf> {
        if let Some(configured) = self.configured_download_dir() {
            match check_usable_dir(&configured) {
                Ok(()) => return Ok(configured),
                Err(reason) => {
                    let _ = self.log.line(
                        "warn",
                        "download_dir_fallback",
                        serde_json::json!({
                            "configured": configured.to_string_lossy(),
                            "reason": reason
                        }),
                    );
                }
            }
        }

        let default_dir = self.paths.default_download_dir();
        std::fs::create_dir_all(&default_dir)?;
        Ok(default_dir)
    }

    pub fn set_download_dir(&self, dir: &Path) -> Result<PathBuf> {
        let dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(dir)
        };
        std::fs::create_dir_all(&dir).map_err(|e| EngineError::InvalidDownloadDir {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        check_usable_dir(&dir).map_err(|reason| EngineError::InvalidDownloadDir {
            path: dir.clone(),
            reason,
        })?;

        self.lock().download_dir = Some(dir.to_string_lossy().to_string());
        self.persist();
        self.notify(&ConfigChange::DownloadDir(dir.clone()));
        Ok(dir)
    }

    pub fn reset_download_dir(&self) {
        self.lock().download_dir = None;
        self.persist();
        self.notify(&ConfigChange::DownloadDir(self.paths.default_download_dir()));
    }

    pub fn set_quality(&self, selector: &str) {
        let selector = selector.trim().to_string();
        self.lock().video_quality = selector.clone();
        self.persist();
        self.notify(&ConfigChange::Quality(selector));
    }

    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&ConfigChange) + Send + Sync + 'static,
    {
        self.observers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Box::new(observer));
    }

    fn notify(&self, change: &ConfigChange) {
        let observers = self.observers.lock().unwrap_or_else(|p| p.into_inner());
        for observer in observers.iter() {
            observer(change);
        }
    }

    fn persist(&self) {
        let snapshot = self.snapshot();
        if let Err(e) = write_config(&self.paths.config_path(), &snapshot) {
            let _ = self.log.line(
                "error",
                "config_save_failed",
                serde_json::json!({ "error": e.to_string() }),
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AppConfig> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn read_config(path: &Path) -> Result<AppConfig> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, format!("{json}\n"))?;
    Ok(())
}

fn check_usable_dir(dir: &Path) -> std::result::Result<(), String> {
    if !dir.exists() {
        return Err("folder does not exist".to_string());
    }
    if !dir.is_dir() {
        return Err("path is not a folder".to_string());
    }
    let probe = dir.join(WRITE_PROBE_FILE_NAME);
    std::fs::write(&probe, b"")
        .map_err(|e| format!("folder is not writable: {e}"))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}
