use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("settings.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.base_dir.join("history.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.logs_dir().join("events.jsonl")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn bundled_ytdlp_path(&self) -> PathBuf {
        let mut path = self.tools_dir().join("yt-dlp").join("yt-dlp");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    /// Destination used whenever the configured folder is unset or unusable.
    pub fn default_download_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.tools_dir())?;
        Ok(())
    }

    /// Per-user application directory used when the caller does not pass one.
    pub fn default_base_dir() -> Option<PathBuf> {
        if let Ok(v) = std::env::var("VIDSAVE_HOME") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }

        #[cfg(windows)]
        {
            if let Ok(appdata) = std::env::var("APPDATA") {
                return Some(Path::new(&appdata).join("vidsave"));
            }
        }

        #[cfg(not(windows))]
        {
            if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
                if !xdg.trim().is_empty() {
                    return Some(Path::new(&xdg).join("vidsave"));
                }
            }
            if let Ok(home) = std::env::var("HOME") {
                return Some(Path::new(&home).join(".local").join("share").join("vidsave"));
            }
        }

        None
    }
}
