use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid video URL: {0}")]
    InvalidUrl(String),

    #[error("download folder is not usable: {path} ({reason})")]
    InvalidDownloadDir { path: PathBuf, reason: String },

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("download canceled by user")]
    Canceled,

    #[error("no active download with id {0}")]
    UnknownDownload(u64),

    #[error("tool install failed: {0}")]
    InstallFailed(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
