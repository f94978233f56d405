//! Seam between the download manager and whatever actually fetches media.
//!
//! The manager never talks to yt-dlp directly. It hands a [`FetchRequest`] to a
//! [`MediaFetcher`] together with a progress callback, and the callback's return value is
//! the only way a running fetch learns that it has been canceled.

use crate::Result;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// yt-dlp format selector; `None` lets the fetcher pick its default.
    pub format: Option<String>,
    pub output_dir: PathBuf,
    /// File stem the fetcher must write to, i.e. `<output_dir>/<temp_stem>.<ext>`.
    pub temp_stem: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// 0.0 to 100.0
    pub percent: f64,
    pub speed_mb_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchControl {
    Continue,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    /// Temp file as written by the fetcher.
    pub path: PathBuf,
    pub title: String,
    pub ext: String,
}

pub trait MediaFetcher: Send + Sync {
    /// Downloads `request.url`. Returns `Err(EngineError::Canceled)` once `on_progress`
    /// has answered [`FetchControl::Cancel`].
    fn fetch(
        &self,
        request: &FetchRequest,
        on_progress: &mut dyn FnMut(&ProgressUpdate) -> FetchControl,
    ) -> Result<FetchedMedia>;
}
