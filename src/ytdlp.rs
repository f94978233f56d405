use crate::fetch::{FetchControl, FetchRequest, FetchedMedia, MediaFetcher, ProgressUpdate};
use crate::paths::AppPaths;
use crate::quality::{self, QualityOption};
use crate::{cmd, EngineError, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::mpsc;
use std::sync::{Mutex, OnceLock};
use std::thread;

const TOOL_NAME: &str = "yt-dlp";
const DEFAULT_FORMAT: &str = "bestvideo+bestaudio/best";
const PROGRESS_PREFIX: &str = "[vidsave-progress] ";
const TITLE_PREFIX: &str = "[vidsave-title] ";
const FILE_PREFIX: &str = "[vidsave-file] ";
const STDERR_TAIL_LINES: usize = 20;
const BYTES_PER_MB: f64 = 1_048_576.0;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    program: String,
    prefix: Vec<String>,
}

/// [`MediaFetcher`] backed by the yt-dlp command-line tool.
#[derive(Debug)]
pub struct YtDlpFetcher {
    paths: AppPaths,
    resolved: Mutex<Option<Invocation>>,
}

impl YtDlpFetcher {
    pub fn new(paths: AppPaths) -> Self {
        Self {
            paths,
            resolved: Mutex::new(None),
        }
    }

    fn candidates(&self) -> Vec<Invocation> {
        let mut out = Vec::new();
        let bundled = self.paths.bundled_ytdlp_path();
        if bundled.exists() {
            out.push(Invocation {
                program: bundled.to_string_lossy().to_string(),
                prefix: Vec::new(),
            });
        }
        out.push(Invocation {
            program: TOOL_NAME.to_string(),
            prefix: Vec::new(),
        });
        for python in ["python", "python3"] {
            out.push(Invocation {
                program: python.to_string(),
                prefix: vec!["-m".to_string(), "yt_dlp".to_string()],
            });
        }
        out
    }

    /// First candidate that answers `--version`. Cached once found.
    fn invocation(&self) -> Result<Invocation> {
        let mut cached = self.resolved.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(inv) = cached.as_ref() {
            return Ok(inv.clone());
        }

        for candidate in self.candidates() {
            if version_of(&candidate).is_some() {
                *cached = Some(candidate.clone());
                return Ok(candidate);
            }
        }

        Err(EngineError::ExternalToolMissing {
            tool: TOOL_NAME.to_string(),
        })
    }

    /// Runs `yt-dlp -J` and returns the parsed info dictionary.
    pub fn dump_info(&self, url: &str) -> Result<serde_json::Value> {
        let inv = self.invocation()?;
        let output = cmd::command(&inv.program)
            .args(&inv.prefix)
            .args(["-J", "--no-warnings", "--no-playlist", "--", url])
            .output()?;
        if !output.status.success() {
            return Err(EngineError::ExternalToolFailed {
                tool: TOOL_NAME.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    pub fn quality_options(&self, url: &str) -> Result<Vec<QualityOption>> {
        let info = self.dump_info(url)?;
        Ok(quality::options_from_info(&info))
    }
}

enum ToolLine {
    Stdout(String),
    Stderr(String),
}

fn pump_lines<R, F>(reader: R, tx: mpsc::Sender<ToolLine>, wrap: F) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
    F: Fn(String) -> ToolLine + Send + 'static,
{
    thread::spawn(move || {
        // Titles may arrive in a non-UTF-8 console code page; decode lossily and keep reading.
        let mut reader = BufReader::new(reader);
        let mut buf: Vec<u8> = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = String::from_utf8_lossy(&buf)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    })
}

fn download_args(request: &FetchRequest) -> Vec<String> {
    let format = request
        .format
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or(DEFAULT_FORMAT);

    vec![
        "--newline".to_string(),
        "--progress".to_string(),
        "--no-warnings".to_string(),
        "--no-playlist".to_string(),
        "--progress-template".to_string(),
        format!(
            "download:{PROGRESS_PREFIX}%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress._percent_str)s|%(progress.speed)s"
        ),
        "-O".to_string(),
        format!("after_move:{TITLE_PREFIX}%(title)s"),
        "-O".to_string(),
        format!("after_move:{FILE_PREFIX}%(filepath)s"),
        "-f".to_string(),
        format.to_string(),
        "-P".to_string(),
        request.output_dir.to_string_lossy().to_string(),
        "-o".to_string(),
        format!("{}.%(ext)s", request.temp_stem),
        "--".to_string(),
        request.url.clone(),
    ]
}

impl MediaFetcher for YtDlpFetcher {
    fn fetch(
        &self,
        request: &FetchRequest,
        on_progress: &mut dyn FnMut(&ProgressUpdate) -> FetchControl,
    ) -> Result<FetchedMedia> {
        let inv = self.invocation()?;
        std::fs::create_dir_all(&request.output_dir)?;

        let mut child = cmd::command(&inv.program)
            .args(&inv.prefix)
            .args(download_args(request))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EngineError::ExternalToolMissing {
                        tool: TOOL_NAME.to_string(),
                    }
                } else {
                    EngineError::Io(e)
                }
            })?;

        let (tx, rx) = mpsc::channel();
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump_lines(stdout, tx.clone(), ToolLine::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump_lines(stderr, tx.clone(), ToolLine::Stderr));
        }
        drop(tx);

        let mut title: Option<String> = None;
        let mut file: Option<PathBuf> = None;
        let mut stderr_tail: VecDeque<String> = VecDeque::new();
        let mut canceled = false;

        for line in rx.iter() {
            let text = match line {
                ToolLine::Stdout(text) => text,
                ToolLine::Stderr(text) => {
                    if parse_progress_line(&text).is_none() {
                        if stderr_tail.len() == STDERR_TAIL_LINES {
                            stderr_tail.pop_front();
                        }
                        stderr_tail.push_back(text.clone());
                    }
                    text
                }
            };

            if let Some(update) = parse_progress_line(&text) {
                if on_progress(&update) == FetchControl::Cancel {
                    canceled = true;
                    break;
                }
            } else if let Some(rest) = text.trim().strip_prefix(TITLE_PREFIX.trim_end()) {
                title = Some(rest.trim().to_string());
            } else if let Some(rest) = text.trim().strip_prefix(FILE_PREFIX.trim_end()) {
                let rest = rest.trim();
                if !rest.is_empty() {
                    file = Some(PathBuf::from(rest));
                }
            }
        }

        if canceled {
            cmd::kill_process_tree(&mut child);
            for pump in pumps {
                let _ = pump.join();
            }
            return Err(EngineError::Canceled);
        }

        for pump in pumps {
            let _ = pump.join();
        }
        let status = child.wait()?;
        if !status.success() {
            let stderr = stderr_tail.into_iter().collect::<Vec<_>>().join("\n");
            return Err(EngineError::ExternalToolFailed {
                tool: TOOL_NAME.to_string(),
                code: status.code(),
                stderr: if stderr.trim().is_empty() {
                    "unknown error".to_string()
                } else {
                    stderr
                },
            });
        }

        let path = file.ok_or_else(|| {
            EngineError::DownloadFailed("yt-dlp did not report an output file".to_string())
        })?;
        let path = if path.is_absolute() {
            path
        } else {
            request.output_dir.join(path)
        };
        if !path.is_file() {
            return Err(EngineError::DownloadFailed(format!(
                "yt-dlp reported a missing file: {}",
                path.to_string_lossy()
            )));
        }

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        let title = title
            .filter(|t| !t.is_empty() && t != "NA")
            .unwrap_or_else(|| request.temp_stem.clone());

        Ok(FetchedMedia { path, title, ext })
    }
}

/// Parses one line emitted by the vidsave progress template.
///
/// Fields are `downloaded|total|total_estimate|percent_str|speed`; yt-dlp prints `NA`
/// for anything it does not know yet.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX.trim_end())?;
    let parts: Vec<&str> = rest.trim().split('|').collect();
    if parts.len() < 5 {
        return None;
    }

    let downloaded = parse_number(parts[0]);
    let total = parse_number(parts[1])
        .filter(|v| *v > 0.0)
        .or_else(|| parse_number(parts[2]).filter(|v| *v > 0.0));

    let percent = match (downloaded, total) {
        (Some(done), Some(total)) => Some(done / total * 100.0),
        _ => parse_percent_str(parts[3]),
    }?;

    let speed_mb_s = parse_number(parts[4]).map(|b| b / BYTES_PER_MB).unwrap_or(0.0);

    Some(ProgressUpdate {
        percent: percent.clamp(0.0, 100.0),
        speed_mb_s: speed_mb_s.max(0.0),
    })
}

fn parse_number(raw: &str) -> Option<f64> {
    let v = raw.trim().parse::<f64>().ok()?;
    if v.is_finite() {
        Some(v)
    } else {
        None
    }
}

fn parse_percent_str(raw: &str) -> Option<f64> {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let ansi = ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid regex"));
    let cleaned = ansi.replace_all(raw, "");
    parse_number(cleaned.trim().trim_end_matches('%'))
}

fn version_of(inv: &Invocation) -> Option<String> {
    let output = cmd::command(&inv.program)
        .args(&inv.prefix)
        .arg("--version")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct YtDlpStatus {
    pub available: bool,
    pub bundled_installed: bool,
    pub bundled_path: String,
    pub program: String,
    pub version: Option<String>,
}

pub fn status(paths: &AppPaths) -> YtDlpStatus {
    let fetcher = YtDlpFetcher::new(paths.clone());
    let bundled = paths.bundled_ytdlp_path();

    let mut program = String::new();
    let mut version = None;
    for candidate in fetcher.candidates() {
        if let Some(v) = version_of(&candidate) {
            program = std::iter::once(candidate.program)
                .chain(candidate.prefix)
                .collect::<Vec<_>>()
                .join(" ");
            version = Some(v);
            break;
        }
    }

    YtDlpStatus {
        available: version.is_some(),
        bundled_installed: bundled.exists(),
        bundled_path: bundled.to_string_lossy().to_string(),
        program,
        version,
    }
}

/// Downloads the standalone yt-dlp release into the tools folder.
pub fn install(paths: &AppPaths) -> Result<YtDlpStatus> {
    paths.ensure_dirs()?;

    #[cfg(not(windows))]
    {
        let _ = paths;
        return Err(EngineError::InstallFailed(
            "automatic yt-dlp install is only supported on Windows; use `pip install -U yt-dlp` or your package manager".to_string(),
        ));
    }

    #[cfg(windows)]
    {
        use std::io::Write;

        const YT_DLP_WINDOWS_DOWNLOAD_URL: &str =
            "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp.exe";
        const MIN_BINARY_BYTES: u64 = 512 * 1024;

        let destination = paths.bundled_ytdlp_path();
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = destination.with_extension("download");

        let resp = ureq::get(YT_DLP_WINDOWS_DOWNLOAD_URL)
            .call()
            .map_err(|e| EngineError::InstallFailed(format!("yt-dlp download failed: {e}")))?;
        let status_code = resp.status();
        if status_code.as_u16() >= 400 {
            return Err(EngineError::InstallFailed(format!(
                "yt-dlp download failed (status={status_code})"
            )));
        }

        {
            let mut reader = resp.into_body().into_reader();
            let mut file = std::fs::File::create(&tmp_path)?;
            std::io::copy(&mut reader, &mut file)?;
            file.flush()?;
        }

        let downloaded_size = std::fs::metadata(&tmp_path).map(|m| m.len()).unwrap_or(0);
        if downloaded_size < MIN_BINARY_BYTES {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(EngineError::InstallFailed(
                "downloaded yt-dlp is unexpectedly small".to_string(),
            ));
        }

        if destination.exists() {
            let _ = std::fs::remove_file(&destination);
        }
        if std::fs::rename(&tmp_path, &destination).is_err() {
            std::fs::copy(&tmp_path, &destination)?;
            let _ = std::fs::remove_file(&tmp_path);
        }

        Ok(status(paths))
    }
}
