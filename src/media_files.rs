use crate::fetch::FetchedMedia;
use crate::Result;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const TEMP_STEM_PREFIX: &str = "vidsave_tmp_";
const MAX_TITLE_CHARS: usize = 150;

pub fn temp_stem(download_id: u64) -> String {
    format!("{TEMP_STEM_PREFIX}{download_id}")
}

/// Turns a video title into a file stem that is valid on every desktop OS.
pub fn sanitize_title(title: &str) -> Option<String> {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();
    let unsafe_chars =
        UNSAFE.get_or_init(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F\x7F]"#).expect("valid regex"));
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").expect("valid regex"));

    let collapsed = spaces.replace_all(title, " ");
    let replaced = unsafe_chars.replace_all(&collapsed, "_");
    let trimmed = replaced.trim_matches(|ch: char| ch == '.' || ch == '_' || ch.is_whitespace());
    if trimmed.is_empty() {
        return None;
    }

    let limited: String = trimmed.chars().take(MAX_TITLE_CHARS).collect();
    let limited = limited.trim_end_matches(|ch: char| ch == '.' || ch.is_whitespace());
    if limited.is_empty() {
        return None;
    }
    if is_reserved_device_name(limited) {
        return Some(match limited.find('.') {
            Some(dot) => format!("{}_{}", &limited[..dot], &limited[dot..]),
            None => format!("{limited}_"),
        });
    }
    Some(limited.to_string())
}

/// Windows refuses `CON`, `NUL`, `COM1` and friends as file stems, with or without an
/// extension after the first dot.
fn is_reserved_device_name(stem: &str) -> bool {
    let base = stem.split('.').next().unwrap_or(stem).trim_end().to_ascii_uppercase();
    match base.as_str() {
        "CON" | "PRN" | "AUX" | "NUL" | "CONIN$" | "CONOUT$" => true,
        _ => {
            let bytes = base.as_bytes();
            bytes.len() == 4
                && (base.starts_with("COM") || base.starts_with("LPT"))
                && (b'1'..=b'9').contains(&bytes[3])
        }
    }
}

pub fn final_file_name(title: &str, ext: &str, download_id: u64) -> String {
    let stem = sanitize_title(title).unwrap_or_else(|| format!("video_{download_id}"));
    let ext = ext.trim().trim_start_matches('.');
    if ext.is_empty() {
        stem
    } else {
        format!("{stem}.{ext}")
    }
}

/// Moves the fetched temp file to its title-based name, replacing any existing file.
pub fn finalize(fetched: &FetchedMedia, output_dir: &Path, download_id: u64) -> Result<PathBuf> {
    let destination = output_dir.join(final_file_name(&fetched.title, &fetched.ext, download_id));
    if destination == fetched.path {
        return Ok(destination);
    }

    if std::fs::rename(&fetched.path, &destination).is_ok() {
        return Ok(destination);
    }

    // Rename refuses to replace on some platforms and across volumes. Copy next to the
    // destination first so the old file survives a failed copy.
    let staged = output_dir.join(format!("{}.finalize", temp_stem(download_id)));
    if let Err(e) = std::fs::copy(&fetched.path, &staged) {
        let _ = std::fs::remove_file(&staged);
        return Err(e.into());
    }
    if destination.exists() {
        std::fs::remove_file(&destination)?;
    }
    if std::fs::rename(&staged, &destination).is_err() {
        std::fs::copy(&staged, &destination)?;
        let _ = std::fs::remove_file(&staged);
    }
    let _ = std::fs::remove_file(&fetched.path);
    Ok(destination)
}

/// Deletes the temp output of a download, partial fragments included.
pub fn cleanup_temp_files(output_dir: &Path, download_id: u64) -> Result<usize> {
    let stem = temp_stem(download_id);
    let prefix = format!("{stem}.");
    let mut removed = 0;
    for entry in std::fs::read_dir(output_dir)? {
        let entry = match entry {
            Ok(v) => v,
            Err(_) => continue,
        };
        let name = entry.file_name().to_string_lossy().to_string();
        if name != stem && !name.starts_with(&prefix) {
            continue;
        }
        let path = entry.path();
        if path.is_file() && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
