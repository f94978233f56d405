use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityOption {
    /// Selector handed to yt-dlp as `-f`.
    pub format_id: String,
    pub label: String,
    pub extension: String,
    pub approx_size: String,
    pub height: u32,
}

pub fn preset_options() -> Vec<QualityOption> {
    vec![
        QualityOption {
            format_id: "best".to_string(),
            label: "Best available quality".to_string(),
            extension: "auto".to_string(),
            approx_size: "variable".to_string(),
            height: 0,
        },
        QualityOption {
            format_id: "bestvideo+bestaudio".to_string(),
            label: "Best video + best audio".to_string(),
            extension: "auto".to_string(),
            approx_size: "variable".to_string(),
            height: 0,
        },
    ]
}

/// Builds the quality picker from a `yt-dlp -J` info dictionary.
///
/// Presets come first. Video formats follow, tallest first, one per distinct height;
/// video-only formats are paired with the best audio track.
pub fn options_from_info(info: &serde_json::Value) -> Vec<QualityOption> {
    let mut out = preset_options();
    let mut seen_ids: HashSet<String> = out.iter().map(|o| o.format_id.clone()).collect();

    let mut candidates: Vec<QualityOption> = Vec::new();
    let formats = info
        .get("formats")
        .and_then(|v| v.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for format in formats {
        let vcodec = str_field(format, "vcodec");
        if vcodec.is_empty() || vcodec == "none" {
            continue;
        }
        let acodec = str_field(format, "acodec");

        let mut format_id = str_field(format, "format_id").to_string();
        if format_id.is_empty() {
            continue;
        }
        let video_only = acodec.is_empty() || acodec == "none";
        if video_only {
            format_id.push_str("+bestaudio");
        }
        if seen_ids.contains(&format_id) {
            continue;
        }

        let height = u32_field(format, "height");
        let width = u32_field(format, "width");
        let fps = format.get("fps").and_then(|v| v.as_f64()).unwrap_or(0.0);

        let mut label = if height > 0 && width > 0 {
            let mut l = format!("{width}x{height}");
            if fps > 0.0 {
                l.push_str(&format!(" @{}fps", fps as u32));
            }
            l
        } else {
            let note = str_field(format, "format_note");
            if note.is_empty() {
                "unknown quality".to_string()
            } else {
                note.to_string()
            }
        };
        let codec = vcodec.split('.').next().unwrap_or(vcodec);
        if video_only {
            label.push_str(&format!(" [{codec}/best audio]"));
        } else {
            let audio = acodec.split('.').next().unwrap_or(acodec);
            label.push_str(&format!(" [{codec}/{audio}]"));
        }

        let size = format
            .get("filesize")
            .and_then(|v| v.as_u64())
            .or_else(|| format.get("filesize_approx").and_then(|v| v.as_u64()));

        let extension = str_field(format, "ext");
        seen_ids.insert(format_id.clone());
        candidates.push(QualityOption {
            format_id,
            label,
            extension: if extension.is_empty() {
                "unknown".to_string()
            } else {
                extension.to_string()
            },
            approx_size: size.map(approx_size).unwrap_or_else(|| "unknown size".to_string()),
            height,
        });
    }

    // Stable sort keeps yt-dlp's own preference order within one height.
    candidates.sort_by(|a, b| b.height.cmp(&a.height));

    let mut heights_seen: HashSet<u32> = HashSet::new();
    for option in candidates {
        if option.height != 0 && !heights_seen.insert(option.height) {
            continue;
        }
        out.push(option);
    }
    out
}

fn approx_size(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b > GB {
        format!("{:.2} GB", b / GB)
    } else {
        format!("{:.2} MB", b / MB)
    }
}

fn str_field<'a>(value: &'a serde_json::Value, key: &str) -> &'a str {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn u32_field(value: &serde_json::Value, key: &str) -> u32 {
    value
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v.min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_formats_yields_presets_only() {
        let options = options_from_info(&serde_json::json!({ "title": "x" }));
        assert_eq!(options, preset_options());
    }

    #[test]
    fn formats_are_filtered_sorted_and_deduplicated_by_height() {
        let info = serde_json::json!({
            "formats": [
                { "format_id": "140", "vcodec": "none", "acodec": "mp4a.40.2", "ext": "m4a" },
                { "format_id": "18", "vcodec": "avc1.42001E", "acodec": "mp4a.40.2",
                  "width": 640, "height": 360, "fps": 30, "ext": "mp4", "filesize": 10485760 },
                { "format_id": "137", "vcodec": "avc1.640028", "acodec": "none",
                  "width": 1920, "height": 1080, "fps": 30.0, "ext": "mp4",
                  "filesize_approx": 2147483648u64 },
                { "format_id": "248", "vcodec": "vp9", "acodec": "none",
                  "width": 1920, "height": 1080, "ext": "webm" },
                { "format_id": "sb0", "vcodec": "", "acodec": "none", "ext": "mhtml" }
            ]
        });

        let options = options_from_info(&info);
        let ids: Vec<&str> = options.iter().map(|o| o.format_id.as_str()).collect();
        assert_eq!(ids, vec!["best", "bestvideo+bestaudio", "137+bestaudio", "18"]);

        let full_hd = &options[2];
        assert_eq!(full_hd.label, "1920x1080 @30fps [avc1/best audio]");
        assert_eq!(full_hd.approx_size, "2.00 GB");
        assert_eq!(full_hd.height, 1080);

        let sd = &options[3];
        assert_eq!(sd.label, "640x360 @30fps [avc1/mp4a]");
        assert_eq!(sd.approx_size, "10.00 MB");
        assert_eq!(sd.extension, "mp4");
    }

    #[test]
    fn formats_without_dimensions_use_the_note() {
        let info = serde_json::json!({
            "formats": [
                { "format_id": "hls-1", "vcodec": "h264", "acodec": "aac", "format_note": "medium" },
                { "format_id": "hls-2", "vcodec": "h264", "acodec": "aac" }
            ]
        });
        let options = options_from_info(&info);
        assert_eq!(options.len(), 4);
        assert_eq!(options[2].label, "medium [h264/aac]");
        assert_eq!(options[3].label, "unknown quality [h264/aac]");
        assert_eq!(options[3].approx_size, "unknown size");
    }
}
