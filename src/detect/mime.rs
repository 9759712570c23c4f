use reqwest::Url;

use crate::config::FALLBACK_CONTENT_TYPE;

/// Application subtypes that are never media payloads (typical error bodies).
const REJECTED_APPLICATION_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/xhtml+xml",
    "application/problem+json",
];

/// Lowercased `type/subtype` without parameters.
fn essence(mime: &str) -> Option<String> {
    let essence = mime.split(';').next()?.trim().to_ascii_lowercase();
    if essence.contains('/') {
        Some(essence)
    } else {
        None
    }
}

/// Whether a response declaring `declared` may be written to the cache.
///
/// A missing type is accepted; otherwise only audio, video and binary
/// application payloads pass.
pub fn is_admissible(declared: Option<&str>) -> bool {
    let essence = match declared.and_then(essence) {
        Some(essence) => essence,
        None => return true,
    };
    if essence.starts_with("video/") || essence.starts_with("audio/") {
        return true;
    }
    if essence == "binary/octet-stream" {
        return true;
    }
    essence.starts_with("application/") && !REJECTED_APPLICATION_TYPES.contains(&essence.as_str())
}

/// Media type implied by the resource's file extension.
pub fn type_from_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "ts" => "video/mp2t",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "ogg" | "oga" => "audio/ogg",
        "m3u8" => "application/vnd.apple.mpegurl",
        _ => return None,
    };
    Some(mime)
}

/// File extension of the URL's last path segment, if it has one.
pub fn url_extension(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_string())
}

/// Content type reported to the player: the declared type when it is specific,
/// else one inferred from the URL, else `application/octet-stream`.
pub fn resolve_content_type(declared: Option<&str>, url: &str) -> String {
    if let Some(essence) = declared.and_then(essence) {
        if essence != FALLBACK_CONTENT_TYPE && essence != "binary/octet-stream" {
            return essence;
        }
    }
    url_extension(url)
        .and_then(|ext| type_from_extension(&ext))
        .unwrap_or(FALLBACK_CONTENT_TYPE)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_filter() {
        assert!(is_admissible(None));
        assert!(is_admissible(Some("video/mp4")));
        assert!(is_admissible(Some("Audio/MPEG; charset=binary")));
        assert!(is_admissible(Some("application/octet-stream")));
        assert!(is_admissible(Some("application/vnd.apple.mpegurl")));
        assert!(!is_admissible(Some("text/html; charset=utf-8")));
        assert!(!is_admissible(Some("application/json")));
        assert!(!is_admissible(Some("image/png")));
    }

    #[test]
    fn test_resolve_prefers_declared_type() {
        assert_eq!(
            resolve_content_type(Some("video/mp4; codecs=avc1"), "http://h/a.mkv"),
            "video/mp4"
        );
    }

    #[test]
    fn test_resolve_falls_back_to_extension_then_octet_stream() {
        assert_eq!(
            resolve_content_type(Some("application/octet-stream"), "http://h/dir/clip.MP3?sig=1"),
            "audio/mpeg"
        );
        assert_eq!(resolve_content_type(None, "http://h/stream"), FALLBACK_CONTENT_TYPE);
        assert_eq!(resolve_content_type(None, "not a url"), FALLBACK_CONTENT_TYPE);
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(url_extension("https://cdn.example.com/v/movie.mp4?t=1"), Some("mp4".into()));
        assert_eq!(url_extension("https://cdn.example.com/v/"), None);
        assert_eq!(url_extension("https://cdn.example.com/.hidden"), None);
    }
}
