//! Pure parsers for media-tool output and URLs.

use std::sync::LazyLock;

use regex::Regex;

static PROGRESS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("progress pattern is valid"));

static YOUTUBE_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:youtube\.com/(?:[^/]+/.+/|(?:v|e(?:mbed)?)/|.*[?&]v=)|youtu\.be/)([^"&?/\s]{11})"#,
    )
    .expect("youtube pattern is valid")
});

/// Extracts the first percentage from a tool output line.
pub fn parse_progress(line: &str) -> Option<f64> {
    PROGRESS_PATTERN
        .captures(line)
        .and_then(|captures| captures.get(1))
        .and_then(|token| token.as_str().parse().ok())
}

/// The 11-character video id when `url` points at YouTube.
pub fn youtube_video_id(url: &str) -> Option<&str> {
    YOUTUBE_URL_PATTERN
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|token| token.as_str())
}
