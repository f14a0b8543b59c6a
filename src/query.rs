//! Turns free-form user input into either a canonical watch URL or a search
//! phrase, plus the duration helper used for audio metadata.

use std::sync::LazyLock;

use regex::Regex;

const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

static VIDEO_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:v=|youtu\.be/)([A-Za-z0-9_-]{11})").expect("video id pattern compiles")
});

/// What the request handler should do with the caller's query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedQuery {
    /// The input carried a video id; no search round-trip is needed.
    Watch { video_id: String },
    /// Anything else is forwarded to the search collaborator untouched.
    Search(String),
}

impl NormalizedQuery {
    pub fn parse(input: &str) -> Self {
        match extract_video_id(input) {
            Some(video_id) => Self::Watch { video_id },
            None => Self::Search(input.to_owned()),
        }
    }
}

/// Rewrites any input carrying a `v=` parameter or a `youtu.be/` short link to
/// the canonical watch URL. Other inputs come back unchanged.
pub fn normalize_query(input: &str) -> String {
    match extract_video_id(input) {
        Some(video_id) => canonical_watch_url(&video_id),
        None => input.to_owned(),
    }
}

pub fn extract_video_id(input: &str) -> Option<String> {
    VIDEO_ID_RE
        .captures(input)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_owned())
}

pub fn canonical_watch_url(video_id: &str) -> String {
    format!("{WATCH_URL_PREFIX}{video_id}")
}

/// Converts `H:MM:SS` / `M:SS` into seconds.
///
/// Inputs without a colon are reported as zero, including bare second counts
/// like `"45"`; search results always format durations with a colon, so a
/// colon-less value means "unknown". A non-numeric component also yields zero.
pub fn duration_to_seconds(duration: &str) -> u32 {
    let duration = duration.trim();
    if duration.is_empty() || !duration.contains(':') {
        return 0;
    }
    duration
        .split(':')
        .try_fold(0u32, |total, part| {
            let value = part.trim().parse::<u32>().ok()?;
            total.checked_mul(60)?.checked_add(value)
        })
        .unwrap_or(0)
}
