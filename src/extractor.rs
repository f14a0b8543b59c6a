//! Resolver/downloader built on the third-party extraction API.
//!
//! The API takes a canonical watch URL plus a shared token and answers with a
//! list of `{quality, url}` variants. We rank those variants by the number
//! embedded in their quality label and stream the winner to disk.

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::cache::MediaKind;
use crate::config::ExtractorConfig;
use crate::error::RelayError;

pub const EXTRACTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;
const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 14) Chrome/131 Mobile";

static RESOLUTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{3,4}").expect("resolution pattern compiles"));
static BITRATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{2,3}").expect("bitrate pattern compiles"));

/// One downloadable variant reported by the extraction API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MediaCandidate {
    #[serde(default, rename = "quality")]
    pub quality_label: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    medias: Option<Vec<MediaCandidate>>,
}

/// A file in the download directory owned by exactly one request.
///
/// Dropping the value deletes the file, so every exit path (failed stream,
/// failed upload, cancelled background task) leaves nothing behind.
#[derive(Debug)]
pub struct DownloadedFile {
    path: PathBuf,
}

impl DownloadedFile {
    /// Takes ownership of whatever lives at `path`.
    pub fn adopt(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn size(&self) -> std::io::Result<u64> {
        Ok(tokio::fs::metadata(&self.path).await?.len())
    }
}

impl Drop for DownloadedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed temporary download"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to remove temporary download")
            }
        }
    }
}

/// Source of downloadable media for a canonical watch URL.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn fetch_candidates(&self, watch_url: &str) -> Result<Vec<MediaCandidate>, RelayError>;

    /// Streams `url` into `destination`. A partial file never survives an error.
    async fn download(&self, url: &str, destination: &Path) -> Result<DownloadedFile, RelayError>;
}

/// HTTP client for the extraction API and the CDN links it hands out.
pub struct ExtractionClient {
    http: Client,
    endpoint: String,
    token: String,
}

impl ExtractionClient {
    pub fn new(config: &ExtractorConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("building extraction HTTP client")?;
        Ok(Self {
            http,
            endpoint: config.url.clone(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl MediaSource for ExtractionClient {
    async fn fetch_candidates(&self, watch_url: &str) -> Result<Vec<MediaCandidate>, RelayError> {
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(EXTRACTION_TIMEOUT)
            .form(&[("url", watch_url), ("token", self.token.as_str())])
            .send()
            .await
            .map_err(RelayError::upstream)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Upstream(format!("HTTP {status}")));
        }

        let body: ExtractionResponse = response.json().await.map_err(RelayError::upstream)?;
        let candidates: Vec<MediaCandidate> = body
            .medias
            .unwrap_or_default()
            .into_iter()
            .filter(|candidate| !candidate.url.is_empty())
            .collect();
        if candidates.is_empty() {
            return Err(RelayError::NoMediaFound);
        }
        debug!(watch_url, count = candidates.len(), "extraction API returned candidates");
        Ok(candidates)
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<DownloadedFile, RelayError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(RelayError::download)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Download(format!("HTTP {status}")));
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(RelayError::download)?;
        }
        let file = tokio::fs::File::create(destination)
            .await
            .map_err(RelayError::download)?;
        let downloaded = DownloadedFile::adopt(destination);
        let mut writer = BufWriter::with_capacity(DOWNLOAD_CHUNK_SIZE, file);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(RelayError::download)?;
            writer
                .write_all(&chunk)
                .await
                .map_err(RelayError::download)?;
        }
        writer.flush().await.map_err(RelayError::download)?;

        Ok(downloaded)
    }
}

/// Picks the highest-ranked candidate for `kind`.
///
/// Video labels must mention `mp4` or `webm` and rank by their largest
/// 3-4 digit number (the resolution); audio labels must mention `kb/s`, `m4a`
/// or `opus` and rank by their largest 2-3 digit number (the bitrate). Equal
/// ranks keep the candidate seen first.
pub fn pick_best(
    candidates: &[MediaCandidate],
    kind: MediaKind,
) -> Result<&MediaCandidate, RelayError> {
    let mut best: Option<(u32, &MediaCandidate)> = None;
    for candidate in candidates {
        let Some(rank) = rank_label(&candidate.quality_label, kind) else {
            continue;
        };
        if best.is_none_or(|(top, _)| rank > top) {
            best = Some((rank, candidate));
        }
    }
    best.map(|(_, candidate)| candidate)
        .ok_or(RelayError::NoSuitableCandidate(kind.as_str()))
}

fn rank_label(label: &str, kind: MediaKind) -> Option<u32> {
    let label = label.to_lowercase();
    let (matches_kind, numbers) = match kind {
        MediaKind::Video => (
            label.contains("mp4") || label.contains("webm"),
            &*RESOLUTION_RE,
        ),
        MediaKind::Audio => (
            label.contains("kb/s") || label.contains("m4a") || label.contains("opus"),
            &*BITRATE_RE,
        ),
    };
    if !matches_kind {
        return None;
    }
    Some(
        numbers
            .find_iter(&label)
            .filter_map(|found| found.as_str().parse::<u32>().ok())
            .max()
            .unwrap_or(0),
    )
}
