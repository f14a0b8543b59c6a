//! The `/try` pipeline: resolve the target, serve a live archived link when
//! one exists, otherwise download the best candidate, answer with its direct
//! URL and archive the file in the background.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

use crate::archive::Archiver;
use crate::cache::{CacheKey, CacheStore, MediaKind};
use crate::error::RelayError;
use crate::extractor::{DownloadedFile, MediaSource, pick_best};
use crate::query::{NormalizedQuery, canonical_watch_url, duration_to_seconds};
use crate::search::SearchProvider;
use crate::security::redact_secrets;

/// Title used when the caller passed a link and no search ran.
pub const PLACEHOLDER_TITLE: &str = "YouTube Media";

/// Successful `/try` bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "from", rename_all = "lowercase")]
pub enum RelayResponse {
    /// A cached archive link that still resolves.
    Telegram { download: String },
    /// A fresh direct link; the archive copy is still on its way.
    Downloader {
        direct: String,
        telegram: ArchiveStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    Uploading,
}

#[derive(Debug, Clone)]
struct Target {
    video_id: String,
    title: String,
    duration_seconds: u32,
}

type FetchOutcome = Result<String, RelayError>;
type InFlightMap = Arc<Mutex<HashMap<CacheKey, Arc<OnceCell<FetchOutcome>>>>>;

/// Keeps a key claimed in the in-flight map. Dropping it releases the key,
/// unless a newer fetch has claimed it in the meantime.
struct InFlightLease {
    map: InFlightMap,
    key: CacheKey,
    cell: Arc<OnceCell<FetchOutcome>>,
}

impl Drop for InFlightLease {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        if map
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.cell))
        {
            map.remove(&self.key);
        }
    }
}

/// Request handler shared by every connection.
pub struct MediaRelay {
    search: Arc<dyn SearchProvider>,
    source: Arc<dyn MediaSource>,
    cache: Arc<dyn CacheStore>,
    archiver: Arc<Archiver>,
    download_dir: PathBuf,
    in_flight: InFlightMap,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl MediaRelay {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        source: Arc<dyn MediaSource>,
        cache: Arc<dyn CacheStore>,
        archiver: Arc<Archiver>,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            search,
            source,
            cache,
            archiver,
            download_dir,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn handle(&self, query: &str, want_video: bool) -> Result<RelayResponse, RelayError> {
        let target = self.resolve_target(query).await?;
        let key = CacheKey::new(target.video_id.clone(), MediaKind::from_flag(want_video));

        if let Some(link) = self.live_cached_link(&key).await {
            info!(video_id = %key.video_id, kind = key.kind.as_str(), link = %link, "served from archive");
            return Ok(RelayResponse::Telegram { download: link });
        }

        let direct = self.fetch_shared(key, target).await?;
        Ok(RelayResponse::Downloader {
            direct,
            telegram: ArchiveStatus::Uploading,
        })
    }

    async fn resolve_target(&self, query: &str) -> Result<Target, RelayError> {
        match NormalizedQuery::parse(query) {
            NormalizedQuery::Watch { video_id } => Ok(Target {
                video_id,
                title: PLACEHOLDER_TITLE.to_owned(),
                duration_seconds: 0,
            }),
            NormalizedQuery::Search(phrase) => {
                let hit = self
                    .search
                    .top_result(&phrase)
                    .await
                    .map_err(|err| RelayError::Search(format!("{err:#}")))?
                    .ok_or(RelayError::NoResult)?;
                Ok(Target {
                    duration_seconds: duration_to_seconds(&hit.duration),
                    video_id: hit.id,
                    title: hit.title,
                })
            }
        }
    }

    /// Returns the cached link if it still resolves. A stale entry is deleted;
    /// a cache read failure is treated as a miss.
    async fn live_cached_link(&self, key: &CacheKey) -> Option<String> {
        let entry = match self.cache.get(&key.video_id, key.kind).await {
            Ok(entry) => entry?,
            Err(err) => {
                warn!(video_id = %key.video_id, kind = key.kind.as_str(), error = %format!("{err:#}"), "cache lookup failed");
                return None;
            }
        };

        if self.archiver.link_exists(&entry.link).await {
            return Some(entry.link);
        }

        info!(video_id = %key.video_id, kind = key.kind.as_str(), link = %entry.link, "dropping stale archive link");
        if let Err(err) = self.cache.delete(&key.video_id, key.kind).await {
            warn!(video_id = %key.video_id, error = %format!("{err:#}"), "failed to delete stale cache entry");
        }
        None
    }

    /// Runs at most one download per key; concurrent callers share its outcome.
    async fn fetch_shared(&self, key: CacheKey, target: Target) -> FetchOutcome {
        let cell = self
            .in_flight
            .lock()
            .entry(key.clone())
            .or_default()
            .clone();
        cell.get_or_init(|| self.fetch(key, target, cell.clone()))
            .await
            .clone()
    }

    async fn fetch(
        &self,
        key: CacheKey,
        target: Target,
        cell: Arc<OnceCell<FetchOutcome>>,
    ) -> FetchOutcome {
        let lease = InFlightLease {
            map: self.in_flight.clone(),
            key: key.clone(),
            cell,
        };

        let candidates = self
            .source
            .fetch_candidates(&canonical_watch_url(&key.video_id))
            .await?;
        let best = pick_best(&candidates, key.kind)?;
        let destination = self
            .download_dir
            .join(format!("{}.{}", key.video_id, key.kind.extension()));
        let file = self.source.download(&best.url, &destination).await?;
        info!(video_id = %key.video_id, kind = key.kind.as_str(), quality = %best.quality_label, "downloaded media");

        let direct = best.url.clone();
        self.spawn_archive(key, target, file, lease);
        Ok(direct)
    }

    fn spawn_archive(
        &self,
        key: CacheKey,
        target: Target,
        file: DownloadedFile,
        lease: InFlightLease,
    ) {
        let archiver = self.archiver.clone();
        let cache = self.cache.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let _lease = lease;
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(video_id = %key.video_id, kind = key.kind.as_str(), "archive cancelled by shutdown");
                }
                outcome = archive_and_cache(&archiver, cache.as_ref(), &key, &target, file) => match outcome {
                    Ok(link) => info!(video_id = %key.video_id, kind = key.kind.as_str(), link = %link, "archive cached"),
                    Err(err) => warn!(
                        video_id = %key.video_id,
                        kind = key.kind.as_str(),
                        error = %redact_secrets(&err.to_string()),
                        "archive failed"
                    ),
                },
            }
        });
    }

    /// Waits for every archive task spawned so far.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Cancels running archive tasks and waits up to `grace` for them to
    /// unwind. Their temporary files are removed as they drop.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!(pending = self.tasks.len(), "archive tasks still running after shutdown grace");
        }
    }
}

/// Uploads `file`, removes it whatever the outcome, and caches the link only
/// when the upload succeeded.
async fn archive_and_cache(
    archiver: &Archiver,
    cache: &dyn CacheStore,
    key: &CacheKey,
    target: &Target,
    file: DownloadedFile,
) -> FetchOutcome {
    let uploaded = archiver
        .upload(&file, &target.title, target.duration_seconds, key.kind)
        .await;
    drop(file);

    let link = uploaded.map_err(|err| RelayError::archive(&err))?;
    cache
        .put(&key.video_id, key.kind, &link)
        .await
        .map_err(|err| RelayError::Cache(format!("{err:#}")))?;
    Ok(link)
}
