//! Archive-link cache. One row per `(video_id, kind)`; writes are upserts so
//! the last archived link for a key always wins.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use libsql::{Builder, Connection, Row, params};

/// Media kind requested by the caller. Selects both the cache partition and
/// the quality filter applied to extraction candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn from_flag(want_video: bool) -> Self {
        if want_video { Self::Video } else { Self::Audio }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    /// Extension of the temporary download file.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Audio => "m4a",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub video_id: String,
    pub kind: MediaKind,
}

impl CacheKey {
    pub fn new(video_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            video_id: video_id.into(),
            kind,
        }
    }
}

/// A previously archived link for one video id and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub video_id: String,
    pub kind: MediaKind,
    pub link: String,
    /// RFC 3339 timestamp of the upload that produced `link`.
    pub archived_at: String,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, video_id: &str, kind: MediaKind) -> Result<Option<CacheEntry>>;
    /// Inserts or replaces the link stored for `(video_id, kind)`.
    async fn put(&self, video_id: &str, kind: MediaKind, link: &str) -> Result<()>;
    async fn delete(&self, video_id: &str, kind: MediaKind) -> Result<()>;
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS archived_media (
            video_id TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('video', 'audio')),
            link TEXT NOT NULL,
            archived_at TEXT NOT NULL,
            PRIMARY KEY (video_id, kind)
        );
        "#,
    )
    .await?;
    Ok(())
}

/// SQLite-backed cache store.
#[derive(Clone)]
pub struct SqliteCacheStore {
    conn: Connection,
}

impl SqliteCacheStore {
    /// Opens (and if necessary creates) the database file and its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening cache DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, video_id: &str, kind: MediaKind) -> Result<Option<CacheEntry>> {
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT video_id, kind, link, archived_at
                FROM archived_media
                WHERE video_id = ?1 AND kind = ?2
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![video_id, kind.as_str()]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_entry(&row)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, video_id: &str, kind: MediaKind, link: &str) -> Result<()> {
        let archived_at = Utc::now().to_rfc3339();
        self.conn
            .execute(
                r#"
                INSERT INTO archived_media (video_id, kind, link, archived_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(video_id, kind) DO UPDATE SET
                    link = excluded.link,
                    archived_at = excluded.archived_at
                "#,
                params![video_id, kind.as_str(), link, archived_at],
            )
            .await
            .with_context(|| format!("caching {} link for {video_id}", kind.as_str()))?;
        Ok(())
    }

    async fn delete(&self, video_id: &str, kind: MediaKind) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM archived_media WHERE video_id = ?1 AND kind = ?2",
                params![video_id, kind.as_str()],
            )
            .await
            .with_context(|| format!("dropping {} link for {video_id}", kind.as_str()))?;
        Ok(())
    }
}

/// Column order must match the SELECT in `get`.
fn row_to_entry(row: &Row) -> Result<CacheEntry> {
    let kind: String = row.get(1)?;
    Ok(CacheEntry {
        video_id: row.get(0)?,
        kind: MediaKind::parse(&kind).with_context(|| format!("unknown media kind {kind}"))?,
        link: row.get(2)?,
        archived_at: row.get(3)?,
    })
}
