#![forbid(unsafe_code)]

//! HTTP front of era-api.
//!
//! One route, `GET /try?query=<text or link>&video=<bool>`, answered from the
//! archive channel when a live copy exists and from the extraction API
//! otherwise. Errors are reported in the body (`{"error": ...}`) with a 200
//! status, which is what existing clients of the service expect.

use std::{
    io::{self, Write},
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use era_api::{
    archive::{Archiver, TelegramArchive},
    cache::SqliteCacheStore,
    config::{SettingsOverrides, resolve_settings},
    error::RelayError,
    extractor::ExtractionClient,
    relay::{MediaRelay, RelayResponse},
    search::YoutubeSearch,
    security::{ensure_not_root, redact_secrets},
};
use serde::{Deserialize, Deserializer, de};
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

const DEFAULT_LOG_FILTER: &str = "era_api=info,backend=info,tower_http=info";
// Upper bound on how long shutdown waits for cancelled archive tasks.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Command line overrides; anything left out comes from the environment or
/// the `.env` file.
#[derive(Debug, Parser)]
#[command(name = "backend", about = "Media relay with a Telegram archive cache")]
struct BackendArgs {
    /// Listen port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Listen address (overrides HOST).
    #[arg(long)]
    host: Option<String>,
    /// Alternate `.env` file.
    #[arg(long = "env-file", value_name = "PATH")]
    env_file: Option<PathBuf>,
    /// Temporary download directory (overrides DOWNLOAD_DIR).
    #[arg(long = "download-dir", value_name = "PATH")]
    download_dir: Option<PathBuf>,
    /// SQLite cache file (overrides DATABASE_PATH).
    #[arg(long = "database", value_name = "PATH")]
    database: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> SettingsOverrides {
        SettingsOverrides {
            port: self.port,
            host: self.host,
            download_dir: self.download_dir,
            database_path: self.database,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    relay: Arc<MediaRelay>,
}

#[derive(Debug, Deserialize)]
struct TryParams {
    query: String,
    #[serde(default, deserialize_with = "deserialize_flag")]
    video: bool,
}

/// Accepts the usual spellings of a boolean query flag.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(de::Error::custom(format!(
            "invalid boolean flag `{other}`"
        ))),
    }
}

/// Pipeline failures rendered as `{"error": "<message>"}`.
#[derive(Debug)]
struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": redact_secrets(&self.0.to_string()),
        });
        Json(body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

struct RedactingWriter<W> {
    inner: W,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        self.inner.write_all(redact_secrets(&line).as_bytes())?;
        // Report the original length; the redacted text may differ.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter;

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter<io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: io::stderr(),
        }
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(RedactingMakeWriter))
        .init();
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/try", get(try_media))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = BackendArgs::parse();

    ensure_not_root("backend")?;

    let settings = resolve_settings(args.into_overrides())?;
    info!(?settings, "configuration loaded");
    let host = settings
        .host
        .parse::<IpAddr>()
        .with_context(|| format!("HOST `{}` is not an IP address", settings.host))?;

    tokio::fs::create_dir_all(&settings.download_dir)
        .await
        .with_context(|| format!("creating {}", settings.download_dir.display()))?;
    let cache = SqliteCacheStore::open(&settings.database_path)
        .await
        .context("opening cache store")?;

    let bot = TelegramArchive::connect(&settings.bot, settings.probe_chat_id)?;
    let user = TelegramArchive::connect(&settings.user, settings.probe_chat_id)?;
    let archiver = Archiver::new(
        Arc::new(bot),
        Arc::new(user),
        settings.channel_id,
        settings.bot_upload_limit_bytes(),
    );
    // Telegram errors embed the bot URL, token included.
    archiver
        .start()
        .await
        .map_err(|err| anyhow!("{}", redact_secrets(&format!("{err:#}"))))?;

    let relay = Arc::new(MediaRelay::new(
        Arc::new(YoutubeSearch::new()?),
        Arc::new(ExtractionClient::new(&settings.extractor)?),
        Arc::new(cache),
        Arc::new(archiver),
        settings.download_dir.clone(),
    ));
    let app = router(AppState {
        relay: relay.clone(),
    });

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("cancelling pending archive uploads");
    relay.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still kills the process.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn try_media(
    State(state): State<AppState>,
    Query(params): Query<TryParams>,
) -> ApiResult<Json<RelayResponse>> {
    let response = state
        .relay
        .handle(&params.query, params.video)
        .await
        .inspect_err(|err| {
            warn!(query = %params.query, video = params.video, error = %redact_secrets(&err.to_string()), "request failed")
        })?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{body::to_bytes, http::StatusCode, http::Uri};
    use era_api::archive::{ArchiveClient, ArchivedMessage, AudioTags, ChatRef};
    use era_api::cache::{CacheStore, MediaKind};
    use era_api::extractor::{DownloadedFile, MediaCandidate, MediaSource};
    use era_api::search::{SearchHit, SearchProvider};
    use serde_json::{Value, json};
    use std::path::Path;
    use tempfile::tempdir;

    struct NoHits;

    #[async_trait]
    impl SearchProvider for NoHits {
        async fn top_result(&self, _phrase: &str) -> anyhow::Result<Option<SearchHit>> {
            Ok(None)
        }
    }

    struct UnusedSource;

    #[async_trait]
    impl MediaSource for UnusedSource {
        async fn fetch_candidates(&self, _watch_url: &str) -> Result<Vec<MediaCandidate>, RelayError> {
            Err(RelayError::Upstream("HTTP 502 Bad Gateway".into()))
        }

        async fn download(&self, _url: &str, _destination: &Path) -> Result<DownloadedFile, RelayError> {
            Err(RelayError::Download("unreachable".into()))
        }
    }

    struct AlwaysLive;

    #[async_trait]
    impl ArchiveClient for AlwaysLive {
        async fn start(&self) -> anyhow::Result<String> {
            Ok("archive_bot".into())
        }

        async fn send_document(&self, _chat_id: i64, _path: &Path, _name: &str) -> anyhow::Result<ArchivedMessage> {
            anyhow::bail!("not expected")
        }

        async fn send_audio(&self, _chat_id: i64, _path: &Path, _tags: &AudioTags) -> anyhow::Result<ArchivedMessage> {
            anyhow::bail!("not expected")
        }

        async fn probe_message(&self, _chat: &ChatRef, _message_id: i32) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    struct TestContext {
        _temp: tempfile::TempDir,
        cache: Arc<SqliteCacheStore>,
        state: AppState,
    }

    impl TestContext {
        async fn new() -> Self {
            let temp = tempdir().unwrap();
            let cache = Arc::new(SqliteCacheStore::open(&temp.path().join("cache.db")).await.unwrap());
            let archive = Arc::new(AlwaysLive);
            let relay = MediaRelay::new(
                Arc::new(NoHits),
                Arc::new(UnusedSource),
                cache.clone(),
                Arc::new(Archiver::new(archive.clone(), archive, -1001, 1024)),
                temp.path().join("downloads"),
            );
            Self {
                _temp: temp,
                cache,
                state: AppState {
                    relay: Arc::new(relay),
                },
            }
        }
    }

    fn params(uri: &str) -> TryParams {
        let uri: Uri = uri.parse().unwrap();
        Query::<TryParams>::try_from_uri(&uri).unwrap().0
    }

    async fn call(ctx: &TestContext, uri: &str) -> (StatusCode, Value) {
        let response = try_media(State(ctx.state.clone()), Query(params(uri)))
            .await
            .into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn search_miss_is_a_200_error_body() {
        let ctx = TestContext::new().await;
        let (status, body) = call(&ctx, "/try?query=nothing%20here").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"error": "No result found"}));
    }

    #[tokio::test]
    async fn cached_link_is_served_from_telegram() {
        let ctx = TestContext::new().await;
        ctx.cache
            .put("dQw4w9WgXcQ", MediaKind::Video, "https://t.me/c/1/5")
            .await
            .unwrap();

        let (status, body) = call(&ctx, "/try?query=https://youtu.be/dQw4w9WgXcQ&video=true").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"from": "telegram", "download": "https://t.me/c/1/5"}));
    }

    #[tokio::test]
    async fn upstream_failure_is_reported_in_body() {
        let ctx = TestContext::new().await;
        let (status, body) = call(&ctx, "/try?query=https://youtu.be/dQw4w9WgXcQ").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"error": "extraction API error: HTTP 502 Bad Gateway"})
        );
    }

    #[test]
    fn video_flag_accepts_common_spellings() {
        assert!(!params("/try?query=a").video);
        assert!(params("/try?query=a&video=true").video);
        assert!(params("/try?query=a&video=1").video);
        assert!(!params("/try?query=a&video=off").video);
        let uri: Uri = "/try?query=a&video=maybe".parse().unwrap();
        assert!(Query::<TryParams>::try_from_uri(&uri).is_err());
    }

    #[test]
    fn missing_query_is_rejected() {
        let uri: Uri = "/try?video=true".parse().unwrap();
        assert!(Query::<TryParams>::try_from_uri(&uri).is_err());
    }

    #[tokio::test]
    async fn error_bodies_are_redacted() {
        let token = format!("123456789:{}", "x".repeat(35));
        let response = ApiError(RelayError::Download(format!(
            "error sending request for url (https://api.telegram.org/bot{token}/getFile)"
        )))
        .into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains(&token));
        assert!(text.contains("[TELEGRAM_TOKEN]"));
    }

    #[test]
    fn log_writer_masks_tokens() {
        let mut writer = RedactingWriter { inner: Vec::new() };
        let line = b"uploading with token=abcdef&x=1\n";
        assert_eq!(writer.write(line).unwrap(), line.len());
        assert_eq!(
            String::from_utf8(writer.inner).unwrap(),
            "uploading with token=[MASKED]&x=1\n"
        );
    }

    #[test]
    fn cli_flags_become_overrides() {
        let args = BackendArgs::try_parse_from([
            "backend",
            "--port",
            "8080",
            "--host",
            "127.0.0.1",
            "--env-file",
            "/etc/era/.env",
            "--database",
            "/var/lib/era/cache.db",
        ])
        .unwrap();
        let overrides = args.into_overrides();
        assert_eq!(overrides.port, Some(8080));
        assert_eq!(overrides.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(overrides.env_path, Some(PathBuf::from("/etc/era/.env")));
        assert_eq!(
            overrides.database_path,
            Some(PathBuf::from("/var/lib/era/cache.db"))
        );
        assert_eq!(overrides.download_dir, None);
    }

    #[tokio::test]
    async fn serves_try_route_over_http() {
        let ctx = TestContext::new().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(ctx.state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/try"))
            .query(&[("query", "no such song")])
            .header("Origin", "https://player.example")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .and_then(|value| value.to_str().ok()),
            Some("*")
        );
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({"error": "No result found"}));
    }
}
