//! Archive channel plumbing.
//!
//! Files are parked in a private Telegram channel that doubles as permanent
//! storage. Two identities upload there: the bot for anything up to the bot
//! limit and a second identity, usually pointed at a self-hosted Bot API
//! server, for larger files.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use teloxide::payloads::setters::*;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId, Recipient};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::MediaKind;
use crate::config::IdentityConfig;
use crate::extractor::DownloadedFile;
use crate::security::redact_secrets;

pub const AUDIO_PERFORMER: &str = "EraApi";
const DOCUMENT_NAME_CHARS: usize = 40;
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);
// Bound for session checks and link probes; these run inside a request.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedMessage {
    pub id: i32,
    /// Link supplied by the platform, when it can build one.
    pub link: Option<String>,
}

/// Chat half of an archive link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRef {
    Id(i64),
    Username(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTags {
    pub title: String,
    pub performer: String,
    pub duration_seconds: u32,
}

/// Primitive operations of the messaging platform, per identity.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Verifies the credentials and returns the identity's username.
    async fn start(&self) -> Result<String>;
    async fn send_document(&self, chat_id: i64, path: &Path, file_name: &str)
    -> Result<ArchivedMessage>;
    async fn send_audio(&self, chat_id: i64, path: &Path, tags: &AudioTags)
    -> Result<ArchivedMessage>;
    /// True when the message exists and carries a document, audio or video.
    async fn probe_message(&self, chat: &ChatRef, message_id: i32) -> Result<bool>;
}

/// `ArchiveClient` over the Telegram Bot API.
pub struct TelegramArchive {
    bot: Bot,
    probe_chat: ChatId,
    control_timeout: Duration,
}

impl TelegramArchive {
    pub fn connect(identity: &IdentityConfig, probe_chat_id: i64) -> Result<Self> {
        let client = teloxide::net::default_reqwest_settings()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .context("building Telegram HTTP client")?;
        let mut bot = Bot::with_client(identity.token.clone(), client);
        if let Some(api_url) = &identity.api_url {
            let url = Url::parse(api_url)
                .with_context(|| format!("invalid Bot API url {api_url}"))?;
            bot = bot.set_api_url(url);
        }
        Ok(Self {
            bot,
            probe_chat: ChatId(probe_chat_id),
            control_timeout: CONTROL_TIMEOUT,
        })
    }

    pub fn with_control_timeout(mut self, limit: Duration) -> Self {
        self.control_timeout = limit;
        self
    }

    fn audio_request(
        &self,
        chat_id: i64,
        path: &Path,
        tags: &AudioTags,
    ) -> <Bot as Requester>::SendAudio {
        self.bot
            .send_audio(ChatId(chat_id), InputFile::file(path))
            .title(tags.title.clone())
            .performer(tags.performer.clone())
            .duration(tags.duration_seconds)
    }
}

fn archived(message: &Message) -> ArchivedMessage {
    ArchivedMessage {
        id: message.id.0,
        link: message.url().map(|url| url.to_string()),
    }
}

#[async_trait]
impl ArchiveClient for TelegramArchive {
    async fn start(&self) -> Result<String> {
        let me = tokio::time::timeout(self.control_timeout, self.bot.get_me())
            .await
            .map_err(|_| anyhow!("verifying Telegram credentials timed out"))?
            .context("verifying Telegram credentials")?;
        Ok(me
            .user
            .username
            .clone()
            .unwrap_or_else(|| me.user.id.to_string()))
    }

    async fn send_document(
        &self,
        chat_id: i64,
        path: &Path,
        file_name: &str,
    ) -> Result<ArchivedMessage> {
        let file = InputFile::file(path).file_name(file_name.to_owned());
        let message = self
            .bot
            .send_document(ChatId(chat_id), file)
            .await
            .with_context(|| format!("sending document {}", path.display()))?;
        Ok(archived(&message))
    }

    async fn send_audio(
        &self,
        chat_id: i64,
        path: &Path,
        tags: &AudioTags,
    ) -> Result<ArchivedMessage> {
        let message = self
            .audio_request(chat_id, path, tags)
            .await
            .with_context(|| format!("sending audio {}", path.display()))?;
        Ok(archived(&message))
    }

    // The Bot API cannot read a message by id, so the message is forwarded
    // into the probe chat, inspected and the copy deleted again.
    async fn probe_message(&self, chat: &ChatRef, message_id: i32) -> Result<bool> {
        let from: Recipient = match chat {
            ChatRef::Id(id) => ChatId(*id).into(),
            ChatRef::Username(name) => Recipient::ChannelUsername(format!("@{name}")),
        };
        let forward = self
            .bot
            .forward_message(self.probe_chat, from, MessageId(message_id));
        let copy = tokio::time::timeout(self.control_timeout, forward)
            .await
            .map_err(|_| anyhow!("forwarding archived message timed out"))?
            .context("forwarding archived message")?;

        let has_media =
            copy.document().is_some() || copy.audio().is_some() || copy.video().is_some();

        let delete = self.bot.delete_message(self.probe_chat, copy.id);
        match tokio::time::timeout(self.control_timeout, delete).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(
                error = %redact_secrets(&err.to_string()),
                "failed to delete probe copy"
            ),
            Err(_) => warn!("deleting probe copy timed out"),
        }
        Ok(has_media)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Bot,
    User,
}

impl Identity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::User => "user",
        }
    }
}

/// Uploads downloads to the archive channel and checks archived links.
pub struct Archiver {
    bot: Arc<dyn ArchiveClient>,
    user: Arc<dyn ArchiveClient>,
    channel_id: i64,
    bot_limit_bytes: u64,
}

impl Archiver {
    pub fn new(
        bot: Arc<dyn ArchiveClient>,
        user: Arc<dyn ArchiveClient>,
        channel_id: i64,
        bot_limit_bytes: u64,
    ) -> Self {
        Self {
            bot,
            user,
            channel_id,
            bot_limit_bytes,
        }
    }

    /// Starts both sessions. Either failing aborts startup.
    pub async fn start(&self) -> Result<()> {
        let bot = self.bot.start().await.context("starting bot identity")?;
        let user = self.user.start().await.context("starting user identity")?;
        info!(bot = %bot, user = %user, channel_id = self.channel_id, "archive sessions started");
        Ok(())
    }

    pub fn identity_for(&self, size_bytes: u64) -> Identity {
        if size_bytes <= self.bot_limit_bytes {
            Identity::Bot
        } else {
            Identity::User
        }
    }

    fn client(&self, identity: Identity) -> &dyn ArchiveClient {
        match identity {
            Identity::Bot => self.bot.as_ref(),
            Identity::User => self.user.as_ref(),
        }
    }

    /// Sends `file` to the archive channel and returns a permanent link.
    pub async fn upload(
        &self,
        file: &DownloadedFile,
        title: &str,
        duration_seconds: u32,
        kind: MediaKind,
    ) -> Result<String> {
        let size = file
            .size()
            .await
            .with_context(|| format!("reading size of {}", file.path().display()))?;
        let identity = self.identity_for(size);
        debug!(
            path = %file.path().display(),
            size,
            identity = identity.as_str(),
            kind = kind.as_str(),
            "uploading to archive"
        );

        let client = self.client(identity);
        let message = match kind {
            MediaKind::Video => {
                client
                    .send_document(self.channel_id, file.path(), &document_name(title))
                    .await?
            }
            MediaKind::Audio => {
                let tags = AudioTags {
                    title: title.to_owned(),
                    performer: AUDIO_PERFORMER.to_owned(),
                    duration_seconds,
                };
                client.send_audio(self.channel_id, file.path(), &tags).await?
            }
        };

        let link = message
            .link
            .unwrap_or_else(|| synthesize_link(self.channel_id, message.id));
        info!(identity = identity.as_str(), link = %link, "archived upload");
        Ok(link)
    }

    /// Whether `link` still points at a message with media. Every failure
    /// counts as "gone".
    pub async fn link_exists(&self, link: &str) -> bool {
        let Some((chat, message_id)) = parse_archive_link(link) else {
            debug!(link, "unparsable archive link");
            return false;
        };
        match self.bot.probe_message(&chat, message_id).await {
            Ok(exists) => exists,
            Err(err) => {
                debug!(link, error = %redact_secrets(&format!("{err:#}")), "archive probe failed");
                false
            }
        }
    }
}

/// File name used for video documents: the title cut to 40 characters.
pub fn document_name(title: &str) -> String {
    let stem: String = title.chars().take(DOCUMENT_NAME_CHARS).collect();
    format!("{stem}.mp4")
}

/// `https://t.me/c/<internal id>/<message id>`, where the internal id is the
/// channel id without its `-100` prefix.
pub fn synthesize_link(channel_id: i64, message_id: i32) -> String {
    let raw = channel_id.to_string();
    let internal = raw
        .strip_prefix("-100")
        .unwrap_or_else(|| raw.trim_start_matches('-'));
    format!("https://t.me/c/{internal}/{message_id}")
}

/// Parses `t.me/c/<internal id>/<msg>` and `t.me/<username>/<msg>` links.
pub fn parse_archive_link(link: &str) -> Option<(ChatRef, i32)> {
    let url = Url::parse(link).ok()?;
    if !matches!(url.host_str()?, "t.me" | "telegram.me") {
        return None;
    }
    let segments: Vec<&str> = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .collect();
    match segments.as_slice() {
        ["c", internal, message] => {
            let chat_id = format!("-100{internal}").parse::<i64>().ok()?;
            Some((ChatRef::Id(chat_id), message.parse().ok()?))
        }
        [username, message] => Some((
            ChatRef::Username((*username).to_owned()),
            message.parse().ok()?,
        )),
        _ => None,
    }
}
