#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 2020;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_DATABASE_PATH: &str = "era_api.db";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_EXTRACTOR_URL: &str = "https://allvideodownloader.cc/wp-json/aio-dl/video-data/";
pub const DEFAULT_BOT_UPLOAD_LIMIT_MB: u64 = 1900;

/// Credentials for one messaging identity.
#[derive(Clone)]
pub struct IdentityConfig {
    pub token: String,
    /// Custom Bot API server; `None` means the public endpoint.
    pub api_url: Option<String>,
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("token", &"[MASKED]")
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Endpoint and shared token of the third-party extraction API.
#[derive(Clone)]
pub struct ExtractorConfig {
    pub url: String,
    pub token: String,
}

impl std::fmt::Debug for ExtractorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorConfig")
            .field("url", &self.url)
            .field("token", &"[MASKED]")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bot: IdentityConfig,
    pub user: IdentityConfig,
    pub channel_id: i64,
    pub probe_chat_id: i64,
    pub database_path: PathBuf,
    pub extractor: ExtractorConfig,
    pub download_dir: PathBuf,
    pub bot_upload_limit_mb: u64,
    pub port: u16,
    pub host: String,
}

impl Settings {
    pub fn bot_upload_limit_bytes(&self) -> u64 {
        self.bot_upload_limit_mb.saturating_mul(1024 * 1024)
    }
}

/// Values supplied on the command line; they beat both the environment and
/// the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub download_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    build_settings_with_overrides(file_vars, env_lookup, SettingsOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<Settings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let bot_token = lookup("BOT_TOKEN").ok_or_else(|| anyhow!("BOT_TOKEN not set"))?;
    let user_token = lookup("USER_TOKEN").unwrap_or_else(|| bot_token.clone());
    let channel_id = lookup("CHANNEL_ID")
        .ok_or_else(|| anyhow!("CHANNEL_ID not set"))?
        .parse::<i64>()
        .context("CHANNEL_ID must be a numeric chat id")?;
    let probe_chat_id = match lookup("PROBE_CHAT_ID") {
        Some(value) => value
            .parse::<i64>()
            .context("PROBE_CHAT_ID must be a numeric chat id")?,
        None => channel_id,
    };
    let extractor_token =
        lookup("EXTRACTOR_TOKEN").ok_or_else(|| anyhow!("EXTRACTOR_TOKEN not set"))?;

    let database_path = overrides
        .database_path
        .or_else(|| lookup("DATABASE_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));
    let download_dir = overrides
        .download_dir
        .or_else(|| lookup("DOWNLOAD_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR));
    let bot_upload_limit_mb = lookup("BOT_UPLOAD_LIMIT_MB")
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_BOT_UPLOAD_LIMIT_MB);
    let port = overrides
        .port
        .or_else(|| lookup("PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup("HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    Ok(Settings {
        bot: IdentityConfig {
            token: bot_token,
            api_url: lookup("BOT_API_URL"),
        },
        user: IdentityConfig {
            token: user_token,
            api_url: lookup("USER_API_URL"),
        },
        channel_id,
        probe_chat_id,
        database_path,
        extractor: ExtractorConfig {
            url: lookup("EXTRACTOR_URL").unwrap_or_else(|| DEFAULT_EXTRACTOR_URL.into()),
            token: extractor_token,
        },
        download_dir,
        bot_upload_limit_mb,
        port,
        host,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
