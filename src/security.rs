#![forbid(unsafe_code)]

//! Process-level safety helpers: the root guard and secret redaction for
//! anything that leaves the process as text (logs, `{"error": ...}` bodies).

use std::sync::LazyLock;

use anyhow::{Result, bail};
use nix::unistd::Uid;
use regex::Regex;

/// Refuses to start the service as root. Downloads land in a shared
/// directory and the archive credentials live in the environment, neither of
/// which should be owned by uid 0.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; start it from a dedicated service account");
    }
    Ok(())
}

// Bot API URLs embed the token as `/bot<id>:<secret>/`.
static BOT_URL_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(/bot)([0-9]+:[A-Za-z0-9_-]+)").expect("bot url pattern compiles")
});
static BARE_BOT_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9]{8,10}:[A-Za-z0-9_-]{35}\b").expect("bot token pattern compiles")
});
static FORM_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(token=)[^\s&]+").expect("form token pattern compiles"));

/// Masks Telegram bot tokens and `token=` form values.
pub fn redact_secrets(input: &str) -> String {
    let output = BOT_URL_TOKEN_RE.replace_all(input, "$1[TELEGRAM_TOKEN]");
    let output = BARE_BOT_TOKEN_RE.replace_all(&output, "[TELEGRAM_TOKEN]");
    FORM_TOKEN_RE.replace_all(&output, "$1[MASKED]").into_owned()
}
