//! Search collaborator: turns a free-text phrase into the top video result.
//!
//! The YouTube implementation reads the results page and pulls the first
//! `videoRenderer` out of the embedded `ytInitialData` blob, so it needs no
//! API key.

use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_SEARCH_BASE_URL: &str = "https://www.youtube.com";
const SEARCH_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131 Safari/537.36";

static INITIAL_DATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)ytInitialData\s*=\s*(\{.*?\});\s*</script>")
        .expect("initial data pattern compiles")
});

/// Top search result. `duration` keeps the page's `H:MM:SS` text; live
/// streams have none and carry an empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub duration: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// `Ok(None)` means the search ran and matched nothing.
    async fn top_result(&self, phrase: &str) -> Result<Option<SearchHit>>;
}

pub struct YoutubeSearch {
    http: Client,
    base_url: String,
}

impl YoutubeSearch {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_SEARCH_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(SEARCH_USER_AGENT)
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("building search HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl SearchProvider for YoutubeSearch {
    async fn top_result(&self, phrase: &str) -> Result<Option<SearchHit>> {
        let response = self
            .http
            .get(format!("{}/results", self.base_url))
            .query(&[("search_query", phrase)])
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.8")
            .send()
            .await
            .context("requesting search results")?;
        let status = response.status();
        if !status.is_success() {
            bail!("search page returned HTTP {status}");
        }
        let page = response.text().await.context("reading search results")?;
        let hit = parse_search_page(&page)?;
        debug!(phrase, hit = ?hit.as_ref().map(|hit| &hit.id), "search finished");
        Ok(hit)
    }
}

/// Extracts the first video result from a results page.
pub fn parse_search_page(page: &str) -> Result<Option<SearchHit>> {
    let blob = INITIAL_DATA_RE
        .captures(page)
        .and_then(|captures| captures.get(1))
        .context("search page carries no ytInitialData")?;
    let data: Value =
        serde_json::from_str(blob.as_str()).context("parsing ytInitialData JSON")?;

    let sections = data
        .pointer("/contents/twoColumnSearchResultsRenderer/primaryContents/sectionListRenderer/contents")
        .and_then(Value::as_array);
    let Some(sections) = sections else {
        return Ok(None);
    };

    let hit = sections
        .iter()
        .filter_map(|section| section.pointer("/itemSectionRenderer/contents"))
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|item| item.get("videoRenderer"))
        .find_map(video_hit);
    Ok(hit)
}

fn video_hit(renderer: &Value) -> Option<SearchHit> {
    let id = renderer.get("videoId")?.as_str()?.to_owned();
    let title = renderer
        .pointer("/title/runs/0/text")
        .or_else(|| renderer.pointer("/title/simpleText"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let duration = renderer
        .pointer("/lengthText/simpleText")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    Some(SearchHit { id, title, duration })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, extract::Query, response::Html, routing::get};
    use serde_json::json;
    use std::collections::HashMap;

    fn page_with(items: Value) -> String {
        let data = json!({
            "contents": {
                "twoColumnSearchResultsRenderer": {
                    "primaryContents": {
                        "sectionListRenderer": {
                            "contents": [
                                {"itemSectionRenderer": {"contents": items}},
                                {"continuationItemRenderer": {}}
                            ]
                        }
                    }
                }
            }
        });
        format!(
            "<html><script nonce=\"x\">var ytInitialData = {data};</script><script>var other = {{}};</script></html>"
        )
    }

    #[test]
    fn first_video_renderer_wins() {
        let page = page_with(json!([
            {"adSlotRenderer": {}},
            {"channelRenderer": {"channelId": "UC1"}},
            {"videoRenderer": {
                "videoId": "dQw4w9WgXcQ",
                "title": {"runs": [{"text": "Never Gonna Give You Up"}]},
                "lengthText": {"simpleText": "3:33"}
            }},
            {"videoRenderer": {
                "videoId": "zzzzzzzzzzz",
                "title": {"runs": [{"text": "second"}]},
                "lengthText": {"simpleText": "1:00"}
            }}
        ]));

        let hit = parse_search_page(&page).unwrap().expect("hit");
        assert_eq!(
            hit,
            SearchHit {
                id: "dQw4w9WgXcQ".into(),
                title: "Never Gonna Give You Up".into(),
                duration: "3:33".into(),
            }
        );
    }

    #[test]
    fn live_result_has_empty_duration() {
        let page = page_with(json!([
            {"videoRenderer": {
                "videoId": "live0000000",
                "title": {"simpleText": "radio"}
            }}
        ]));
        let hit = parse_search_page(&page).unwrap().expect("hit");
        assert_eq!(hit.title, "radio");
        assert_eq!(hit.duration, "");
    }

    #[test]
    fn no_video_results_is_none() {
        let page = page_with(json!([{"backgroundPromoRenderer": {}}]));
        assert_eq!(parse_search_page(&page).unwrap(), None);
    }

    #[test]
    fn page_without_initial_data_is_an_error() {
        assert!(parse_search_page("<html>consent wall</html>").is_err());
    }

    #[tokio::test]
    async fn queries_results_endpoint() {
        let router = Router::new().route(
            "/results",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(
                    params.get("search_query").map(String::as_str),
                    Some("lofi hip hop")
                );
                Html(page_with(json!([
                    {"videoRenderer": {
                        "videoId": "jfKfPfyJRdk",
                        "title": {"runs": [{"text": "lofi"}]},
                        "lengthText": {"simpleText": "0:00"}
                    }}
                ])))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let search = YoutubeSearch::with_base_url(format!("http://{addr}/")).unwrap();
        let hit = search.top_result("lofi hip hop").await.unwrap().expect("hit");
        assert_eq!(hit.id, "jfKfPfyJRdk");
    }
}
