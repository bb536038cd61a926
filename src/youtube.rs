#![forbid(unsafe_code)]

//! Thin blocking client for the parts of the YouTube Data API v3 a run
//! needs: `search.list`, `videos.list` and a resumable `videos.insert`.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::pipeline::{Candidate, CandidateSource, Publisher, SearchRequest, VideoDetails};
use crate::publish::{PublishError, PublishRequest, classify_api_failure};

pub const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/youtube/v3";

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Agent shared by the API client and the token refresher. Only connect and
/// read timeouts are set; an upload may take as long as it takes.
pub fn build_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(30))
        .timeout_read(Duration::from_secs(120))
        .user_agent(concat!("shorts-relay/", env!("CARGO_PKG_VERSION")))
        .build()
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
    #[serde(default)]
    snippet: Option<Snippet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    #[serde(default)]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Snippet {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    #[serde(default)]
    content_details: Option<ContentDetails>,
    #[serde(default)]
    statistics: Option<Statistics>,
}

#[derive(Debug, Deserialize)]
struct ContentDetails {
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    /// The API encodes counters as strings.
    #[serde(default)]
    view_count: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InsertedVideo {
    id: String,
}

fn candidates_from(response: SearchResponse) -> Vec<Candidate> {
    response
        .items
        .into_iter()
        .filter_map(|item| {
            let id = item.id.video_id?.trim().to_string();
            if id.is_empty() {
                return None;
            }
            Some(Candidate {
                url: watch_url(&id),
                title: item.snippet.map(|snippet| snippet.title).unwrap_or_default(),
                id,
            })
        })
        .collect()
}

fn details_from(response: VideoListResponse) -> Option<VideoDetails> {
    let item = response.items.into_iter().next()?;
    Some(VideoDetails {
        duration: item.content_details.and_then(|details| details.duration),
        view_count: item
            .statistics
            .and_then(|stats| stats.view_count)
            .and_then(|count| count.parse().ok()),
    })
}

pub struct YouTubeClient {
    agent: ureq::Agent,
    access_token: String,
    api_base: String,
    upload_base: String,
}

impl YouTubeClient {
    pub fn new(agent: ureq::Agent, access_token: impl Into<String>) -> Self {
        Self::with_endpoints(agent, access_token, API_BASE, UPLOAD_BASE)
    }

    pub fn with_endpoints(
        agent: ureq::Agent,
        access_token: impl Into<String>,
        api_base: impl Into<String>,
        upload_base: impl Into<String>,
    ) -> Self {
        Self {
            agent,
            access_token: access_token.into(),
            api_base: api_base.into(),
            upload_base: upload_base.into(),
        }
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    fn get(&self, path: &str) -> ureq::Request {
        self.agent
            .get(&format!("{}/{path}", self.api_base))
            .set("Authorization", &self.bearer())
    }

    fn fetch_details(&self, id: &str) -> Result<Option<VideoDetails>> {
        let response: VideoListResponse = self
            .get("videos")
            .query("part", "contentDetails,snippet,statistics")
            .query("id", id)
            .call()
            .map_err(describe_http_error)?
            .into_json()
            .context("decoding videos.list response")?;
        Ok(details_from(response))
    }

    /// Opens a resumable session and returns the session URI.
    fn start_upload(&self, request: &PublishRequest, size: u64) -> Result<String, PublishError> {
        let response = self
            .agent
            .post(&format!("{}/videos", self.upload_base))
            .query("uploadType", "resumable")
            .query("part", "snippet,status")
            .set("Authorization", &self.bearer())
            .set("X-Upload-Content-Type", "video/*")
            .set("X-Upload-Content-Length", &size.to_string())
            .send_json(request.to_resource())
            .map_err(classify_http_error)?;
        response
            .header("Location")
            .map(str::to_string)
            .ok_or_else(|| PublishError::Other("upload session has no Location header".into()))
    }

    fn send_media(&self, session: &str, media: &Path, size: u64) -> Result<String, PublishError> {
        let file = File::open(media)
            .map_err(|err| PublishError::Other(format!("opening {}: {err}", media.display())))?;
        let response = self
            .agent
            .put(session)
            .set("Authorization", &self.bearer())
            .set("Content-Type", "video/*")
            .set("Content-Length", &size.to_string())
            .send(file)
            .map_err(classify_http_error)?;
        let inserted: InsertedVideo = response
            .into_json()
            .map_err(|err| PublishError::Other(format!("decoding upload response: {err}")))?;
        Ok(inserted.id)
    }
}

impl CandidateSource for YouTubeClient {
    fn search(&self, request: &SearchRequest) -> Result<Vec<Candidate>> {
        let response: SearchResponse = self
            .get("search")
            .query("part", "snippet")
            .query("q", &request.query)
            .query("type", "video")
            .query("videoLicense", "creativeCommon")
            .query("videoDuration", &request.duration)
            .query("maxResults", &request.max_results.to_string())
            .query("order", "viewCount")
            .call()
            .map_err(describe_http_error)
            .context("searching videos")?
            .into_json()
            .context("decoding search.list response")?;
        Ok(candidates_from(response))
    }

    fn details(&self, id: &str) -> Option<VideoDetails> {
        match self.fetch_details(id) {
            Ok(details) => details,
            Err(err) => {
                warn!(video_id = %id, "details lookup failed: {err:#}");
                None
            }
        }
    }
}

impl Publisher for YouTubeClient {
    fn publish(&self, media: &Path, request: &PublishRequest) -> Result<String, PublishError> {
        let size = std::fs::metadata(media)
            .map_err(|err| PublishError::Other(format!("stat {}: {err}", media.display())))?
            .len();
        debug!(bytes = size, "opening upload session");
        let session = self.start_upload(request, size)?;
        info!(bytes = size, "uploading {}", media.display());
        self.send_media(&session, media, size)
    }
}

fn describe_http_error(err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            anyhow!("HTTP {code}: {}", classify_api_failure(code, &body))
        }
        other => anyhow!(other),
    }
}

fn classify_http_error(err: ureq::Error) -> PublishError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            classify_api_failure(code, &body)
        }
        other => PublishError::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_items_become_candidates_in_order() {
        let raw = r#"{
            "kind": "youtube#searchListResponse",
            "items": [
                {"id": {"kind": "youtube#video", "videoId": "abc"}, "snippet": {"title": "First"}},
                {"id": {"kind": "youtube#channel", "channelId": "UC1"}, "snippet": {"title": "Channel"}},
                {"id": {"kind": "youtube#video", "videoId": "def"}}
            ]
        }"#;
        let candidates = candidates_from(serde_json::from_str(raw).unwrap());
        assert_eq!(
            candidates,
            vec![
                Candidate {
                    id: "abc".into(),
                    title: "First".into(),
                    url: "https://www.youtube.com/watch?v=abc".into(),
                },
                Candidate {
                    id: "def".into(),
                    title: String::new(),
                    url: "https://www.youtube.com/watch?v=def".into(),
                },
            ]
        );
    }

    #[test]
    fn empty_search_response_has_no_candidates() {
        assert!(candidates_from(serde_json::from_str("{}").unwrap()).is_empty());
    }

    #[test]
    fn details_read_duration_and_string_counters() {
        let raw = r#"{"items":[{"id":"abc","contentDetails":{"duration":"PT42S"},"statistics":{"viewCount":"1234"}}]}"#;
        let details = details_from(serde_json::from_str(raw).unwrap()).unwrap();
        assert_eq!(details.duration.as_deref(), Some("PT42S"));
        assert_eq!(details.view_count, Some(1234));
    }

    #[test]
    fn details_missing_item_is_none() {
        assert!(details_from(serde_json::from_str(r#"{"items":[]}"#).unwrap()).is_none());
    }

    #[test]
    fn unreachable_endpoint_is_a_plain_failure() {
        let client = YouTubeClient::with_endpoints(
            build_agent(),
            "token",
            "http://127.0.0.1:9",
            "http://127.0.0.1:9",
        );
        assert!(client.details("abc").is_none());
        let request = SearchRequest {
            query: "dogs".into(),
            max_results: 10,
            duration: "short".into(),
        };
        assert!(client.search(&request).is_err());
    }
}
