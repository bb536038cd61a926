#![forbid(unsafe_code)]

//! What gets sent when a clip is republished, and how a failed publish is
//! classified.

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::pipeline::Candidate;

/// Error reasons the Data API uses when the account's publishing allowance
/// for the current period is spent.
const QUOTA_REASONS: &[&str] = &[
    "quotaExceeded",
    "uploadLimitExceeded",
    "dailyLimitExceeded",
    "rateLimitExceeded",
];

/// The only distinction the run controller cares about: a spent quota halts
/// the run, anything else only skips the current candidate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("publishing quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("publish failed: {0}")]
    Other(String),
}

impl PublishError {
    pub fn is_quota(&self) -> bool {
        matches!(self, PublishError::QuotaExceeded(_))
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorItem {
    #[serde(default)]
    reason: String,
}

/// Maps a non-success HTTP status and its body onto [`PublishError`].
///
/// HTTP 429 or any nested `errors[].reason` listed in `QUOTA_REASONS` counts
/// as quota exhaustion. Bodies that are not the usual error envelope fall
/// through to `Other`.
pub fn classify_api_failure(status: u16, body: &str) -> PublishError {
    let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let message = envelope
        .as_ref()
        .map(|envelope| envelope.error.message.clone())
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| format!("HTTP {status}"));

    let quota_reason = envelope.as_ref().and_then(|envelope| {
        envelope
            .error
            .errors
            .iter()
            .find(|item| QUOTA_REASONS.contains(&item.reason.as_str()))
    });

    if status == 429 || quota_reason.is_some() {
        PublishError::QuotaExceeded(message)
    } else {
        PublishError::Other(message)
    }
}

/// Metadata attached to a republished clip.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub privacy_status: String,
    pub made_for_kids: bool,
}

impl PublishRequest {
    /// Title is passed through; the description credits the source URL and
    /// states the license, then appends the configured hashtags.
    pub fn for_candidate(candidate: &Candidate, config: &PipelineConfig) -> Self {
        let description = format!(
            "Original: {}\n\n{}\n\n{}",
            candidate.url,
            config.license_statement,
            config.hashtags.join(" ")
        );
        Self {
            title: candidate.title.clone(),
            description,
            tags: config.tags.clone(),
            category_id: config.category_id.clone(),
            privacy_status: "public".to_string(),
            made_for_kids: false,
        }
    }

    /// `snippet` + `status` body for `videos.insert`.
    pub fn to_resource(&self) -> Value {
        json!({
            "snippet": {
                "title": self.title,
                "description": self.description,
                "tags": self.tags,
                "categoryId": self.category_id,
            },
            "status": {
                "privacyStatus": self.privacy_status,
                "selfDeclaredMadeForKids": self.made_for_kids,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> Candidate {
        Candidate {
            id: "abc123".into(),
            title: "Puppy meets snow".into(),
            url: "https://www.youtube.com/watch?v=abc123".into(),
        }
    }

    #[test]
    fn quota_reason_in_403_is_quota() {
        let body = r#"{"error":{"code":403,"message":"The request cannot be completed because you have exceeded your quota.","errors":[{"message":"...","domain":"youtube.quota","reason":"quotaExceeded"}]}}"#;
        let err = classify_api_failure(403, body);
        assert!(err.is_quota());
        assert!(err.to_string().contains("exceeded your quota"));
    }

    #[test]
    fn upload_limit_in_400_is_quota() {
        let body = r#"{"error":{"code":400,"message":"The user has exceeded the number of videos they may upload.","errors":[{"domain":"youtube.video","reason":"uploadLimitExceeded"}]}}"#;
        assert!(classify_api_failure(400, body).is_quota());
    }

    #[test]
    fn too_many_requests_is_quota_even_without_body() {
        assert!(classify_api_failure(429, "").is_quota());
    }

    #[test]
    fn other_failures_are_not_quota() {
        let body = r#"{"error":{"code":400,"message":"Invalid title","errors":[{"reason":"invalidTitle"}]}}"#;
        assert_eq!(
            classify_api_failure(400, body),
            PublishError::Other("Invalid title".into())
        );
        assert_eq!(
            classify_api_failure(500, "<html>oops</html>"),
            PublishError::Other("HTTP 500".into())
        );
    }

    #[test]
    fn description_credits_source_and_license() {
        let config = PipelineConfig {
            hashtags: vec!["#dog".into(), "#pet".into()],
            ..PipelineConfig::default()
        };
        let request = PublishRequest::for_candidate(&candidate(), &config);
        assert_eq!(request.title, "Puppy meets snow");
        assert_eq!(
            request.description,
            "Original: https://www.youtube.com/watch?v=abc123\n\nCreative Commons License\n\n#dog #pet"
        );
        assert_eq!(request.category_id, "22");
    }

    #[test]
    fn resource_body_is_public_and_not_for_kids() {
        let request = PublishRequest::for_candidate(&candidate(), &PipelineConfig::default());
        let body = request.to_resource();
        assert_eq!(body["status"]["privacyStatus"], "public");
        assert_eq!(body["status"]["selfDeclaredMadeForKids"], false);
        assert_eq!(body["snippet"]["categoryId"], "22");
        assert_eq!(body["snippet"]["tags"][0], "shorts");
    }
}
