use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Link-preview fields extracted from a page. Every field is independent and
/// any subset may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub favicon: Option<String>,
}

impl PreviewMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.image.is_none()
            && self.favicon.is_none()
    }
}

/// Body returned by `GET /preview`.
///
/// `fetched_at` is stamped when the response is built, not when the page was
/// downloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub favicon: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl PreviewResponse {
    pub fn new(url: String, metadata: PreviewMetadata) -> Self {
        PreviewResponse {
            url,
            title: metadata.title,
            description: metadata.description,
            image: metadata.image,
            favicon: metadata.favicon,
            fetched_at: Utc::now(),
        }
    }
}

/// Inbound message on the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewJob {
    pub url_id: String,
    pub original_url: String,
}

/// Outbound message on the result queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResult {
    pub url_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub favicon: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl PreviewResult {
    pub fn completed(url_id: String, metadata: PreviewMetadata) -> Self {
        PreviewResult {
            url_id,
            title: metadata.title,
            description: metadata.description,
            image: metadata.image,
            favicon: metadata.favicon,
            fetched_at: Utc::now(),
        }
    }
}
