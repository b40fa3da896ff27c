//! Fetch-and-extract pipeline shared by the HTTP endpoint and the job
//! consumer.
//!
//! Nothing here returns an error to the caller. A page that cannot be fetched
//! or parsed produces [`PreviewOutcome::Degraded`], which collapses to a record
//! with every field absent.

pub mod extract;
pub mod fetcher;

use std::sync::Arc;

use url::Url;

use crate::models::PreviewMetadata;

pub use extract::extract;
pub use fetcher::{FetchError, HttpFetcher, PageFetcher, USER_AGENT};

/// Returns `true` if `url` parses with an `http`/`https` scheme and a
/// non-empty host written out after `://`.
///
/// WHATWG parsing fills in a host for inputs such as `http:example.com` or
/// `https:///example.com`; those have no authority of their own and are
/// rejected.
pub fn is_valid_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    let raw = url.trim_start_matches(|c: char| c <= ' ');
    let has_authority = raw
        .get(parsed.scheme().len()..)
        .and_then(|rest| rest.strip_prefix("://"))
        .is_some_and(|authority| {
            authority
                .chars()
                .next()
                .is_some_and(|c| !matches!(c, '/' | '\\' | '?' | '#'))
        });

    has_authority && parsed.host_str().is_some_and(|h| !h.is_empty())
}

#[derive(Debug)]
pub enum DegradeReason {
    InvalidUrl,
    Fetch(FetchError),
    Parse(String),
}

#[derive(Debug)]
pub enum PreviewOutcome {
    Extracted(PreviewMetadata),
    Degraded(DegradeReason),
}

impl PreviewOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, PreviewOutcome::Degraded(_))
    }

    /// Collapse to the wire shape. Degraded outcomes carry no fields at all.
    pub fn into_metadata(self) -> PreviewMetadata {
        match self {
            PreviewOutcome::Extracted(metadata) => metadata,
            PreviewOutcome::Degraded(_) => PreviewMetadata::default(),
        }
    }
}

/// Runs fetch then extraction for a single URL.
///
/// Cheaply cloneable; all clones share the same fetcher.
#[derive(Clone)]
pub struct PreviewService {
    fetcher: Arc<dyn PageFetcher>,
}

impl PreviewService {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self { fetcher }
    }

    pub async fn preview(&self, url: &str) -> PreviewOutcome {
        if !is_valid_url(url) {
            tracing::warn!(url = %url, "Refusing to preview invalid URL");
            return PreviewOutcome::Degraded(DegradeReason::InvalidUrl);
        }

        let html = match self.fetcher.fetch(url).await {
            Ok(html) => html,
            Err(e) => {
                tracing::warn!(error = %e, url = %url, "Failed to fetch URL for link preview");
                return PreviewOutcome::Degraded(DegradeReason::Fetch(e));
            }
        };

        // html5ever is CPU-bound; keep it off the async workers.
        let source = url.to_owned();
        match tokio::task::spawn_blocking(move || extract(&html, &source)).await {
            Ok(metadata) => PreviewOutcome::Extracted(metadata),
            Err(e) => {
                tracing::warn!(error = %e, url = %url, "Failed to parse page for link preview");
                PreviewOutcome::Degraded(DegradeReason::Parse(e.to_string()))
            }
        }
    }
}
