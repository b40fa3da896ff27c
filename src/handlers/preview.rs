use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::models::PreviewResponse;
use crate::preview::is_valid_url;
use crate::state::AppState;

// ── Query params ───────────────────────────────────────────────────────────

/// `url` is optional at the extractor level so that a missing parameter can be
/// reported as 422 instead of axum's default 400 query rejection.
#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub url: Option<String>,
}

// ── Handler ────────────────────────────────────────────────────────────────

/// GET /preview?url=<encoded-url>
///
/// Returns link-preview metadata for the given URL. Only a missing or invalid
/// `url` is an error; an unreachable or unparseable page answers 200 with every
/// metadata field null.
pub async fn get_preview(
    State(state): State<AppState>,
    Query(params): Query<PreviewQuery>,
) -> AppResult<Json<PreviewResponse>> {
    let url = params
        .url
        .ok_or_else(|| AppError::MissingParameter("url".into()))?;

    if !is_valid_url(&url) {
        return Err(AppError::Validation(
            "Invalid URL. Must be a valid HTTP or HTTPS URL.".into(),
        ));
    }

    let outcome = state.previews.preview(&url).await;
    if outcome.is_degraded() {
        tracing::debug!(url = %url, "Serving empty link preview");
    }

    Ok(Json(PreviewResponse::new(url, outcome.into_metadata())))
}
