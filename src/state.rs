use crate::preview::PreviewService;

/// Shared application state passed to all handlers.
/// The preview service (and the HTTP client inside it) is built once at
/// startup from `Config` rather than per request.
#[derive(Clone)]
pub struct AppState {
    pub previews: PreviewService,
}
