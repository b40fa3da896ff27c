pub mod preview;

use axum::{http::StatusCode, Json};
use serde_json::{json, Value};

/// Static liveness signal.
pub async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// Static readiness signal. The HTTP surface does not depend on the broker,
/// so readiness is not gated on the job consumer's connection state.
pub async fn ready_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "ready" })))
}
