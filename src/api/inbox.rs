//! ActivityPub inbox endpoints
//!
//! - POST /inbox/:username - Personal inbox
//! - POST /user/:username/inbox - Personal inbox (actor-relative alias)
//! - POST /inbox - Shared inbox
//!
//! Each answers as soon as the activity is admitted; the work itself runs
//! on the inbox worker pool.

use axum::body::Bytes;
use axum::{
    Router,
    extract::{MatchedPath, OriginalUri, Path, State},
    http::StatusCode,
    routing::post,
};
use http::{HeaderMap, Method};

use crate::AppState;
use crate::error::AppError;
use crate::federation::SignedRequest;
use crate::metrics::{HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL};

/// Create inbox router
pub fn inbox_router() -> Router<AppState> {
    Router::new()
        .route("/inbox", post(shared_inbox))
        .route("/inbox/:username", post(user_inbox))
        .route("/user/:username/inbox", post(user_inbox))
}

/// POST /inbox/:username
///
/// Unknown usernames are rejected before the body is looked at.
async fn user_inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    matched: MatchedPath,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let endpoint = matched.as_str().to_string();
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", &endpoint])
        .start_timer();

    let result: Result<(), AppError> = async {
        let recipient = state
            .db
            .get_local_actor_by_username(&username)
            .await?
            .ok_or(AppError::NotFound)?;

        state
            .inbox
            .admit(signed_request(&method, &uri, headers, body), Some(&recipient))
            .await
    }
    .await;

    record(&endpoint, result)
}

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/inbox"])
        .start_timer();

    let result = state
        .inbox
        .admit(signed_request(&method, &uri, headers, body), None)
        .await;
    record("/inbox", result)
}

fn signed_request(method: &Method, uri: &http::Uri, headers: HeaderMap, body: Bytes) -> SignedRequest {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    SignedRequest {
        method: method.as_str().to_string(),
        path,
        headers,
        body,
        actor: None,
    }
}

fn record(endpoint: &str, result: Result<(), AppError>) -> Result<StatusCode, AppError> {
    let status = match &result {
        Ok(()) => StatusCode::OK,
        Err(e) => e.status_code(),
    };
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", endpoint, status.as_str()])
        .inc();

    result.map(|()| StatusCode::OK)
}
