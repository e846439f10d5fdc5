use crate::app::AppState;
use crate::error::ProxyError;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Bearer-token check for every route except the health endpoint. The
/// rejection stays generic; nothing about the expected token leaks.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.auth_token.is_empty() {
        return ProxyError::configuration("Authentication configuration error").into_response();
    }
    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let expected = format!("Bearer {}", state.auth_token);
    if provided != Some(expected.as_str()) {
        let mut response = ProxyError::authentication("Unauthorized").into_response();
        response.headers_mut().insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Bearer realm=\"AI Proxy\""),
        );
        return response;
    }
    next.run(request).await
}
