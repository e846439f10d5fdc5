use crate::app::AppState;
use crate::config::ModelSize;
use crate::error::ProxyError;
use crate::providers::{self, image, UpstreamReply};
use crate::selector;
use crate::stream_retry;
use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;

/// A size-class request gets this many chances to land on a model before
/// the last failure is surfaced.
const MAX_SELECT_ATTEMPTS: usize = 5;

/// A `model` shorter than this is a size-class request, not a concrete
/// model name.
const MIN_MODEL_NAME_LEN: usize = 10;

pub async fn chat_completions(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let Ok(parsed) = serde_json::from_slice::<Value>(&body) else {
        return ProxyError::validation("Invalid request body").into_response();
    };
    let model_field = parsed
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if model_field.len() >= MIN_MODEL_NAME_LEN {
        // Explicit model: one shot, the first error is surfaced as-is.
        return match providers::dispatch(&state, &model_field, &body, &path).await {
            Ok(reply) => upstream_reply_response(reply),
            Err(err) => {
                tracing::warn!(model = %model_field, error = %err, "dispatch failed");
                err.into_response()
            }
        };
    }

    let size = if model_field == "BIG" {
        ModelSize::Big
    } else {
        ModelSize::Small
    };

    let mut last_error: Option<ProxyError> = None;
    for _ in 0..MAX_SELECT_ATTEMPTS {
        let Some(model_name) =
            selector::select_model(&state.registry, size, body.len(), Instant::now())
        else {
            tracing::warn!(
                request_length = body.len(),
                size = size.as_str(),
                "no available models for this request length"
            );
            return ProxyError::model_selection("No available models for this request length")
                .into_response();
        };
        match providers::dispatch(&state, &model_name, &body, &path).await {
            Ok(reply) => return upstream_reply_response(reply),
            Err(err) => {
                // Pause the failed model until its minute window resets,
                // then either fail over or surface.
                state.registry.penalize(&model_name);
                tracing::warn!(model = %model_name, error = %err, "dispatch failed");
                if stream_retry::is_retryable_error(&err) {
                    last_error = Some(err);
                    continue;
                }
                return err.into_response();
            }
        }
    }
    match last_error {
        Some(err) => err.into_response(),
        None => ProxyError::model_selection("No available models for this request length")
            .into_response(),
    }
}

fn upstream_reply_response(reply: UpstreamReply) -> Response {
    match reply {
        UpstreamReply::Body(bytes) => {
            ([(CONTENT_TYPE, "application/json")], bytes).into_response()
        }
        UpstreamReply::Stream(reader) => (
            [
                (CONTENT_TYPE, "text/event-stream"),
                (CACHE_CONTROL, "no-cache"),
                (CONNECTION, "keep-alive"),
            ],
            Body::from_stream(reader.into_stream()),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ImageRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    inputs: String,
}

pub async fn generate_image(State(state): State<AppState>, body: Bytes) -> Response {
    let Ok(request) = serde_json::from_slice::<ImageRequest>(&body) else {
        return ProxyError::validation("Invalid request body").into_response();
    };
    let prompt = if request.prompt.is_empty() {
        request.inputs.as_str()
    } else {
        request.prompt.as_str()
    };
    if prompt.is_empty() {
        return ProxyError::validation("Empty prompt").into_response();
    }

    if request.model.is_empty() || request.model == "all" {
        let mut last_error: Option<ProxyError> = None;
        for model_name in selector::eligible_image_models(&state.registry) {
            match image::generate(&state.registry, &model_name, prompt).await {
                Ok(bytes) => return jpeg_response(bytes),
                Err(err) => {
                    state.registry.penalize(&model_name);
                    tracing::warn!(model = %model_name, error = %err, "image dispatch failed");
                    last_error = Some(err);
                }
            }
        }
        return match last_error {
            Some(err) => err.into_response(),
            None => ProxyError::model_selection("No available image models").into_response(),
        };
    }

    match image::generate(&state.registry, &request.model, prompt).await {
        Ok(bytes) => jpeg_response(bytes),
        Err(err) => {
            tracing::warn!(model = %request.model, error = %err, "image dispatch failed");
            err.into_response()
        }
    }
}

fn jpeg_response(bytes: Bytes) -> Response {
    tracing::info!(bytes = bytes.len(), "image generated");
    ([(CONTENT_TYPE, "image/jpeg")], bytes).into_response()
}

/// The model catalog, plus the synthetic size-class ids clients may use
/// in place of a concrete model.
pub async fn list_models(State(state): State<AppState>) -> Response {
    let mut data: Vec<Value> = state
        .registry
        .models()
        .iter()
        .map(|model| json!({ "id": model.name }))
        .collect();
    data.push(json!({ "id": "SMALL" }));
    data.push(json!({ "id": "BIG" }));
    Json(json!({ "object": "list", "data": data })).into_response()
}

pub async fn ping() -> &'static str {
    "OK"
}
