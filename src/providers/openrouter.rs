use crate::config::ModelConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::providers::set_model;
use crate::stream_retry::ByteStream;
use crate::upstream;
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;

const EXTRA_HEADERS: &[(&str, &str)] = &[
    ("X-API-Source", "ai-proxy"),
    ("HTTP-Referer", "https://github.com/llmgate/llmgate"),
];

/// An error body as OpenRouter reports it. Parsing is best-effort: on
/// invalid JSON only the status survives.
#[derive(Debug, Clone)]
pub struct OpenRouterError {
    pub status: StatusCode,
    pub message: String,
    pub code: i64,
    pub provider_name: String,
    pub body: String,
}

impl OpenRouterError {
    pub fn parse(status: StatusCode, body: &[u8]) -> Self {
        let mut parsed = Self {
            status,
            message: String::new(),
            code: 0,
            provider_name: String::new(),
            body: String::from_utf8_lossy(body).into_owned(),
        };
        if let Ok(value) = serde_json::from_slice::<Value>(body) {
            if let Some(error) = value.get("error") {
                parsed.message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                parsed.code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
                parsed.provider_name = error
                    .pointer("/metadata/provider_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
            }
        }
        parsed
    }

    pub fn is_retryable(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS || self.status.is_server_error()
    }

    /// 429 becomes a rate-limit error; everything else stays a provider
    /// error with the upstream status.
    pub fn into_proxy_error(self, model: &str) -> ProxyError {
        if self.status == StatusCode::TOO_MANY_REQUESTS {
            ProxyError::rate_limit(self.message, model).with_cause(self.body)
        } else {
            ProxyError::provider(self.message, "openrouter", model, self.status)
                .with_cause(self.body)
        }
    }
}

pub async fn call(
    client: &reqwest::Client,
    model: &ModelConfig,
    payload: &[u8],
    path: &str,
) -> ProxyResult<Bytes> {
    let body = set_model(payload, model.local_name())?;
    let (status, bytes) =
        upstream::post_json(client, &model.url, &model.token, body, EXTRA_HEADERS).await?;
    if !status.is_success() {
        return Err(OpenRouterError::parse(status, &bytes).into_proxy_error(&model.name));
    }
    transform_response(bytes, path)
}

/// On the chat-completions path the `object` field is forced to
/// `chat.completion`; other paths pass through untouched.
fn transform_response(body: Bytes, path: &str) -> ProxyResult<Bytes> {
    if path != "/v1/chat/completions" {
        return Ok(body);
    }
    let Ok(mut value) = serde_json::from_slice::<Value>(&body) else {
        return Ok(body);
    };
    if value.get("object").and_then(Value::as_str) == Some("chat.completion") {
        return Ok(body);
    }
    let Some(obj) = value.as_object_mut() else {
        return Ok(body);
    };
    obj.insert(
        "object".to_string(),
        Value::String("chat.completion".to_string()),
    );
    serde_json::to_vec(&value).map(Bytes::from).map_err(|err| {
        ProxyError::network(format!("error rewriting response object field: {err}"))
    })
}

/// Opens the upstream SSE stream. Owns its inputs so the stream recreator
/// can re-issue the identical call.
pub async fn stream_call(
    client: reqwest::Client,
    model: ModelConfig,
    payload: Bytes,
) -> ProxyResult<ByteStream> {
    let body = set_model(&payload, model.local_name())?;
    let resp = upstream::send_post(&client, &model.url, &model.token, body, EXTRA_HEADERS).await?;
    let status = resp.status();
    if !status.is_success() {
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| ProxyError::network(format!("error reading error body: {err}")))?;
        return Err(OpenRouterError::parse(status, &bytes).into_proxy_error(&model.name));
    }
    Ok(Box::pin(resp.bytes_stream().map(|chunk| {
        chunk.map_err(|err| ProxyError::network(format!("upstream read failed: {err}")))
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_error_fields() {
        let body = br#"{"error":{"message":"rl","code":429,"metadata":{"provider_name":"X"}}}"#;
        let err = OpenRouterError::parse(StatusCode::TOO_MANY_REQUESTS, body);
        assert_eq!(err.message, "rl");
        assert_eq!(err.code, 429);
        assert_eq!(err.provider_name, "X");
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_json_keeps_status_only() {
        let err = OpenRouterError::parse(StatusCode::BAD_GATEWAY, b"<html>oops</html>");
        assert!(err.message.is_empty());
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert!(err.is_retryable());
    }

    #[test]
    fn rate_limit_maps_to_rate_limit_kind() {
        let body = br#"{"error":{"message":"rl","code":429}}"#;
        let err = OpenRouterError::parse(StatusCode::TOO_MANY_REQUESTS, body)
            .into_proxy_error("openrouter/auto");
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.kind, crate::error::ErrorKind::RateLimit);
        assert!(err.message.contains("rl"));
    }

    #[test]
    fn other_statuses_map_to_provider_kind() {
        let err = OpenRouterError::parse(StatusCode::BAD_REQUEST, b"{}")
            .into_proxy_error("openrouter/auto");
        assert_eq!(err.kind, crate::error::ErrorKind::Provider);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(!err.is_retryable());
    }

    #[test]
    fn chat_completions_path_forces_object_field() {
        let body = Bytes::from_static(br#"{"id":"x","object":"text_completion"}"#);
        let out = transform_response(body, "/v1/chat/completions").expect("transform");
        let value: Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["id"], "x");
    }

    #[test]
    fn missing_object_field_is_added() {
        let body = Bytes::from_static(br#"{"id":"x"}"#);
        let out = transform_response(body, "/v1/chat/completions").expect("transform");
        let value: Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(value["object"], "chat.completion");
    }

    #[test]
    fn other_paths_pass_through() {
        let body = Bytes::from_static(br#"{"object":"text_completion"}"#);
        let out = transform_response(body.clone(), "/chat/completions").expect("transform");
        assert_eq!(out, body);
    }
}
