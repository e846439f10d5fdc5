use crate::config::ModelConfig;
use crate::error::{ProxyError, ProxyResult};
use bytes::Bytes;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// The Google dialect: chat messages become Gemini `contents` with system
/// messages hoisted into `systemInstruction`, and the candidate reply is
/// folded back into one chat-completion choice.
pub async fn call(
    client: &reqwest::Client,
    model: &ModelConfig,
    payload: &[u8],
) -> ProxyResult<Bytes> {
    let request = translate_request(payload)?;
    let resp = client
        .post(&model.url)
        .header("x-goog-api-key", &model.token)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .json(&request)
        .send()
        .await
        .map_err(|err| ProxyError::network(format!("request failed: {err}")).with_cause(err))?;
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|err| ProxyError::network(format!("request failed: {err}")).with_cause(err))?;
    if !status.is_success() {
        return Err(ProxyError::provider(
            format!("unexpected status code: {}", status.as_u16()),
            "google",
            &model.name,
            status,
        )
        .with_cause(String::from_utf8_lossy(&bytes)));
    }
    normalize_response(&bytes, &model.name)
}

fn translate_request(payload: &[u8]) -> ProxyResult<Value> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|err| ProxyError::validation(format!("invalid request body: {err}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ProxyError::validation("request body must be an object"))?;

    let mut contents = Vec::new();
    let mut system_parts = Vec::new();
    if let Some(messages) = obj.get("messages").and_then(Value::as_array) {
        for message in messages {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
            let content = message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if content.is_empty() {
                continue;
            }
            match role {
                "system" | "developer" => system_parts.push(json!({ "text": content })),
                _ => {
                    let role = if role == "assistant" { "model" } else { "user" };
                    contents.push(json!({ "role": role, "parts": [{ "text": content }] }));
                }
            }
        }
    }

    let mut body = json!({ "contents": contents });
    let body_obj = body.as_object_mut().expect("request object");
    if !system_parts.is_empty() {
        body_obj.insert(
            "systemInstruction".to_string(),
            json!({ "parts": system_parts }),
        );
    }

    let mut generation_config = Map::new();
    if let Some(temperature) = obj.get("temperature").and_then(Value::as_f64) {
        generation_config.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = obj.get("top_p").and_then(Value::as_f64) {
        generation_config.insert("topP".to_string(), Value::from(top_p));
    }
    if let Some(max_tokens) = obj.get("max_tokens").and_then(Value::as_u64) {
        generation_config.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
    }
    if !generation_config.is_empty() {
        body_obj.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }

    Ok(body)
}

fn normalize_response(raw: &[u8], model_name: &str) -> ProxyResult<Bytes> {
    let value: Value = serde_json::from_slice(raw).map_err(|err| {
        ProxyError::provider(
            format!("error parsing response: {err}"),
            "google",
            model_name,
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;

    let candidate = value.pointer("/candidates/0");
    let mut text = String::new();
    if let Some(parts) = candidate
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(Value::as_array)
    {
        for part in parts {
            if part.get("thought").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            if let Some(t) = part.get("text").and_then(Value::as_str) {
                text.push_str(t);
            }
        }
    }

    let finish_reason = match candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(Value::as_str)
        .unwrap_or("STOP")
    {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        other => other.to_lowercase(),
    };

    let usage = value.get("usageMetadata").cloned().unwrap_or(Value::Null);
    let envelope = json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model_name,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": usage.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0),
            "completion_tokens": usage.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0),
            "total_tokens": usage.get("totalTokenCount").and_then(Value::as_u64).unwrap_or(0)
        }
    });
    serde_json::to_vec(&envelope).map(Bytes::from).map_err(|err| {
        ProxyError::provider(
            format!("error serializing response: {err}"),
            "google",
            model_name,
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        )
    })
}
