use crate::config::ModelConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::upstream;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct ChatRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    model: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
}

/// Cloudflare Workers AI wants the model addressed as `@<full-name>` and
/// only understands the messages array. Failures surface in the response
/// body, so the status is left to the dispatcher's content check.
pub async fn call(
    client: &reqwest::Client,
    model: &ModelConfig,
    payload: &[u8],
) -> ProxyResult<Bytes> {
    let mut request: ChatRequest = serde_json::from_slice(payload)
        .map_err(|err| ProxyError::validation(format!("invalid request body: {err}")))?;
    request.model = format!("@{}", model.name);
    let body = serde_json::to_vec(&request)
        .map_err(|err| ProxyError::validation(format!("error serializing request body: {err}")))?;
    let (_status, bytes) =
        upstream::post_json(client, &model.url, &model.token, body, &[]).await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn request_keeps_messages_and_rewrites_model() {
        let payload = br#"{"model":"SMALL","messages":[{"role":"user","content":"hi"}],"stream":false}"#;
        let mut request: ChatRequest = serde_json::from_slice(payload).expect("parse");
        request.model = "@cloudflare/meta/llama-3-8b".to_string();
        let value: Value =
            serde_json::from_slice(&serde_json::to_vec(&request).expect("serialize"))
                .expect("json");
        assert_eq!(value["model"], "@cloudflare/meta/llama-3-8b");
        assert_eq!(value["messages"][0]["content"], "hi");
        // Fields Cloudflare does not understand are dropped.
        assert!(value.get("stream").is_none());
    }
}
