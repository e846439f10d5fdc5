pub mod cloudflare;
pub mod gemini;
pub mod gigachat;
pub mod image;
pub mod openai;
pub mod openrouter;

use crate::app::AppState;
use crate::error::{ProxyError, ProxyResult};
use crate::stream_retry::{RetryStreamReader, StreamFactory};
use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::{json, Value};

/// The recognized upstream dialects. Unknown provider names fall back to
/// the plain OpenAI dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Cloudflare,
    Google,
    GigaChat,
    Groq,
    ArliAi,
    GitHub,
    Cohere,
    OpenRouter,
    OpenAi,
    HuggingFace,
    Together,
    AimlApi,
    Airforce,
}

impl Provider {
    pub fn from_name(s: &str) -> Self {
        match s {
            "cloudflare" => Self::Cloudflare,
            "google" => Self::Google,
            "gigachat" => Self::GigaChat,
            "groq" => Self::Groq,
            "arliai" => Self::ArliAi,
            "github" => Self::GitHub,
            "cohere" => Self::Cohere,
            "openrouter" => Self::OpenRouter,
            "huggingface" => Self::HuggingFace,
            "together" => Self::Together,
            "aimlapi" => Self::AimlApi,
            "airforce" => Self::Airforce,
            _ => Self::OpenAi,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloudflare => "cloudflare",
            Self::Google => "google",
            Self::GigaChat => "gigachat",
            Self::Groq => "groq",
            Self::ArliAi => "arliai",
            Self::GitHub => "github",
            Self::Cohere => "cohere",
            Self::OpenRouter => "openrouter",
            Self::OpenAi => "openai",
            Self::HuggingFace => "huggingface",
            Self::Together => "together",
            Self::AimlApi => "aimlapi",
            Self::Airforce => "airforce",
        }
    }
}

/// What a dispatch produced: a finished JSON body, or a lazy byte stream
/// proxied to the client as-is.
pub enum UpstreamReply {
    Body(Bytes),
    Stream(RetryStreamReader),
}

/// Overwrites the top-level `model` field of a raw JSON request body.
pub(crate) fn set_model(payload: &[u8], model: &str) -> ProxyResult<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(payload)
        .map_err(|err| ProxyError::validation(format!("invalid request body: {err}")))?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| ProxyError::validation("request body must be an object"))?;
    obj.insert("model".to_string(), Value::String(model.to_string()));
    serde_json::to_vec(&value)
        .map_err(|err| ProxyError::validation(format!("error serializing request body: {err}")))
}

/// Translates the request to the chosen model's dialect, executes the
/// upstream call, and normalizes the response. Streaming requests (only
/// the OpenRouter dialect carries them) come back as a retrying stream;
/// everything else is a complete body that has passed the content check.
pub async fn dispatch(
    state: &AppState,
    model_name: &str,
    payload: &Bytes,
    path: &str,
) -> ProxyResult<UpstreamReply> {
    let model = state.registry.get(model_name).ok_or_else(|| {
        ProxyError::configuration(format!("specified model not found - {model_name}"))
    })?;
    let client = state.registry.client(model_name).ok_or_else(|| {
        ProxyError::configuration(format!("no http client for model {model_name}"))
    })?;
    let provider = Provider::from_name(&model.provider);
    tracing::info!(model = model_name, provider = provider.as_str(), "dispatching request");

    let body = match provider {
        Provider::Cloudflare => {
            state.cloudflare_throttle.wait(model_name).await;
            cloudflare::call(client, model, payload).await?
        }
        Provider::Google => gemini::call(client, model, payload).await?,
        Provider::GigaChat => {
            let gigachat = state.gigachat.as_ref().ok_or_else(|| {
                ProxyError::configuration("gigachat client not initialized")
            })?;
            gigachat::call(gigachat, model, payload).await?
        }
        Provider::Cohere => {
            let raw = openai::call(client, model, payload).await?;
            rebuild_cohere_envelope(&raw, &model.name)?
        }
        Provider::OpenRouter => {
            let wants_stream = serde_json::from_slice::<Value>(payload)
                .ok()
                .and_then(|v| v.get("stream").and_then(Value::as_bool))
                .unwrap_or(false);
            if wants_stream {
                let initial = openrouter::stream_call(client.clone(), model.clone(), payload.clone())
                    .await?;
                let recreator: StreamFactory = {
                    let client = client.clone();
                    let model = model.clone();
                    let payload = payload.clone();
                    Box::new(move || {
                        let client = client.clone();
                        let model = model.clone();
                        let payload = payload.clone();
                        Box::pin(async move { openrouter::stream_call(client, model, payload).await })
                    })
                };
                let mut reader = RetryStreamReader::new(initial, Some(recreator), state.retry);
                let callback_model = model.name.clone();
                reader.set_retry_callback(Box::new(move |attempt, err| {
                    tracing::warn!(
                        model = %callback_model,
                        attempt,
                        error = %err,
                        "retrying upstream stream"
                    );
                }));
                return Ok(UpstreamReply::Stream(reader));
            }
            openrouter::call(client, model, payload, path).await?
        }
        _ => openai::call(client, model, payload).await?,
    };

    let trimmed = trim_whitespace(body);
    let content = serde_json::from_slice::<Value>(&trimmed)
        .ok()
        .and_then(|v| {
            v.pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default();
    if content.is_empty() {
        return Err(ProxyError::provider(
            "no content",
            provider.as_str(),
            model_name,
            StatusCode::INTERNAL_SERVER_ERROR,
        )
        .non_retryable());
    }
    Ok(UpstreamReply::Body(trimmed))
}

fn trim_whitespace(body: Bytes) -> Bytes {
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let end = body
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    body.slice(start..end)
}

/// Cohere replies in its own envelope; rebuild the canonical chat shape
/// from `message.content.0.text`.
fn rebuild_cohere_envelope(raw: &[u8], model_name: &str) -> ProxyResult<Bytes> {
    let value: Value = serde_json::from_slice(raw).unwrap_or(Value::Null);
    let text = value
        .pointer("/message/content/0/text")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let envelope = json!({
        "model": model_name,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop"
        }]
    });
    serde_json::to_vec(&envelope)
        .map(Bytes::from)
        .map_err(|err| {
            ProxyError::provider(
                format!("error rebuilding response: {err}"),
                "cohere",
                model_name,
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names_round_trip() {
        for name in [
            "cloudflare",
            "google",
            "gigachat",
            "groq",
            "arliai",
            "github",
            "cohere",
            "openrouter",
            "huggingface",
            "together",
            "aimlapi",
            "airforce",
        ] {
            assert_eq!(Provider::from_name(name).as_str(), name);
        }
        assert_eq!(Provider::from_name("anything-else"), Provider::OpenAi);
    }

    #[test]
    fn set_model_overwrites_existing_field() {
        let payload = br#"{"model":"SMALL","messages":[]}"#;
        let rewritten = set_model(payload, "llama-3.1-8b-instant").expect("rewrite");
        let value: Value = serde_json::from_slice(&rewritten).expect("json");
        assert_eq!(value["model"], "llama-3.1-8b-instant");
    }

    #[test]
    fn set_model_rejects_non_object_body() {
        assert!(set_model(b"[1,2,3]", "m").is_err());
        assert!(set_model(b"not json", "m").is_err());
    }

    #[test]
    fn cohere_envelope_rebuild() {
        let raw = br#"{"message":{"role":"assistant","content":[{"type":"text","text":"hi there"}]}}"#;
        let rebuilt = rebuild_cohere_envelope(raw, "cohere/command-r").expect("rebuild");
        let value: Value = serde_json::from_slice(&rebuilt).expect("json");
        assert_eq!(value["choices"][0]["message"]["content"], "hi there");
        assert_eq!(value["choices"][0]["message"]["role"], "assistant");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["model"], "cohere/command-r");
    }

    #[test]
    fn trim_strips_outer_whitespace_only() {
        let trimmed = trim_whitespace(Bytes::from_static(b"  {\"a\": 1}\n\n"));
        assert_eq!(&trimmed[..], b"{\"a\": 1}");
        let empty = trim_whitespace(Bytes::from_static(b"   "));
        assert!(empty.is_empty());
    }
}
