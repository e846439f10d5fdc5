use crate::config::{HttpClientConfig, ModelConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::providers::set_model;
use crate::upstream;
use axum::http::StatusCode;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

const OAUTH_URL: &str = "https://ngw.devices.sberbank.ru:9443/api/v2/oauth";
const OAUTH_SCOPE: &str = "GIGACHAT_API_CORP";
const MIN_INTERVAL: Duration = Duration::from_secs(1);
/// Renew the access token a minute before the provider expires it.
const TOKEN_RENEWAL_MARGIN_MS: u64 = 60_000;

#[derive(Debug, Deserialize)]
struct OauthToken {
    access_token: String,
    /// Absolute expiry, milliseconds since the unix epoch.
    expires_at: u64,
}

struct Gate {
    last_request: Instant,
    access_token: Option<String>,
    token_expires: Option<Instant>,
}

/// The embedded GigaChat collaborator: exchanges basic credentials for a
/// bearer token, then posts chat payloads. Every call in the process is
/// serialized through one gate that also enforces the 1-second throttle.
pub struct GigaChatClient {
    http: reqwest::Client,
    chat_url: String,
    client_id: String,
    client_secret: String,
    gate: Mutex<Gate>,
}

impl GigaChatClient {
    /// `token` is `client_id:client_secret`.
    pub fn new(token: &str, chat_url: &str, config: &HttpClientConfig) -> ProxyResult<Self> {
        let (client_id, client_secret) = token.split_once(':').ok_or_else(|| {
            ProxyError::configuration("gigachat token must be client_id:client_secret")
        })?;
        Ok(Self {
            http: upstream::build_client(config)?,
            chat_url: chat_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            gate: Mutex::new(Gate {
                last_request: Instant::now(),
                access_token: None,
                token_expires: None,
            }),
        })
    }

    pub async fn send_bytes(&self, payload: Vec<u8>) -> ProxyResult<Bytes> {
        let mut gate = self.gate.lock().await;
        let elapsed = gate.last_request.elapsed();
        if elapsed < MIN_INTERVAL {
            let pause = MIN_INTERVAL - elapsed;
            tracing::debug!(pause_ms = pause.as_millis() as u64, "gigachat throttled");
            sleep(pause).await;
        }
        let token = self.ensure_token(&mut gate).await?;
        let result = self.post_chat(&token, payload).await;
        gate.last_request = Instant::now();
        result
    }

    async fn post_chat(&self, token: &str, payload: Vec<u8>) -> ProxyResult<Bytes> {
        let resp = self
            .http
            .post(&self.chat_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .bearer_auth(token)
            .body(payload)
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
                "gigachat",
                "",
                status,
            )
            .with_cause(String::from_utf8_lossy(&bytes)));
        }
        Ok(bytes)
    }

    async fn ensure_token(&self, gate: &mut Gate) -> ProxyResult<String> {
        if let (Some(token), Some(expires)) = (&gate.access_token, gate.token_expires) {
            if Instant::now() < expires {
                return Ok(token.clone());
            }
        }
        let resp = self
            .http
            .post(OAUTH_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header("RqUID", Uuid::new_v4().to_string())
            .form(&[("scope", OAUTH_SCOPE)])
            .send()
            .await
            .map_err(|err| {
                ProxyError::network(format!("gigachat oauth failed: {err}")).with_cause(err)
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProxyError::provider(
                format!("gigachat oauth status: {}", status.as_u16()),
                "gigachat",
                "",
                status,
            ));
        }
        let token: OauthToken = resp.json().await.map_err(|err| {
            ProxyError::network(format!("gigachat oauth parse failed: {err}")).with_cause(err)
        })?;
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let remaining_ms = token
            .expires_at
            .saturating_sub(now_ms)
            .saturating_sub(TOKEN_RENEWAL_MARGIN_MS);
        gate.token_expires = Some(Instant::now() + Duration::from_millis(remaining_ms));
        gate.access_token = Some(token.access_token.clone());
        Ok(token.access_token)
    }
}

pub async fn call(
    client: &GigaChatClient,
    model: &ModelConfig,
    payload: &[u8],
) -> ProxyResult<Bytes> {
    let body = set_model(payload, model.local_name())?;
    let resp = client.send_bytes(body).await?;
    convert_response(&resp, &model.name).map(Bytes::from)
}

// --- GigaChat envelope ---

#[derive(Debug, Deserialize)]
struct GigaChatResponse {
    #[serde(default)]
    choices: Vec<GigaChatChoice>,
    #[serde(default)]
    usage: GigaChatUsage,
}

#[derive(Debug, Deserialize)]
struct GigaChatChoice {
    #[serde(default)]
    message: GigaChatMessage,
    #[serde(default)]
    finish_reason: String,
}

#[derive(Debug, Default, Deserialize)]
struct GigaChatMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    function_call: Option<GigaChatFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GigaChatFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Default, Deserialize)]
struct GigaChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    system_tokens: u64,
}

// --- Canonical chat-completion envelope ---

#[derive(Debug, Serialize)]
struct OpenAiResponse {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: OpenAiUsage,
    system_fingerprint: String,
}

#[derive(Debug, Serialize)]
struct OpenAiChoice {
    index: u32,
    message: OpenAiMessage,
    logprobs: Value,
    finish_reason: String,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionCall {
    name: String,
    /// Arguments serialized as a JSON string, not an object.
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
    #[serde(skip_serializing_if = "is_zero")]
    system_tokens: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Converts a GigaChat reply into the canonical chat-completion envelope.
/// Content becomes JSON null only when the source content is empty and a
/// function call is present; assistant function calls turn into a single
/// `tool_calls` entry and the legacy `function_call` field is never
/// emitted.
pub fn convert_response(raw: &[u8], model_name: &str) -> ProxyResult<Vec<u8>> {
    let giga: GigaChatResponse = serde_json::from_slice(raw).map_err(|err| {
        ProxyError::provider(
            format!("error parsing response: {err}"),
            "gigachat",
            model_name,
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;

    let fingerprint_hex = Uuid::new_v4().simple().to_string();
    let mut choices = Vec::with_capacity(giga.choices.len());
    for choice in giga.choices {
        let GigaChatMessage {
            content,
            role,
            function_call,
        } = choice.message;

        let message_content = if content.is_empty() && function_call.is_some() {
            None
        } else {
            Some(content)
        };

        let tool_calls = if role == "assistant" {
            match function_call {
                Some(fc) => {
                    let arguments = serde_json::to_string(&fc.arguments).map_err(|err| {
                        ProxyError::provider(
                            format!("error serializing function call arguments: {err}"),
                            "gigachat",
                            model_name,
                            StatusCode::INTERNAL_SERVER_ERROR,
                        )
                    })?;
                    Some(vec![OpenAiToolCall {
                        id: format!("call_{}", Uuid::new_v4()),
                        call_type: "function",
                        function: OpenAiFunctionCall {
                            name: fc.name,
                            arguments,
                        },
                    }])
                }
                None => None,
            }
        } else {
            None
        };

        choices.push(OpenAiChoice {
            index: 0,
            message: OpenAiMessage {
                role,
                content: message_content,
                tool_calls,
            },
            logprobs: Value::Null,
            finish_reason: choice.finish_reason,
        });
    }

    let envelope = OpenAiResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion",
        created: chrono::Utc::now().timestamp(),
        model: model_name.to_string(),
        choices,
        usage: OpenAiUsage {
            prompt_tokens: giga.usage.prompt_tokens,
            completion_tokens: giga.usage.completion_tokens,
            total_tokens: giga.usage.total_tokens,
            system_tokens: giga.usage.system_tokens,
        },
        system_fingerprint: format!("fp_{}", &fingerprint_hex[..8]),
    };
    serde_json::to_vec(&envelope).map_err(|err| {
        ProxyError::provider(
            format!("error serializing response: {err}"),
            "gigachat",
            model_name,
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })
}
