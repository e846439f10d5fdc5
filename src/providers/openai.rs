use crate::config::ModelConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::providers::{set_model, Provider};
use crate::upstream;
use bytes::Bytes;

/// The plain OpenAI chat-completion dialect, shared by openai, groq,
/// arliai, github, cohere, and every unrecognized provider: overwrite the
/// `model` field with the provider-local id and POST the body as-is.
pub async fn call(
    client: &reqwest::Client,
    model: &ModelConfig,
    payload: &[u8],
) -> ProxyResult<Bytes> {
    let body = set_model(payload, model.local_name())?;
    let (status, bytes) = upstream::post_json(client, &model.url, &model.token, body, &[]).await?;
    if !status.is_success() {
        return Err(ProxyError::provider(
            format!("unexpected status code: {}", status.as_u16()),
            Provider::from_name(&model.provider).as_str(),
            &model.name,
            status,
        )
        .with_cause(String::from_utf8_lossy(&bytes)));
    }
    Ok(bytes)
}
