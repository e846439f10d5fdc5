use crate::error::{ProxyError, ProxyResult};
use crate::providers::Provider;
use crate::registry::ModelRegistry;
use crate::upstream;
use axum::http::StatusCode;
use base64::Engine;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

/// Upstreams that wrap the image in an error page or a truncated body
/// still answer 200 sometimes; anything this small is not a JPEG.
const MIN_RESPONSE_BYTES: usize = 500;

#[derive(Debug, Serialize)]
struct InputsPayload<'a> {
    inputs: &'a str,
}

#[derive(Debug, Serialize)]
struct B64Payload<'a> {
    model: &'a str,
    prompt: &'a str,
    response_format: &'static str,
}

#[derive(Debug, Serialize)]
struct PromptPayload<'a> {
    prompt: &'a str,
}

/// Generates one image through the named model and returns raw JPEG
/// bytes, decoding base64-wrapped provider responses where needed.
pub async fn generate(
    registry: &ModelRegistry,
    model_name: &str,
    prompt: &str,
) -> ProxyResult<Bytes> {
    let model = registry.get(model_name).ok_or_else(|| {
        ProxyError::configuration(format!("specified model not found - {model_name}"))
    })?;
    let client = registry.client(model_name).ok_or_else(|| {
        ProxyError::configuration(format!("no http client for model {model_name}"))
    })?;
    let provider = Provider::from_name(&model.provider);
    tracing::info!(model = model_name, "dispatching image request");

    if provider == Provider::Airforce {
        let (status, body) = upstream::get_bytes(
            client,
            &model.url,
            &[("prompt", prompt), ("model", model.local_name())],
        )
        .await?;
        return check_image_body(status, body, provider, model_name);
    }

    let payload = build_payload(provider, model.local_name(), prompt)?;
    let (status, body) =
        upstream::post_json(client, &model.url, &model.token, payload, &[]).await?;
    let body = check_image_body(status, body, provider, model_name)?;

    // Some providers wrap the JPEG in base64 inside a JSON envelope.
    match model.name.as_str() {
        "cloudflare/black-forest-labs/flux-1-schnell" => {
            decode_b64_field(&body, "/result/image", model_name)
        }
        "together/black-forest-labs/FLUX.1-schnell-Free" | "aimlapi/flux/schnell" => {
            decode_b64_field(&body, "/data/0/b64_json", model_name)
        }
        _ => Ok(body),
    }
}

fn build_payload(provider: Provider, local_model: &str, prompt: &str) -> ProxyResult<Vec<u8>> {
    let serialized = match provider {
        Provider::HuggingFace => serde_json::to_vec(&InputsPayload { inputs: prompt }),
        Provider::Together | Provider::AimlApi => serde_json::to_vec(&B64Payload {
            model: local_model,
            prompt,
            response_format: "b64_json",
        }),
        _ => serde_json::to_vec(&PromptPayload { prompt }),
    };
    serialized.map_err(|err| ProxyError::validation(format!("error building payload: {err}")))
}

fn check_image_body(
    status: StatusCode,
    body: Bytes,
    provider: Provider,
    model_name: &str,
) -> ProxyResult<Bytes> {
    if !status.is_success() {
        return Err(ProxyError::provider(
            format!("unexpected status code: {}", status.as_u16()),
            provider.as_str(),
            model_name,
            status,
        )
        .with_cause(String::from_utf8_lossy(&body)));
    }
    if body.len() < MIN_RESPONSE_BYTES {
        return Err(ProxyError::provider(
            format!("small response length: {}", body.len()),
            provider.as_str(),
            model_name,
            StatusCode::INTERNAL_SERVER_ERROR,
        )
        .with_cause(String::from_utf8_lossy(&body)));
    }
    Ok(body)
}

fn decode_b64_field(body: &[u8], pointer: &str, model_name: &str) -> ProxyResult<Bytes> {
    let value: Value = serde_json::from_slice(body).map_err(|err| {
        ProxyError::provider(
            format!("error parsing image response: {err}"),
            "",
            model_name,
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    let encoded = value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default();
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|err| {
            ProxyError::provider(
                format!("error decoding image: {err}"),
                "",
                model_name,
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huggingface_payload_uses_inputs() {
        let payload = build_payload(Provider::HuggingFace, "FLUX.1-dev", "a cat").expect("payload");
        let value: Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(value, serde_json::json!({ "inputs": "a cat" }));
    }

    #[test]
    fn together_payload_requests_b64() {
        let payload =
            build_payload(Provider::Together, "FLUX.1-schnell-Free", "a cat").expect("payload");
        let value: Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(value["model"], "FLUX.1-schnell-Free");
        assert_eq!(value["prompt"], "a cat");
        assert_eq!(value["response_format"], "b64_json");
    }

    #[test]
    fn default_payload_uses_prompt() {
        let payload = build_payload(Provider::Cloudflare, "flux-1-schnell", "a cat").expect("payload");
        let value: Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(value, serde_json::json!({ "prompt": "a cat" }));
    }

    #[test]
    fn small_bodies_are_rejected() {
        let err = check_image_body(
            StatusCode::OK,
            Bytes::from_static(b"tiny"),
            Provider::Airforce,
            "airforce/flux",
        )
        .unwrap_err();
        assert!(err.message.contains("small response length: 4"));
    }

    #[test]
    fn upstream_status_is_propagated() {
        let err = check_image_body(
            StatusCode::BAD_GATEWAY,
            Bytes::from_static(b"oops"),
            Provider::HuggingFace,
            "huggingface/flux",
        )
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn base64_field_decodes_to_raw_bytes() {
        let body = serde_json::json!({
            "result": { "image": base64::engine::general_purpose::STANDARD.encode(b"jpegbytes") }
        });
        let decoded = decode_b64_field(
            &serde_json::to_vec(&body).unwrap(),
            "/result/image",
            "cloudflare/black-forest-labs/flux-1-schnell",
        )
        .expect("decode");
        assert_eq!(&decoded[..], b"jpegbytes");
    }
}
