use crate::config::HttpClientConfig;
use crate::error::{ProxyError, ProxyResult};
use axum::http::StatusCode;
use bytes::Bytes;
use std::time::Duration;

/// Builds the long-lived pooled client for one model. Zero-valued config
/// fields leave the corresponding limit unset.
pub fn build_client(config: &HttpClientConfig) -> ProxyResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent("llmgate/0.1")
        .pool_max_idle_per_host(50);
    if config.timeout_seconds > 0 {
        builder = builder.timeout(Duration::from_secs(config.timeout_seconds));
    }
    if config.idle_conn_timeout_seconds > 0 {
        builder = builder.pool_idle_timeout(Duration::from_secs(config.idle_conn_timeout_seconds));
    }
    builder
        .build()
        .map_err(|err| ProxyError::configuration(format!("http client init failed: {err}")))
}

/// POSTs a JSON body with bearer auth and returns the status plus the full
/// response body, whatever the status was. Callers decide what a non-2xx
/// means for their dialect.
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    token: &str,
    body: Vec<u8>,
    extra_headers: &[(&str, &str)],
) -> ProxyResult<(StatusCode, Bytes)> {
    let resp = send_post(client, url, token, body, extra_headers).await?;
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|err| ProxyError::network(map_reqwest_message(&err)).with_cause(err))?;
    Ok((status, bytes))
}

/// Same as [`post_json`] but hands back the live response so the caller
/// can consume the body as a stream.
pub async fn send_post(
    client: &reqwest::Client,
    url: &str,
    token: &str,
    body: Vec<u8>,
    extra_headers: &[(&str, &str)],
) -> ProxyResult<reqwest::Response> {
    let mut req = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body);
    if !token.is_empty() {
        req = req.bearer_auth(token);
    }
    for (name, value) in extra_headers {
        req = req.header(*name, *value);
    }
    req.send()
        .await
        .map_err(|err| ProxyError::network(map_reqwest_message(&err)).with_cause(err))
}

pub async fn get_bytes(
    client: &reqwest::Client,
    url: &str,
    query: &[(&str, &str)],
) -> ProxyResult<(StatusCode, Bytes)> {
    let resp = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|err| ProxyError::network(map_reqwest_message(&err)).with_cause(err))?;
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|err| ProxyError::network(map_reqwest_message(&err)).with_cause(err))?;
    Ok((status, bytes))
}

/// Renders a transport error so that timeout failures keep the word
/// "timeout" in the message the classifier sees.
fn map_reqwest_message(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timeout: {err}")
    } else if err.is_connect() {
        format!("connection refused: {err}")
    } else {
        format!("request failed: {err}")
    }
}
