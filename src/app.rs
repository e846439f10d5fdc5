use crate::config::{Config, RetryConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::providers::gigachat::GigaChatClient;
use crate::providers::Provider;
use crate::registry::ModelRegistry;
use crate::throttle::Throttle;
use axum::http::header::HeaderName;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub retry: RetryConfig,
    pub auth_token: String,
    pub cloudflare_throttle: Arc<Throttle>,
    pub gigachat: Option<Arc<GigaChatClient>>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub addr: String,
    pub auth_token: String,
}

impl RuntimeConfig {
    /// `PORT` defaults to 8080; `AUTH_TOKEN` is required. A CLI address
    /// override wins over the port.
    pub fn from_env(
        env: &HashMap<String, String>,
        addr_override: Option<String>,
    ) -> ProxyResult<Self> {
        let auth_token = env
            .get("AUTH_TOKEN")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| {
                ProxyError::configuration("Missing AUTH_TOKEN in environment variables")
            })?;
        let addr = match addr_override {
            Some(addr) => addr,
            None => {
                let port_raw = env
                    .get("PORT")
                    .filter(|v| !v.is_empty())
                    .map(String::as_str)
                    .unwrap_or("8080");
                let port: u16 = port_raw.parse().map_err(|_| {
                    ProxyError::configuration(format!(
                        "Invalid PORT value: {port_raw}. Must be a number"
                    ))
                })?;
                if port == 0 {
                    return Err(ProxyError::configuration(
                        "Invalid PORT value: 0. Must be between 1 and 65535",
                    ));
                }
                format!("0.0.0.0:{port}")
            }
        };
        Ok(Self { addr, auth_token })
    }
}

pub fn load_state(
    config: &Config,
    retry: RetryConfig,
    auth_token: String,
) -> ProxyResult<AppState> {
    let registry = Arc::new(ModelRegistry::from_config(config)?);
    let gigachat = config
        .models
        .iter()
        .find(|model| Provider::from_name(&model.provider) == Provider::GigaChat)
        .map(|model| GigaChatClient::new(&model.token, &model.url, &model.http_client_config))
        .transpose()?
        .map(Arc::new);
    Ok(AppState {
        registry,
        retry,
        auth_token,
        cloudflare_throttle: Arc::new(Throttle::new(Duration::from_secs(1))),
        gigachat,
    })
}

pub fn build_app(state: AppState) -> Router {
    let authed = Router::new()
        .route("/", post(crate::handlers::chat_completions))
        .route("/chat/completions", post(crate::handlers::chat_completions))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::chat_completions),
        )
        .route("/image", post(crate::handlers::generate_image))
        .route("/models", get(crate::handlers::list_models))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_bearer,
        ));
    Router::new()
        .merge(authed)
        .route("/ping", get(crate::handlers::ping))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_config_requires_auth_token() {
        let env = HashMap::new();
        assert!(RuntimeConfig::from_env(&env, None).is_err());
    }

    #[test]
    fn runtime_config_defaults_port() {
        let mut env = HashMap::new();
        env.insert("AUTH_TOKEN".to_string(), "secret".to_string());
        let runtime = RuntimeConfig::from_env(&env, None).expect("runtime");
        assert_eq!(runtime.addr, "0.0.0.0:8080");
    }

    #[test]
    fn runtime_config_rejects_bad_port() {
        let mut env = HashMap::new();
        env.insert("AUTH_TOKEN".to_string(), "secret".to_string());
        env.insert("PORT".to_string(), "eighty".to_string());
        assert!(RuntimeConfig::from_env(&env, None).is_err());
        env.insert("PORT".to_string(), "0".to_string());
        assert!(RuntimeConfig::from_env(&env, None).is_err());
    }

    #[test]
    fn addr_override_wins_over_port() {
        let mut env = HashMap::new();
        env.insert("AUTH_TOKEN".to_string(), "secret".to_string());
        env.insert("PORT".to_string(), "9000".to_string());
        let runtime =
            RuntimeConfig::from_env(&env, Some("127.0.0.1:3000".to_string())).expect("runtime");
        assert_eq!(runtime.addr, "127.0.0.1:3000");
    }
}
