use crate::error::{ProxyError, ProxyResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Coarse demand class used when a client does not pin a concrete model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSize {
    Small,
    Big,
    Other,
}

impl ModelSize {
    pub fn parse(s: &str) -> Self {
        match s {
            "SMALL" => Self::Small,
            "BIG" => Self::Big,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "SMALL",
            Self::Big => "BIG",
            Self::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct HttpClientConfig {
    /// Whole-request timeout. Zero means no timeout.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// How long pooled idle connections are kept. Zero means the client default.
    #[serde(default)]
    pub idle_conn_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub priority: i32,
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    pub url: String,
    #[serde(default)]
    pub token: String,
    /// Largest accepted request body in bytes. Zero marks an image model.
    #[serde(default)]
    pub max_request_length: usize,
    #[serde(default)]
    pub model_size: String,
    #[serde(default)]
    pub http_client_config: HttpClientConfig,
}

impl ModelConfig {
    pub fn size(&self) -> ModelSize {
        ModelSize::parse(&self.model_size)
    }

    /// Image models are marked by a zero max_request_length.
    pub fn is_image_model(&self) -> bool {
        self.max_request_length == 0
    }

    /// The provider-local model id, without the `<provider>/` prefix.
    pub fn local_name(&self) -> &str {
        self.name
            .strip_prefix(&format!("{}/", self.provider))
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub models: Vec<ModelConfig>,
}

pub fn load_config(path: &Path) -> ProxyResult<Config> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        ProxyError::configuration(format!(
            "error reading config file {}: {err}",
            path.display()
        ))
        .with_cause(err)
    })?;
    let config: Config = serde_yaml::from_str(&raw).map_err(|err| {
        ProxyError::configuration(format!("error parsing config: {err}")).with_cause(err)
    })?;
    if config.models.is_empty() {
        return Err(ProxyError::configuration("config contains no models"));
    }
    Ok(config)
}

/// Backoff parameters for the streaming retry reader, loaded from the
/// environment with conservative defaults.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn from_env(env: &HashMap<String, String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = env.get("RETRY_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                config.max_retries = n;
            }
        }
        if let Some(v) = env.get("RETRY_BASE_DELAY") {
            if let Some(d) = parse_duration(v) {
                config.base_delay = d;
            }
        }
        if let Some(v) = env.get("RETRY_MAX_DELAY") {
            if let Some(d) = parse_duration(v) {
                config.max_delay = d;
            }
        }
        if let Some(v) = env.get("RETRY_JITTER") {
            if let Ok(j) = v.parse() {
                config.jitter = j;
            }
        }
        config
    }
}

/// Parses `300ms`, `1s`, `2m`, `1h` style durations.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (value, unit) = raw.split_at(raw.find(|c: char| c.is_ascii_alphabetic())?);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// Reads a `KEY=VALUE` env file. Lines starting with `#` and blank lines
/// are skipped; values may be single- or double-quoted.
pub fn load_env_file(path: &Path) -> ProxyResult<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        ProxyError::configuration(format!(
            "error loading env file {}: {err}",
            path.display()
        ))
        .with_cause(err)
    })?;
    let mut env = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        env.insert(key.trim().to_string(), value.to_string());
    }
    Ok(env)
}

pub fn process_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_model_config_yaml() {
        let raw = r#"
models:
  - name: groq/llama-3.1-8b-instant
    provider: groq
    priority: 1
    requests_per_minute: 30
    requests_per_hour: 500
    requests_per_day: 7000
    url: https://api.groq.com/openai/v1/chat/completions
    token: secret
    max_request_length: 40000
    model_size: SMALL
    http_client_config:
      timeout_seconds: 60
      idle_conn_timeout_seconds: 90
"#;
        let config: Config = serde_yaml::from_str(raw).expect("parse");
        let model = &config.models[0];
        assert_eq!(model.size(), ModelSize::Small);
        assert_eq!(model.local_name(), "llama-3.1-8b-instant");
        assert!(!model.is_image_model());
        assert_eq!(model.http_client_config.timeout_seconds, 60);
    }

    #[test]
    fn image_model_has_zero_length() {
        let raw = r#"
models:
  - name: airforce/flux
    provider: airforce
    requests_per_minute: 5
    requests_per_hour: 50
    requests_per_day: 200
    url: https://api.airforce/imagine
"#;
        let config: Config = serde_yaml::from_str(raw).expect("parse");
        assert!(config.models[0].is_image_model());
    }

    #[test]
    fn retry_config_from_env() {
        let mut env = HashMap::new();
        env.insert("RETRY_MAX_RETRIES".to_string(), "5".to_string());
        env.insert("RETRY_BASE_DELAY".to_string(), "200ms".to_string());
        env.insert("RETRY_MAX_DELAY".to_string(), "10s".to_string());
        env.insert("RETRY_JITTER".to_string(), "0.25".to_string());
        let config = RetryConfig::from_env(&env);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay, Duration::from_millis(200));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert!((config.jitter - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn retry_config_ignores_malformed_values() {
        let mut env = HashMap::new();
        env.insert("RETRY_BASE_DELAY".to_string(), "soon".to_string());
        let config = RetryConfig::from_env(&env);
        assert_eq!(config.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn env_file_parsing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".env");
        std::fs::write(&path, "# comment\nAUTH_TOKEN=abc\nPORT=\"9090\"\n\n").expect("write");
        let env = load_env_file(&path).expect("load");
        assert_eq!(env.get("AUTH_TOKEN").map(String::as_str), Some("abc"));
        assert_eq!(env.get("PORT").map(String::as_str), Some("9090"));
    }
}
