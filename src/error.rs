use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimit,
    Provider,
    Network,
    Configuration,
    ModelSelection,
    Validation,
    Authentication,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit_error",
            Self::Provider => "provider_error",
            Self::Network => "network_error",
            Self::Configuration => "configuration_error",
            Self::ModelSelection => "model_selection_error",
            Self::Validation => "validation_error",
            Self::Authentication => "authentication_error",
        }
    }

    pub fn default_status(&self) -> StatusCode {
        match self {
            Self::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::Provider => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Network => StatusCode::BAD_GATEWAY,
            Self::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ModelSelection => StatusCode::SERVICE_UNAVAILABLE,
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Authentication => StatusCode::UNAUTHORIZED,
        }
    }
}

/// The error currency of the proxy. Carries the typed kind, the HTTP status
/// written to the client, and optional provider/model tags plus a rendered
/// cause that is logged but never disclosed downstream.
#[derive(Debug, Clone)]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub status: StatusCode,
    pub message: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub cause: Option<String>,
    /// Explicit retryability override; when unset the status decides.
    pub retryable: Option<bool>,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: kind.default_status(),
            message: message.into(),
            provider: None,
            model: None,
            cause: None,
            retryable: None,
        }
    }

    pub fn rate_limit(message: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message).with_model(model)
    }

    pub fn provider(
        message: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        let mut err = Self::new(ErrorKind::Provider, message).with_model(model);
        err.provider = Some(provider.into());
        err.status = status;
        err
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn model_selection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ModelSelection, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = Some(false);
        self
    }

    /// Rate-limit errors, 429s, and any 5xx are worth sending the caller
    /// back to the selector for another model, unless the producer said
    /// otherwise.
    pub fn is_retryable(&self) -> bool {
        if let Some(retryable) = self.retryable {
            return retryable;
        }
        self.kind == ErrorKind::RateLimit
            || self.status == StatusCode::TOO_MANY_REQUESTS
            || self.status.is_server_error()
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.provider, &self.model) {
            (Some(provider), _) => write!(
                f,
                "[{}] {} (provider: {})",
                self.kind.as_str(),
                self.message,
                provider
            ),
            (None, Some(model)) => write!(
                f,
                "[{}] {} (model: {})",
                self.kind.as_str(),
                self.message,
                model
            ),
            (None, None) => write!(f, "[{}] {}", self.kind.as_str(), self.message),
        }
    }
}

impl std::error::Error for ProxyError {}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: &'static str,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.kind.as_str(),
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_covers_rate_limit_and_5xx() {
        assert!(ProxyError::rate_limit("quota", "m").is_retryable());
        assert!(
            ProxyError::provider("boom", "openai", "m", StatusCode::INTERNAL_SERVER_ERROR)
                .is_retryable()
        );
        assert!(
            ProxyError::provider("slow down", "openai", "m", StatusCode::TOO_MANY_REQUESTS)
                .is_retryable()
        );
        assert!(ProxyError::network("refused").is_retryable());
    }

    #[test]
    fn non_retryable_client_errors() {
        assert!(!ProxyError::validation("bad body").is_retryable());
        assert!(
            !ProxyError::provider("nope", "openai", "m", StatusCode::BAD_REQUEST).is_retryable()
        );
        assert!(!ProxyError::configuration("missing model").is_retryable());
    }

    #[test]
    fn override_beats_status() {
        let err = ProxyError::provider(
            "no content",
            "openai",
            "m",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
        .non_retryable();
        assert!(!err.is_retryable());
    }

    #[test]
    fn display_includes_provider_tag() {
        let err = ProxyError::provider("boom", "cohere", "cohere/x", StatusCode::BAD_GATEWAY);
        assert_eq!(err.to_string(), "[provider_error] boom (provider: cohere)");
    }
}
