use crate::config::{Config, ModelConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::upstream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Sliding-window counters for one model. Windows are anchored on first
/// use and reset lazily at the next reservation after they elapse.
#[derive(Debug, Default)]
struct RateLimitState {
    minute: u32,
    hour: u32,
    day: u32,
    last_minute: Option<Instant>,
    last_hour: Option<Instant>,
    last_day: Option<Instant>,
    last_request: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSnapshot {
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
    pub last_request: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct RateLimit {
    inner: Mutex<RateLimitState>,
}

fn reset_window(counter: &mut u32, anchor: &mut Option<Instant>, window: Duration, now: Instant) {
    match *anchor {
        None => *anchor = Some(now),
        Some(at) if now.duration_since(at) >= window => {
            *counter = 0;
            *anchor = Some(now);
        }
        Some(_) => {}
    }
}

impl RateLimit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically reserves one request slot: applies window resets, checks
    /// all three bounds, and increments every counter on success.
    pub fn try_reserve(&self, model: &ModelConfig, now: Instant) -> bool {
        let mut guard = self.inner.lock().expect("rate limit lock poisoned");
        let state = &mut *guard;
        reset_window(&mut state.minute, &mut state.last_minute, MINUTE, now);
        reset_window(&mut state.hour, &mut state.last_hour, HOUR, now);
        reset_window(&mut state.day, &mut state.last_day, DAY, now);
        if state.minute >= model.requests_per_minute
            || state.hour >= model.requests_per_hour
            || state.day >= model.requests_per_day
        {
            return false;
        }
        state.minute += 1;
        state.hour += 1;
        state.day += 1;
        state.last_request = Some(now);
        true
    }

    /// Saturates the minute counter so the model is skipped until the next
    /// minute-window reset. Hour and day counters are untouched.
    pub fn penalize(&self, requests_per_minute: u32, now: Instant) {
        let mut state = self.inner.lock().expect("rate limit lock poisoned");
        state.minute = requests_per_minute + 1;
        state.last_minute = Some(now);
    }

    /// Fresh read of the counters. No resets are applied; they happen on
    /// reservation.
    pub fn snapshot(&self) -> RateLimitSnapshot {
        let state = self.inner.lock().expect("rate limit lock poisoned");
        RateLimitSnapshot {
            minute: state.minute,
            hour: state.hour,
            day: state.day,
            last_request: state.last_request,
        }
    }

    pub fn within_limits(&self, model: &ModelConfig) -> bool {
        let snapshot = self.snapshot();
        snapshot.minute < model.requests_per_minute
            && snapshot.hour < model.requests_per_hour
            && snapshot.day < model.requests_per_day
    }
}

/// The catalog of configured upstream models. Descriptors, HTTP clients,
/// and rate-limit records are built once at startup and read-only after.
pub struct ModelRegistry {
    models: Vec<ModelConfig>,
    limits: HashMap<String, Arc<RateLimit>>,
    clients: HashMap<String, reqwest::Client>,
}

impl ModelRegistry {
    pub fn from_config(config: &Config) -> ProxyResult<Self> {
        let mut limits = HashMap::new();
        let mut clients = HashMap::new();
        for model in &config.models {
            if model.name.trim().is_empty() {
                return Err(ProxyError::configuration("model name must not be empty"));
            }
            limits.insert(model.name.clone(), Arc::new(RateLimit::new()));
            clients.insert(
                model.name.clone(),
                upstream::build_client(&model.http_client_config)?,
            );
        }
        Ok(Self {
            models: config.models.clone(),
            limits,
            clients,
        })
    }

    pub fn models(&self) -> &[ModelConfig] {
        &self.models
    }

    pub fn get(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn limit(&self, name: &str) -> Option<&Arc<RateLimit>> {
        self.limits.get(name)
    }

    pub fn client(&self, name: &str) -> Option<&reqwest::Client> {
        self.clients.get(name)
    }

    /// Applies the failure penalty to the named model.
    pub fn penalize(&self, name: &str) {
        let Some(model) = self.get(name) else {
            return;
        };
        if let Some(limit) = self.limits.get(name) {
            limit.penalize(model.requests_per_minute, Instant::now());
        }
    }
}
