use crate::config::{ModelConfig, ModelSize};
use crate::registry::ModelRegistry;
use std::time::Duration;
use tokio::time::Instant;

const COLD_AGE: Duration = Duration::from_secs(3600);

/// Picks an eligible model for a size-class request and reserves one slot
/// on it. Returns `None` when no configured model can take the request.
///
/// The scan and the reservation take each candidate's lock individually
/// and never nest; a model chosen in the scan can still lose its slot to
/// a concurrent selector, in which case the caller retries.
pub fn select_model(
    registry: &ModelRegistry,
    size: ModelSize,
    request_length: usize,
    now: Instant,
) -> Option<String> {
    let mut selected: Option<(&ModelConfig, Option<Instant>)> = None;

    for model in registry.models() {
        if model.size() != size {
            continue;
        }
        if request_length > model.max_request_length {
            continue;
        }
        let Some(limit) = registry.limit(&model.name) else {
            continue;
        };
        let snapshot = limit.snapshot();
        if snapshot.minute >= model.requests_per_minute
            || snapshot.hour >= model.requests_per_hour
            || snapshot.day >= model.requests_per_day
        {
            continue;
        }
        let last_request = snapshot.last_request;

        let should_select = match &selected {
            None => true,
            Some((best, best_last)) => {
                if model.priority < best.priority {
                    true
                } else if model.priority == best.priority {
                    // When both candidates have been idle for over an hour,
                    // prefer the smaller model; otherwise the one used
                    // longest ago.
                    let cold_cutoff = now.checked_sub(COLD_AGE);
                    if is_older_than(last_request, cold_cutoff)
                        && is_older_than(*best_last, cold_cutoff)
                        && model.max_request_length < best.max_request_length
                    {
                        true
                    } else {
                        is_before(last_request, *best_last)
                    }
                } else {
                    false
                }
            }
        };

        if should_select {
            selected = Some((model, last_request));
        }
    }

    let (model, _) = selected?;
    let limit = registry.limit(&model.name)?;
    if limit.try_reserve(model, now) {
        Some(model.name.clone())
    } else {
        None
    }
}

/// Image models eligible right now, in configuration order. The caller
/// attempts them one by one; no reservation is made for image requests.
pub fn eligible_image_models(registry: &ModelRegistry) -> Vec<String> {
    registry
        .models()
        .iter()
        .filter(|model| model.is_image_model())
        .filter(|model| {
            registry
                .limit(&model.name)
                .map(|limit| limit.within_limits(model))
                .unwrap_or(false)
        })
        .map(|model| model.name.clone())
        .collect()
}

fn is_older_than(last: Option<Instant>, cutoff: Option<Instant>) -> bool {
    match (last, cutoff) {
        // Never used counts as arbitrarily old.
        (None, _) => true,
        (Some(_), None) => false,
        (Some(last), Some(cutoff)) => last < cutoff,
    }
}

fn is_before(a: Option<Instant>, b: Option<Instant>) -> bool {
    match (a, b) {
        (None, None) => false,
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a < b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn registry(models_yaml: &str) -> ModelRegistry {
        let config: Config = serde_yaml::from_str(models_yaml).expect("config yaml");
        ModelRegistry::from_config(&config).expect("registry")
    }

    fn small_pair(rpm_a: u32, rpm_b: u32) -> ModelRegistry {
        registry(&format!(
            r#"
models:
  - name: openai/alpha
    provider: openai
    priority: 1
    requests_per_minute: {rpm_a}
    requests_per_hour: 100
    requests_per_day: 1000
    url: http://localhost
    max_request_length: 10000
    model_size: SMALL
  - name: groq/beta
    provider: groq
    priority: 2
    requests_per_minute: {rpm_b}
    requests_per_hour: 100
    requests_per_day: 1000
    url: http://localhost
    max_request_length: 10000
    model_size: SMALL
"#
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn lowest_priority_wins() {
        let registry = small_pair(10, 10);
        let chosen = select_model(&registry, ModelSize::Small, 100, Instant::now());
        assert_eq!(chosen.as_deref(), Some("openai/alpha"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_quota_falls_through_to_next_priority() {
        let registry = small_pair(0, 10);
        let chosen = select_model(&registry, ModelSize::Small, 100, Instant::now());
        assert_eq!(chosen.as_deref(), Some("groq/beta"));
        let snapshot = registry.limit("groq/beta").unwrap().snapshot();
        assert_eq!(snapshot.minute, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn request_length_filters_models() {
        let registry = small_pair(10, 10);
        assert!(select_model(&registry, ModelSize::Small, 20000, Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn size_class_filters_models() {
        let registry = small_pair(10, 10);
        assert!(select_model(&registry, ModelSize::Big, 100, Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priority_prefers_least_recently_used() {
        let registry = registry(
            r#"
models:
  - name: openai/alpha
    provider: openai
    priority: 1
    requests_per_minute: 10
    requests_per_hour: 100
    requests_per_day: 1000
    url: http://localhost
    max_request_length: 10000
    model_size: SMALL
  - name: groq/beta
    provider: groq
    priority: 1
    requests_per_minute: 10
    requests_per_hour: 100
    requests_per_day: 1000
    url: http://localhost
    max_request_length: 10000
    model_size: SMALL
"#,
        );
        let first = select_model(&registry, ModelSize::Small, 100, Instant::now()).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        let second = select_model(&registry, ModelSize::Small, 100, Instant::now()).unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn cold_tie_break_prefers_smaller_model() {
        // Both idle beyond the cold cutoff: the smaller max_request_length
        // wins even though it is listed second.
        let registry = registry(
            r#"
models:
  - name: openai/large
    provider: openai
    priority: 1
    requests_per_minute: 10
    requests_per_hour: 100
    requests_per_day: 1000
    url: http://localhost
    max_request_length: 50000
    model_size: SMALL
  - name: groq/small
    provider: groq
    priority: 1
    requests_per_minute: 10
    requests_per_hour: 100
    requests_per_day: 1000
    url: http://localhost
    max_request_length: 10000
    model_size: SMALL
"#,
        );
        tokio::time::advance(Duration::from_secs(7200)).await;
        let chosen = select_model(&registry, ModelSize::Small, 100, Instant::now());
        assert_eq!(chosen.as_deref(), Some("groq/small"));
    }

    #[tokio::test(start_paused = true)]
    async fn penalized_model_is_skipped() {
        let registry = small_pair(10, 10);
        registry.penalize("openai/alpha");
        let chosen = select_model(&registry, ModelSize::Small, 100, Instant::now());
        assert_eq!(chosen.as_deref(), Some("groq/beta"));
    }

    #[tokio::test(start_paused = true)]
    async fn image_models_listed_in_config_order() {
        let registry = registry(
            r#"
models:
  - name: openai/text
    provider: openai
    requests_per_minute: 10
    requests_per_hour: 100
    requests_per_day: 1000
    url: http://localhost
    max_request_length: 10000
    model_size: SMALL
  - name: huggingface/flux-dev
    provider: huggingface
    requests_per_minute: 5
    requests_per_hour: 50
    requests_per_day: 100
    url: http://localhost
  - name: airforce/flux
    provider: airforce
    requests_per_minute: 5
    requests_per_hour: 50
    requests_per_day: 100
    url: http://localhost
"#,
        );
        let eligible = eligible_image_models(&registry);
        assert_eq!(eligible, vec!["huggingface/flux-dev", "airforce/flux"]);
        registry.penalize("huggingface/flux-dev");
        assert_eq!(eligible_image_models(&registry), vec!["airforce/flux"]);
    }
}
