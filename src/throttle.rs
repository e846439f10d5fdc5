use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Per-provider minimum inter-request gate. The mutex is held across the
/// sleep so contenders queue behind the pause; that serialization is the
/// point of the throttle.
pub struct Throttle {
    last_request: Mutex<Instant>,
    min_interval: Duration,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(Instant::now()),
            min_interval,
        }
    }

    pub async fn wait(&self, label: &str) {
        let mut last = self.last_request.lock().await;
        let elapsed = last.elapsed();
        if elapsed < self.min_interval {
            let pause = self.min_interval - elapsed;
            tracing::debug!(model = label, pause_ms = pause.as_millis() as u64, "throttled");
            sleep(pause).await;
        }
        *last = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn enforces_minimum_gap() {
        let throttle = Throttle::new(Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        let started = Instant::now();
        throttle.wait("m").await;
        assert!(started.elapsed() < Duration::from_millis(10));
        // Immediately after a dispatch the full interval applies.
        let started = Instant::now();
        throttle.wait("m").await;
        assert!(started.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn contenders_are_serialized() {
        let throttle = std::sync::Arc::new(Throttle::new(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        let started = Instant::now();
        let a = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.wait("a").await })
        };
        let b = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.wait("b").await })
        };
        a.await.unwrap();
        b.await.unwrap();
        // One of the two must have waited the full interval behind the other.
        assert!(started.elapsed() >= Duration::from_millis(990));
    }
}
