use crate::config::RetryConfig;
use crate::error::{ProxyError, ProxyResult};
use bytes::Bytes;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use rand::RngCore;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;

pub type ByteStream = Pin<Box<dyn Stream<Item = ProxyResult<Bytes>> + Send>>;

/// Re-issues the upstream call and returns a fresh open stream. Captures
/// everything the call needs; nothing leaks back into the reader except
/// the new stream handle.
pub type StreamFactory =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = ProxyResult<ByteStream>> + Send>> + Send + Sync>;

pub type RetryCallback = Box<dyn Fn(u32, &ProxyError) + Send + Sync>;

/// Wraps an upstream byte stream so the client-facing stream survives
/// transient upstream failures. On a read failure the reader backs off,
/// re-issues the upstream call through the factory, and continues from
/// the fresh stream. This is a cold restart: bytes already delivered are
/// not re-sent and bytes lost upstream are gone; clients must tolerate
/// duplication or omission at the event boundary.
pub struct RetryStreamReader {
    current: ByteStream,
    recreator: Option<StreamFactory>,
    buffered: VecDeque<Bytes>,
    finished: bool,
    retry_count: u32,
    config: RetryConfig,
    on_retry: Option<RetryCallback>,
}

impl RetryStreamReader {
    pub fn new(initial: ByteStream, recreator: Option<StreamFactory>, config: RetryConfig) -> Self {
        Self {
            current: initial,
            recreator,
            buffered: VecDeque::new(),
            finished: false,
            retry_count: 0,
            config,
            on_retry: None,
        }
    }

    pub fn set_retry_callback(&mut self, callback: RetryCallback) {
        self.on_retry = Some(callback);
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Splices an SSE keep-alive comment at the current read position.
    pub fn inject_comment(&mut self, comment: &str) {
        self.buffered
            .push_front(Bytes::from(format!(": {comment}\n\n")));
    }

    /// Marks the reader terminated; every subsequent read reports
    /// end-of-stream.
    pub fn close(&mut self) {
        self.finished = true;
    }

    pub async fn next_chunk(&mut self) -> Option<ProxyResult<Bytes>> {
        if self.finished {
            return None;
        }
        if let Some(chunk) = self.buffered.pop_front() {
            return Some(Ok(chunk));
        }
        loop {
            match self.current.next().await {
                Some(Ok(chunk)) => return Some(Ok(chunk)),
                None => {
                    self.finished = true;
                    return None;
                }
                Some(Err(err)) => {
                    if self.retry_count >= self.config.max_retries {
                        self.finished = true;
                        return Some(Err(ProxyError::network(format!(
                            "max retries exceeded: {err}"
                        ))
                        .with_cause(err)));
                    }
                    if let Some(callback) = &self.on_retry {
                        callback(self.retry_count + 1, &err);
                    }
                    sleep(backoff_delay(&self.config, self.retry_count)).await;
                    self.retry_count += 1;
                    if let Some(recreate) = &self.recreator {
                        match recreate().await {
                            Ok(stream) => self.current = stream,
                            Err(recreate_err) => {
                                self.finished = true;
                                return Some(Err(ProxyError::network(format!(
                                    "failed to recreate stream: {recreate_err}, original error: {err}"
                                ))));
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProxyResult<Bytes>> + Send {
        futures_util::stream::unfold(self, |mut reader| async move {
            reader.next_chunk().await.map(|item| (item, reader))
        })
    }
}

/// Exponential backoff clamped at max_delay, spread by symmetric jitter:
/// `base * 2^attempt * (1 - jitter + 2 * jitter * r)` with `r` in [0, 1).
fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let mut delay = config
        .base_delay
        .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    if delay > config.max_delay {
        delay = config.max_delay;
    }
    let r = secure_unit_random().unwrap_or(0.5);
    let factor = 1.0 - config.jitter + r * 2.0 * config.jitter;
    delay.mul_f64(factor.max(0.0))
}

fn secure_unit_random() -> Option<f64> {
    let mut buf = [0u8; 8];
    rand::rngs::OsRng.try_fill_bytes(&mut buf).ok()?;
    Some(u64::from_le_bytes(buf) as f64 / 2.0f64.powi(64))
}

const NETWORK_ERROR_INDICATORS: [&str; 7] = [
    "connection refused",
    "connection reset",
    "connection timed out",
    "no such host",
    "network is unreachable",
    "broken pipe",
    "i/o timeout",
];

const TIMEOUT_INDICATORS: [&str; 3] = ["timeout", "deadline exceeded", "i/o timeout"];

/// Whether an error is worth re-dispatching: a retryable status, a
/// network failure by message, or a timeout by message. End-of-stream is
/// a normal terminal condition, not an error, and never reaches here.
pub fn is_retryable_error(err: &ProxyError) -> bool {
    err.is_retryable() || is_network_error(err) || is_timeout_error(err)
}

fn is_network_error(err: &ProxyError) -> bool {
    let message = err.to_string().to_lowercase();
    NETWORK_ERROR_INDICATORS
        .iter()
        .any(|indicator| message.contains(indicator))
}

fn is_timeout_error(err: &ProxyError) -> bool {
    let message = err.to_string().to_lowercase();
    TIMEOUT_INDICATORS
        .iter()
        .any(|indicator| message.contains(indicator))
}
