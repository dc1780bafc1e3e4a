//!
//! src/retry.rs  Andrew Belles  Oct 5th, 2025
//!
//! Generic retry wrapper with exponential backoff and jitter, the http
//! status classification every client shares
//!

use std::future::Future;
use std::time::Duration;

use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryConfig;
use crate::errors::EtlError;

/// Exponential backoff capped by the policy, plus 50..=200ms of jitter
pub fn generate_backoff(policy: &RetryConfig, attempt: usize, rng: &mut SmallRng) -> Duration {
    let base = policy.base_backoff.as_millis() as u64;
    let exp = (1_u64 << attempt.min(6)).saturating_mul(base);
    let capped = exp.min(policy.max_backoff.as_millis() as u64);
    let jitter = if policy.jitter { rng.gen_range(50..=200) } else { 0 };
    Duration::from_millis(capped + jitter)
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// retry cap is hit. The final error is returned unchanged
pub async fn with_retry<T, F, Fut>(
    policy: &RetryConfig,
    label: &str,
    mut op: F
) -> Result<T, EtlError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EtlError>>
{
    let mut rng = SmallRng::from_entropy();
    let mut attempt = 0_usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let backoff = generate_backoff(policy, attempt, &mut rng);
                warn!(
                    op = label, attempt, error = %e,
                    backoff_ms = backoff.as_millis() as u64, "http.retry"
                );
                sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e)
        }
    }
}

/// Maps a non-success status to the error taxonomy
pub fn classify_status(status: u16, body: &str) -> EtlError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        403 if body.contains("quotaExceeded") => EtlError::QuotaExceeded(snippet),
        404 => EtlError::NotFound(snippet),
        429 => EtlError::RateLimited(snippet),
        _ => EtlError::Upstream { status, message: snippet }
    }
}

/// Sends once and decodes a json body
pub async fn send_json(request: reqwest::RequestBuilder) -> Result<serde_json::Value, EtlError> {
    let resp = request.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<serde_json::Value>().await?);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), &body))
}

/// Sends once and returns the body as text (html scrapes)
pub async fn send_text(request: reqwest::RequestBuilder) -> Result<String, EtlError> {
    let resp = request.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.text().await?);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), &body))
}

/// `send_json` under `with_retry`; the builder is cloned per attempt
pub async fn http_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryConfig,
    label: &str
) -> Result<serde_json::Value, EtlError> {
    with_retry(policy, label, || {
        let attempt = request.try_clone();
        async move {
            let attempt = attempt
                .ok_or_else(|| EtlError::Http("non-cloneable request".to_string()))?;
            send_json(attempt).await
        }
    }).await
}
