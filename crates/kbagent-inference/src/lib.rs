//! Inference backend implementations.
//!
//! Two wire formats cover the deployments we target: the Ollama native API
//! and OpenAI-compatible servers (LocalAI and friends). Both map onto the
//! capability trait in `kbagent_core::backend`; a factory picks one from
//! configuration and falls back to Ollama when the configured backend
//! cannot be built.

pub mod factory;
pub mod ollama;
pub mod openai;

use std::time::Duration;

use kbagent_core::backend::{BackendError, BackendResult};
use rand::Rng;
use tracing::warn;

const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 30;

/// Send a request, retrying transient failures with exponential backoff.
/// Timeouts, connection errors, and 5xx responses retry; a 429 honors the
/// server's Retry-After; other 4xx fail immediately.
pub(crate) async fn send_with_retries(
    backend: &str,
    operation: &'static str,
    max_retries: u32,
    timeout: Duration,
    build: impl Fn() -> reqwest::RequestBuilder,
) -> BackendResult<serde_json::Value> {
    let attempts = max_retries.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let response = build().timeout(timeout).send().await;
        let error = match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json::<serde_json::Value>().await.map_err(|e| {
                        BackendError::Generic {
                            backend: backend.to_string(),
                            operation: operation.to_string(),
                            message: format!("invalid JSON response: {e}"),
                        }
                    });
                }
                let retry_after_header = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok());
                let body = response.text().await.unwrap_or_default();
                classify_status(backend, operation, status, &body, retry_after_header)
            }
            Err(e) => classify_transport(backend, operation, &e, timeout),
        };

        if !error.is_retryable() || attempt == attempts {
            return Err(error);
        }
        let delay = error
            .retry_after()
            .map(Duration::from_secs)
            .unwrap_or_else(|| backoff_delay(attempt));
        warn!("[{backend}] {operation} attempt {attempt}/{attempts} failed: {error}; retrying in {delay:?}");
        last_error = Some(error);
        tokio::time::sleep(delay).await;
    }

    // Unreachable in practice; the loop always returns.
    Err(last_error.unwrap_or_else(|| BackendError::Generic {
        backend: backend.to_string(),
        operation: operation.to_string(),
        message: "retry loop exhausted".to_string(),
    }))
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_SECS.saturating_mul(1u64 << (attempt - 1).min(10));
    let capped = exp.min(BACKOFF_CAP_SECS);
    let jitter_ms: u64 = rand::thread_rng().gen_range(0..250);
    Duration::from_secs(capped) + Duration::from_millis(jitter_ms)
}

fn classify_transport(
    backend: &str,
    operation: &str,
    error: &reqwest::Error,
    timeout: Duration,
) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout {
            backend: backend.to_string(),
            operation: operation.to_string(),
            timeout_secs: timeout.as_secs(),
        }
    } else {
        BackendError::Connection {
            backend: backend.to_string(),
            operation: operation.to_string(),
            message: error.to_string(),
        }
    }
}

fn classify_status(
    backend: &str,
    operation: &str,
    status: reqwest::StatusCode,
    body: &str,
    retry_after_header: Option<u64>,
) -> BackendError {
    let excerpt: String = body.chars().take(300).collect();
    match status.as_u16() {
        401 | 403 => BackendError::Auth {
            backend: backend.to_string(),
            operation: operation.to_string(),
        },
        404 => BackendError::Model {
            backend: backend.to_string(),
            operation: operation.to_string(),
            message: format!("model or endpoint not found: {excerpt}"),
        },
        429 => BackendError::RateLimit {
            backend: backend.to_string(),
            operation: operation.to_string(),
            retry_after: retry_after_header.or_else(|| parse_retry_after(body)),
        },
        code if (400..500).contains(&code) => BackendError::Validation {
            backend: backend.to_string(),
            operation: operation.to_string(),
            message: format!("HTTP {code}: {excerpt}"),
        },
        code => BackendError::Generic {
            backend: backend.to_string(),
            operation: operation.to_string(),
            message: format!("HTTP {code}: {excerpt}"),
        },
    }
}

// Retry-After normally arrives as a header; reqwest gives us the body here,
// so also accept the JSON field some servers embed.
fn parse_retry_after(body: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value["retry_after"].as_u64()
}

/// Check an embedding input before any HTTP round trip.
pub(crate) fn validate_embed_input(backend: &str, text: &str) -> BackendResult<()> {
    if text.trim().is_empty() {
        return Err(BackendError::validation(
            backend,
            "embed",
            "input text is empty or whitespace-only",
        ));
    }
    Ok(())
}

/// Check an embedding vector meets the minimum dimension.
pub(crate) fn validate_embedding(
    backend: &str,
    vector: Vec<f32>,
    min_length: usize,
) -> BackendResult<Vec<f32>> {
    if vector.len() < min_length {
        return Err(BackendError::Model {
            backend: backend.to_string(),
            operation: "embed".to_string(),
            message: format!("embedding dimension {} below minimum {min_length}", vector.len()),
        });
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let e = classify_status("ollama", "generate", reqwest::StatusCode::UNAUTHORIZED, "", None);
        assert!(matches!(e, BackendError::Auth { .. }));

        let e =
            classify_status("ollama", "generate", reqwest::StatusCode::NOT_FOUND, "no model", None);
        assert!(matches!(e, BackendError::Model { .. }));

        let e = classify_status("ollama", "generate", reqwest::StatusCode::BAD_REQUEST, "bad", None);
        assert!(matches!(e, BackendError::Validation { .. }));
        assert!(!e.is_retryable());

        let e = classify_status("ollama", "generate", reqwest::StatusCode::BAD_GATEWAY, "oops", None);
        assert!(matches!(e, BackendError::Generic { .. }));
        assert!(e.is_retryable());
    }

    #[test]
    fn rate_limit_prefers_header_over_body() {
        let e = classify_status(
            "openai-compat",
            "chat",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"retry_after": 12}"#,
            None,
        );
        assert!(matches!(e, BackendError::RateLimit { retry_after: Some(12), .. }));

        let e = classify_status(
            "openai-compat",
            "chat",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"retry_after": 12}"#,
            Some(30),
        );
        assert!(matches!(e, BackendError::RateLimit { retry_after: Some(30), .. }));
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_delay(1) >= Duration::from_secs(1));
        assert!(backoff_delay(2) >= Duration::from_secs(2));
        assert!(backoff_delay(10) <= Duration::from_secs(BACKOFF_CAP_SECS + 1));
    }

    #[test]
    fn empty_embed_input_rejected() {
        assert!(validate_embed_input("ollama", "").is_err());
        assert!(validate_embed_input("ollama", "   \n").is_err());
        assert!(validate_embed_input("ollama", "text").is_ok());
    }

    #[test]
    fn short_embedding_rejected() {
        assert!(validate_embedding("ollama", vec![0.0; 50], 100).is_err());
        assert!(validate_embedding("ollama", vec![0.0; 128], 100).is_ok());
    }
}
