//! Inference backend capability interface.
//!
//! Implementations live in `kbagent-inference`; the pipeline only ever sees
//! this trait plus the shared error taxonomy, keeping phase code
//! backend-agnostic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Error taxonomy ───────────────────────────────────────────────────────

/// Errors surfaced by every backend. Each variant carries the backend name
/// and the operation that failed.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("[{backend}] {operation}: connection failed: {message}")]
    Connection {
        backend: String,
        operation: String,
        message: String,
    },
    #[error("[{backend}] {operation}: timed out after {timeout_secs}s")]
    Timeout {
        backend: String,
        operation: String,
        timeout_secs: u64,
    },
    #[error("[{backend}] {operation}: model error: {message}")]
    Model {
        backend: String,
        operation: String,
        message: String,
    },
    #[error("[{backend}] {operation}: authentication failed")]
    Auth { backend: String, operation: String },
    #[error("[{backend}] {operation}: rate limit exceeded")]
    RateLimit {
        backend: String,
        operation: String,
        retry_after: Option<u64>,
    },
    #[error("[{backend}] {operation}: validation failed: {message}")]
    Validation {
        backend: String,
        operation: String,
        message: String,
    },
    #[error("[{backend}] {operation}: {message}")]
    Generic {
        backend: String,
        operation: String,
        message: String,
    },
}

impl BackendError {
    /// Transient errors worth retrying at the call site.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Connection { .. }
                | BackendError::Timeout { .. }
                | BackendError::RateLimit { .. }
                | BackendError::Generic { .. }
        )
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            BackendError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn validation(backend: &str, operation: &str, message: impl Into<String>) -> Self {
        BackendError::Validation {
            backend: backend.to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

// ── Request options ──────────────────────────────────────────────────────

/// Conventional sampler set accepted by `generate`/`chat`. Backends silently
/// drop options their wire format cannot express.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplerOptions {
    pub seed: Option<i64>,
    pub stop: Vec<String>,
    pub top_k: Option<u32>,
    pub min_p: Option<f32>,
    pub repeat_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    /// Ask the backend to constrain output to a single JSON object.
    pub json_mode: bool,
    /// GPU routing hint for multi-GPU hosts.
    pub gpu_device: Option<u32>,
    /// Base64-encoded images for vision-capable models.
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    /// Per-call override of the backend's default timeout.
    pub timeout_secs: Option<u64>,
    pub options: SamplerOptions,
}

#[derive(Debug, Clone, Default)]
pub struct EmbedOptions {
    pub timeout_secs: Option<u64>,
}

// ── Chat messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

// ── Health / models ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealth {
    pub status: HealthStatus,
    pub configured_url: String,
    pub available_model_count: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
}

// ── Capability trait ─────────────────────────────────────────────────────

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Single-turn completion.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> BackendResult<String>;

    /// Multi-turn completion.
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> BackendResult<String>;

    /// Embedding vector for a non-empty input text.
    async fn embed(&self, model: &str, text: &str, opts: &EmbedOptions) -> BackendResult<Vec<f32>>;

    async fn list_models(&self) -> BackendResult<Vec<ModelInfo>>;

    async fn health(&self) -> BackendHealth;

    /// Whether generate/chat honor `SamplerOptions::json_mode`.
    fn supports_json_mode(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let e = BackendError::Timeout {
            backend: "ollama".into(),
            operation: "generate".into(),
            timeout_secs: 30,
        };
        assert!(e.is_retryable());

        let e = BackendError::Auth { backend: "openai-compat".into(), operation: "chat".into() };
        assert!(!e.is_retryable());

        let e = BackendError::validation("ollama", "embed", "empty input");
        assert!(!e.is_retryable());
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let e = BackendError::RateLimit {
            backend: "openai-compat".into(),
            operation: "generate".into(),
            retry_after: Some(7),
        };
        assert!(e.is_retryable());
        assert_eq!(e.retry_after(), Some(7));
    }

    #[test]
    fn error_display_names_backend_and_operation() {
        let e = BackendError::Model {
            backend: "ollama".into(),
            operation: "generate".into(),
            message: "model not found".into(),
        };
        let s = e.to_string();
        assert!(s.contains("[ollama]"));
        assert!(s.contains("generate"));
    }
}
