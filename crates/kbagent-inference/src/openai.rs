//! OpenAI-shaped backend for LocalAI-style servers: `POST /v1/completions`,
//! `POST /v1/chat/completions`, `POST /v1/embeddings`, `GET /v1/models`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use kbagent_core::backend::{
    BackendError, BackendHealth, BackendResult, ChatMessage, EmbedOptions, GenerateOptions,
    HealthStatus, InferenceBackend, ModelInfo,
};
use kbagent_core::config::Config;

use crate::{send_with_retries, validate_embed_input, validate_embedding};

const BACKEND_NAME: &str = "openai-compat";

pub struct OpenAiBackend {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    default_timeout: Duration,
    max_retries: u32,
    semaphore: Arc<Semaphore>,
    embedding_min_length: usize,
}

impl OpenAiBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout_s: u64,
        max_retries: u32,
        concurrent_requests: usize,
        embedding_min_length: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("build openai-compat http client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            default_timeout: Duration::from_secs(timeout_s),
            max_retries,
            semaphore: Arc::new(Semaphore::new(concurrent_requests.max(1))),
            embedding_min_length,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.localai_api_url.clone(),
            config.localai_api_key.clone(),
            config.localai_timeout_s,
            config.localai_max_retries,
            config.localai_concurrent_requests,
            config.embedding_min_length,
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).json(body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        builder
    }

    fn timeout(&self, override_secs: Option<u64>) -> Duration {
        override_secs.map(Duration::from_secs).unwrap_or(self.default_timeout)
    }
}

/// Shared sampler mapping for completions and chat. top_k, min_p,
/// repeat_penalty, gpu hints, and images have no wire equivalent here and
/// are silently dropped.
fn apply_sampler(body: &mut Value, opts: &GenerateOptions) {
    if let Some(v) = opts.temperature {
        body["temperature"] = json!(v);
    }
    if let Some(v) = opts.max_tokens {
        body["max_tokens"] = json!(v);
    }
    if let Some(v) = opts.top_p {
        body["top_p"] = json!(v);
    }
    if let Some(v) = opts.options.seed {
        body["seed"] = json!(v);
    }
    if !opts.options.stop.is_empty() {
        body["stop"] = json!(opts.options.stop);
    }
    if let Some(v) = opts.options.presence_penalty {
        body["presence_penalty"] = json!(v);
    }
    if let Some(v) = opts.options.frequency_penalty {
        body["frequency_penalty"] = json!(v);
    }
    if opts.options.json_mode {
        body["response_format"] = json!({"type": "json_object"});
    }
}

fn completions_body(model: &str, prompt: &str, opts: &GenerateOptions) -> Value {
    let mut body = json!({"model": model, "prompt": prompt});
    apply_sampler(&mut body, opts);
    body
}

fn chat_body(model: &str, messages: &[ChatMessage], opts: &GenerateOptions) -> Value {
    let rendered: Vec<Value> = messages
        .iter()
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect();
    let mut body = json!({"model": model, "messages": rendered});
    apply_sampler(&mut body, opts);
    body
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> BackendResult<String> {
        let _permit = self.semaphore.acquire().await.map_err(|_| BackendError::Generic {
            backend: BACKEND_NAME.into(),
            operation: "generate".into(),
            message: "backend shut down".into(),
        })?;
        let body = completions_body(model, prompt, opts);
        let url = self.url("/v1/completions");
        let value = send_with_retries(
            BACKEND_NAME,
            "generate",
            self.max_retries,
            self.timeout(opts.timeout_secs),
            || self.request(&url, &body),
        )
        .await?;
        Ok(value["choices"][0]["text"].as_str().unwrap_or_default().to_string())
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> BackendResult<String> {
        let _permit = self.semaphore.acquire().await.map_err(|_| BackendError::Generic {
            backend: BACKEND_NAME.into(),
            operation: "chat".into(),
            message: "backend shut down".into(),
        })?;
        let body = chat_body(model, messages, opts);
        let url = self.url("/v1/chat/completions");
        let value = send_with_retries(
            BACKEND_NAME,
            "chat",
            self.max_retries,
            self.timeout(opts.timeout_secs),
            || self.request(&url, &body),
        )
        .await?;
        Ok(value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn embed(&self, model: &str, text: &str, opts: &EmbedOptions) -> BackendResult<Vec<f32>> {
        validate_embed_input(BACKEND_NAME, text)?;
        let _permit = self.semaphore.acquire().await.map_err(|_| BackendError::Generic {
            backend: BACKEND_NAME.into(),
            operation: "embed".into(),
            message: "backend shut down".into(),
        })?;
        let body = json!({"model": model, "input": text});
        let url = self.url("/v1/embeddings");
        let value = send_with_retries(
            BACKEND_NAME,
            "embed",
            self.max_retries,
            self.timeout(opts.timeout_secs),
            || self.request(&url, &body),
        )
        .await?;
        let vector: Vec<f32> = value["data"][0]["embedding"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
            .unwrap_or_default();
        validate_embedding(BACKEND_NAME, vector, self.embedding_min_length)
    }

    async fn list_models(&self) -> BackendResult<Vec<ModelInfo>> {
        let url = self.url("/v1/models");
        let value = send_with_retries(
            BACKEND_NAME,
            "list_models",
            self.max_retries,
            self.default_timeout,
            || {
                let mut builder = self.client.get(&url);
                if !self.api_key.is_empty() {
                    builder = builder.bearer_auth(&self.api_key);
                }
                builder
            },
        )
        .await?;
        let models = value["data"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["id"].as_str())
                    .map(|id| ModelInfo { id: id.to_string(), name: id.to_string() })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn health(&self) -> BackendHealth {
        match self.list_models().await {
            Ok(models) => BackendHealth {
                status: HealthStatus::Healthy,
                configured_url: self.base_url.clone(),
                available_model_count: models.len(),
                last_error: None,
            },
            Err(e) => BackendHealth {
                status: HealthStatus::Unhealthy,
                configured_url: self.base_url.clone(),
                available_model_count: 0,
                last_error: Some(e.to_string()),
            },
        }
    }
}
