//! Ollama-shaped backend: `POST /api/generate`, `POST /api/chat`,
//! `POST /api/embed`, `GET /api/tags`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::info;

use kbagent_core::backend::{
    BackendError, BackendHealth, BackendResult, ChatMessage, EmbedOptions, GenerateOptions,
    HealthStatus, InferenceBackend, ModelInfo,
};
use kbagent_core::config::Config;

use crate::{send_with_retries, validate_embed_input, validate_embedding};

const BACKEND_NAME: &str = "ollama";

pub struct OllamaBackend {
    base_url: String,
    client: reqwest::Client,
    default_timeout: Duration,
    max_retries: u32,
    semaphore: Arc<Semaphore>,
    embedding_min_length: usize,
}

// ── Wire types ───────────────────────────────────────────────────────────

/// Ollama's `options` object. Unset fields are omitted; sampler options the
/// API cannot express are dropped before this struct is built.
#[derive(Serialize, Default)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    main_gpu: Option<u32>,
}

impl OllamaOptions {
    fn from_opts(opts: &GenerateOptions) -> Self {
        let sampler = &opts.options;
        Self {
            temperature: opts.temperature,
            num_predict: opts.max_tokens,
            top_p: opts.top_p,
            seed: sampler.seed,
            stop: sampler.stop.clone(),
            top_k: sampler.top_k,
            min_p: sampler.min_p,
            repeat_penalty: sampler.repeat_penalty,
            presence_penalty: sampler.presence_penalty,
            frequency_penalty: sampler.frequency_penalty,
            main_gpu: sampler.gpu_device,
        }
    }
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Serialize)]
struct OllamaChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaChatMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

fn json_format(opts: &GenerateOptions) -> Option<&'static str> {
    opts.options.json_mode.then_some("json")
}

// ── Backend ──────────────────────────────────────────────────────────────

impl OllamaBackend {
    pub fn new(
        base_url: impl Into<String>,
        timeout_s: u64,
        max_retries: u32,
        concurrent_requests: usize,
        embedding_min_length: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("build ollama http client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            default_timeout: Duration::from_secs(timeout_s),
            max_retries,
            semaphore: Arc::new(Semaphore::new(concurrent_requests.max(1))),
            embedding_min_length,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.ollama_url.clone(),
            config.ollama_timeout_s,
            config.ollama_max_retries,
            config.ollama_concurrent_requests,
            config.embedding_min_length,
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn timeout(&self, override_secs: Option<u64>) -> Duration {
        override_secs.map(Duration::from_secs).unwrap_or(self.default_timeout)
    }

    async fn acquire(&self, operation: &str) -> BackendResult<tokio::sync::SemaphorePermit<'_>> {
        self.semaphore.acquire().await.map_err(|_| BackendError::Generic {
            backend: BACKEND_NAME.into(),
            operation: operation.into(),
            message: "backend shut down".into(),
        })
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> BackendResult<String> {
        let _permit = self.acquire("generate").await?;
        let body = OllamaGenerateRequest {
            model,
            prompt,
            stream: false,
            options: OllamaOptions::from_opts(opts),
            format: json_format(opts),
            images: opts.options.images.clone(),
        };
        let url = self.url("/api/generate");
        let value = send_with_retries(
            BACKEND_NAME,
            "generate",
            self.max_retries,
            self.timeout(opts.timeout_secs),
            || self.client.post(&url).json(&body),
        )
        .await?;
        Ok(value["response"].as_str().unwrap_or_default().to_string())
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> BackendResult<String> {
        let _permit = self.acquire("chat").await?;
        let body = OllamaChatRequest {
            model,
            messages: messages
                .iter()
                .map(|m| OllamaChatMessage { role: m.role.as_str(), content: &m.content })
                .collect(),
            stream: false,
            options: OllamaOptions::from_opts(opts),
            format: json_format(opts),
        };
        let url = self.url("/api/chat");
        let value = send_with_retries(
            BACKEND_NAME,
            "chat",
            self.max_retries,
            self.timeout(opts.timeout_secs),
            || self.client.post(&url).json(&body),
        )
        .await?;
        Ok(value["message"]["content"].as_str().unwrap_or_default().to_string())
    }

    async fn embed(&self, model: &str, text: &str, opts: &EmbedOptions) -> BackendResult<Vec<f32>> {
        validate_embed_input(BACKEND_NAME, text)?;
        let _permit = self.acquire("embed").await?;
        let body = OllamaEmbedRequest { model, input: text };
        let url = self.url("/api/embed");
        let value = send_with_retries(
            BACKEND_NAME,
            "embed",
            self.max_retries,
            self.timeout(opts.timeout_secs),
            || self.client.post(&url).json(&body),
        )
        .await?;
        let vector: Vec<f32> = value["embeddings"][0]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
            .unwrap_or_default();
        validate_embedding(BACKEND_NAME, vector, self.embedding_min_length)
    }

    async fn list_models(&self) -> BackendResult<Vec<ModelInfo>> {
        let url = self.url("/api/tags");
        let value = send_with_retries(
            BACKEND_NAME,
            "list_models",
            self.max_retries,
            self.default_timeout,
            || self.client.get(&url),
        )
        .await?;
        let models = value["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str())
                    .map(|name| ModelInfo { id: name.to_string(), name: name.to_string() })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn health(&self) -> BackendHealth {
        match self.list_models().await {
            Ok(models) => {
                info!("ollama healthy: {} model(s) at {}", models.len(), self.base_url);
                BackendHealth {
                    status: HealthStatus::Healthy,
                    configured_url: self.base_url.clone(),
                    available_model_count: models.len(),
                    last_error: None,
                }
            }
            Err(e) => BackendHealth {
                status: HealthStatus::Unhealthy,
                configured_url: self.base_url.clone(),
                available_model_count: 0,
                last_error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbagent_core::backend::SamplerOptions;

    fn to_value<T: Serialize>(body: &T) -> serde_json::Value {
        serde_json::to_value(body).unwrap()
    }

    #[test]
    fn generate_request_maps_sampler_options() {
        let opts = GenerateOptions {
            temperature: Some(0.7),
            max_tokens: Some(512),
            top_p: Some(0.9),
            timeout_secs: None,
            options: SamplerOptions {
                seed: Some(42),
                stop: vec!["###".into()],
                top_k: Some(40),
                json_mode: true,
                gpu_device: Some(1),
                ..SamplerOptions::default()
            },
        };
        let body = to_value(&OllamaGenerateRequest {
            model: "llama3.1",
            prompt: "hello",
            stream: false,
            options: OllamaOptions::from_opts(&opts),
            format: json_format(&opts),
            images: opts.options.images.clone(),
        });
        assert_eq!(body["model"], "llama3.1");
        assert_eq!(body["stream"], false);
        assert_eq!(body["format"], "json");
        assert_eq!(body["options"]["temperature"], 0.7);
        assert_eq!(body["options"]["num_predict"], 512);
        assert_eq!(body["options"]["seed"], 42);
        assert_eq!(body["options"]["top_k"], 40);
        assert_eq!(body["options"]["main_gpu"], 1);
    }

    #[test]
    fn generate_request_omits_unset_options() {
        let opts = GenerateOptions::default();
        let body = to_value(&OllamaGenerateRequest {
            model: "m",
            prompt: "p",
            stream: false,
            options: OllamaOptions::from_opts(&opts),
            format: json_format(&opts),
            images: vec![],
        });
        assert!(body.get("format").is_none());
        assert!(body.get("images").is_none());
        assert!(body["options"].as_object().unwrap().is_empty());
    }

    #[test]
    fn chat_request_renders_roles() {
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let opts = GenerateOptions::default();
        let body = to_value(&OllamaChatRequest {
            model: "m",
            messages: messages
                .iter()
                .map(|m| OllamaChatMessage { role: m.role.as_str(), content: &m.content })
                .collect(),
            stream: false,
            options: OllamaOptions::from_opts(&opts),
            format: json_format(&opts),
        });
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn images_attach_to_generate() {
        let opts = GenerateOptions {
            options: SamplerOptions { images: vec!["QUJD".into()], ..SamplerOptions::default() },
            ..GenerateOptions::default()
        };
        let body = to_value(&OllamaGenerateRequest {
            model: "llava",
            prompt: "describe",
            stream: false,
            options: OllamaOptions::from_opts(&opts),
            format: json_format(&opts),
            images: opts.options.images.clone(),
        });
        assert_eq!(body["images"][0], "QUJD");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let backend = OllamaBackend::new("http://localhost:11434/", 30, 1, 1, 100).unwrap();
        assert_eq!(backend.url("/api/tags"), "http://localhost:11434/api/tags");
    }
}
