use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    // Inference backend selection
    /// "ollama" or "openai-compat".
    pub inference_backend: String,
    pub ollama_url: String,
    pub ollama_timeout_s: u64,
    pub ollama_max_retries: u32,
    pub ollama_concurrent_requests: usize,
    pub localai_api_url: String,
    pub localai_api_key: String,
    pub localai_timeout_s: u64,
    pub localai_max_retries: u32,
    pub localai_concurrent_requests: usize,

    // Model selection
    pub text_model: String,
    pub text_model_thinking: bool,
    pub vision_model: String,
    pub embedding_model: String,
    pub categorization_model: String,
    pub categorization_model_thinking: bool,
    /// Secondary model used when the primary exhausts its retry budget.
    pub fallback_model: String,

    // GPU
    pub num_gpus_available: usize,

    // Storage
    pub project_root: PathBuf,
    pub data_processing_dir: String,
    pub media_cache_dir: String,
    pub kb_root: String,
    pub database_url: String,
    pub prompts_dir: Option<String>,
    /// Endpoint template for the external post fetcher; `{item_id}` is
    /// substituted.
    pub post_fetch_endpoint: String,

    // Event bus
    pub event_rate_per_second: u32,
    pub event_rate_per_minute: u32,
    pub event_batch_max: usize,
    pub event_batch_max_age_ms: u64,
    pub event_buffer_capacity: usize,

    // Worker pool
    pub worker_concurrency: usize,
    pub heartbeat_interval_s: u64,
    pub stale_task_threshold_s: i64,
    pub reconcile_interval_s: u64,

    // Content processing tuning
    pub categorization_max_retries: u32,
    pub generation_max_retries: u32,
    pub embedding_min_length: usize,
    pub item_name_max_length: usize,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let inference_backend =
            get_str("INFERENCE_BACKEND", &dotenv, "ollama").to_lowercase();
        match inference_backend.as_str() {
            "ollama" | "openai-compat" => {}
            other => {
                // Unknown names are a configuration error the factory also
                // guards against; reject early per fail-fast startup.
                anyhow::bail!("unknown INFERENCE_BACKEND '{other}' (expected 'ollama' or 'openai-compat')");
            }
        }

        let project_root = PathBuf::from(get_str("PROJECT_ROOT", &dotenv, "."));
        let data_processing_dir = get_str("DATA_PROCESSING_DIR", &dotenv, "data/processing");
        let default_db = format!("{data_processing_dir}/kbagent.db");

        Ok(Config {
            inference_backend,
            ollama_url: get_str("OLLAMA_URL", &dotenv, "http://localhost:11434"),
            ollama_timeout_s: get_u64("OLLAMA_TIMEOUT", &dotenv, 180),
            ollama_max_retries: get_u32("OLLAMA_MAX_RETRIES", &dotenv, 3),
            ollama_concurrent_requests: get_usize("OLLAMA_CONCURRENT_REQUESTS", &dotenv, 4),
            localai_api_url: get_str("LOCALAI_API_URL", &dotenv, "http://localhost:8080/v1"),
            localai_api_key: get_str("LOCALAI_API_KEY", &dotenv, ""),
            localai_timeout_s: get_u64("LOCALAI_TIMEOUT", &dotenv, 180),
            localai_max_retries: get_u32("LOCALAI_MAX_RETRIES", &dotenv, 3),
            localai_concurrent_requests: get_usize("LOCALAI_CONCURRENT_REQUESTS", &dotenv, 4),

            text_model: get_str("TEXT_MODEL", &dotenv, "llama3.1"),
            text_model_thinking: get_bool("TEXT_MODEL_THINKING", &dotenv, false),
            vision_model: get_str("VISION_MODEL", &dotenv, "llava"),
            embedding_model: get_str("EMBEDDING_MODEL", &dotenv, "nomic-embed-text"),
            categorization_model: {
                let text_model = get_str("TEXT_MODEL", &dotenv, "llama3.1");
                get_str("CATEGORIZATION_MODEL", &dotenv, &text_model)
            },
            categorization_model_thinking: get_bool("CATEGORIZATION_MODEL_THINKING", &dotenv, false),
            fallback_model: get_str("FALLBACK_MODEL", &dotenv, ""),

            num_gpus_available: get_usize("NUM_GPUS_AVAILABLE", &dotenv, 1).max(1),

            project_root,
            data_processing_dir,
            media_cache_dir: get_str("MEDIA_CACHE_DIR", &dotenv, "data/media_cache"),
            kb_root: get_str("KB_ROOT", &dotenv, "kb-generated"),
            database_url: get_str("DATABASE_URL", &dotenv, &default_db),
            prompts_dir: get("PROMPTS_DIR", &dotenv).filter(|s| !s.is_empty()),
            post_fetch_endpoint: get_str(
                "POST_FETCH_ENDPOINT",
                &dotenv,
                "http://localhost:8081/posts/{item_id}",
            ),

            event_rate_per_second: get_u32("EVENT_RATE_PER_SECOND", &dotenv, 100),
            event_rate_per_minute: get_u32("EVENT_RATE_PER_MINUTE", &dotenv, 2000),
            event_batch_max: get_usize("EVENT_BATCH_MAX", &dotenv, 25),
            event_batch_max_age_ms: get_u64("EVENT_BATCH_MAX_AGE_MS", &dotenv, 250),
            event_buffer_capacity: get_usize("EVENT_BUFFER_CAPACITY", &dotenv, 1000),

            worker_concurrency: get_usize("WORKER_CONCURRENCY", &dotenv, 2).max(1),
            heartbeat_interval_s: get_u64("HEARTBEAT_INTERVAL_S", &dotenv, 30),
            stale_task_threshold_s: get_i64("STALE_TASK_THRESHOLD_S", &dotenv, 7200),
            reconcile_interval_s: get_u64("RECONCILE_INTERVAL_S", &dotenv, 300),

            categorization_max_retries: get_u32("CATEGORIZATION_MAX_RETRIES", &dotenv, 3),
            generation_max_retries: get_u32("GENERATION_MAX_RETRIES", &dotenv, 3),
            embedding_min_length: get_usize("EMBEDDING_MIN_LENGTH", &dotenv, 100),
            item_name_max_length: get_usize("ITEM_NAME_MAX_LENGTH", &dotenv, 30),
        })
    }

    /// Absolute path of a project-root-relative path stored on an item.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.project_root.join(relative)
    }
}

impl Default for Config {
    /// Defaults as if no environment were set, with backend-independent
    /// values suitable for tests.
    fn default() -> Self {
        Config {
            inference_backend: "ollama".into(),
            ollama_url: "http://localhost:11434".into(),
            ollama_timeout_s: 180,
            ollama_max_retries: 3,
            ollama_concurrent_requests: 4,
            localai_api_url: "http://localhost:8080/v1".into(),
            localai_api_key: String::new(),
            localai_timeout_s: 180,
            localai_max_retries: 3,
            localai_concurrent_requests: 4,
            text_model: "llama3.1".into(),
            text_model_thinking: false,
            vision_model: "llava".into(),
            embedding_model: "nomic-embed-text".into(),
            categorization_model: "llama3.1".into(),
            categorization_model_thinking: false,
            fallback_model: String::new(),
            num_gpus_available: 1,
            project_root: PathBuf::from("."),
            data_processing_dir: "data/processing".into(),
            media_cache_dir: "data/media_cache".into(),
            kb_root: "kb-generated".into(),
            database_url: "data/processing/kbagent.db".into(),
            prompts_dir: None,
            post_fetch_endpoint: "http://localhost:8081/posts/{item_id}".into(),
            event_rate_per_second: 100,
            event_rate_per_minute: 2000,
            event_batch_max: 25,
            event_batch_max_age_ms: 250,
            event_buffer_capacity: 1000,
            worker_concurrency: 2,
            heartbeat_interval_s: 30,
            stale_task_threshold_s: 7200,
            reconcile_interval_s: 300,
            categorization_max_retries: 3,
            generation_max_retries: 3,
            embedding_min_length: 100,
            item_name_max_length: 30,
        }
    }
}
