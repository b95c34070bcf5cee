//! Shared fixtures: a scripted inference backend, an in-memory source
//! fetcher, and a fully-wired pipeline environment over a temp directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use kbagent_core::backend::{
    BackendHealth, BackendResult, ChatMessage, EmbedOptions, GenerateOptions, HealthStatus,
    InferenceBackend, ModelInfo,
};
use kbagent_core::categories::DbCategoryStore;
use kbagent_core::config::Config;
use kbagent_core::db::Db;
use kbagent_core::events::{EventBus, EventBusConfig};
use kbagent_core::fetch::{FetchedMedia, FetchedPost, FetchedSegment, SourceFetcher};
use kbagent_core::pipeline::PipelineDeps;
use kbagent_core::prompts::PromptRenderer;

pub const CATEGORIZER_MODEL: &str = "categorizer";
pub const VISION_MODEL: &str = "vision";
pub const TEXT_MODEL: &str = "writer";

pub type Responder = dyn Fn(&str, &str) -> BackendResult<String> + Send + Sync;

/// Backend whose responses come from a test-supplied closure keyed on
/// (model, prompt). Counts calls per operation.
pub struct MockBackend {
    responder: Box<Responder>,
    pub generate_calls: AtomicU64,
    pub chat_calls: AtomicU64,
    pub vision_calls: AtomicU64,
}

impl MockBackend {
    pub fn new(
        responder: impl Fn(&str, &str) -> BackendResult<String> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            generate_calls: AtomicU64::new(0),
            chat_calls: AtomicU64::new(0),
            vision_calls: AtomicU64::new(0),
        })
    }

    pub fn total_llm_calls(&self) -> u64 {
        self.generate_calls.load(Ordering::SeqCst) + self.chat_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        _opts: &GenerateOptions,
    ) -> BackendResult<String> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if model == VISION_MODEL {
            self.vision_calls.fetch_add(1, Ordering::SeqCst);
        }
        (self.responder)(model, prompt)
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _opts: &GenerateOptions,
    ) -> BackendResult<String> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        let joined: String =
            messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
        (self.responder)(model, &joined)
    }

    async fn embed(&self, _model: &str, _text: &str, _opts: &EmbedOptions) -> BackendResult<Vec<f32>> {
        Ok(vec![0.1; 128])
    }

    async fn list_models(&self) -> BackendResult<Vec<ModelInfo>> {
        Ok(vec![])
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth {
            status: HealthStatus::Healthy,
            configured_url: "mock://".to_string(),
            available_model_count: 0,
            last_error: None,
        }
    }
}

/// In-memory fetcher: posts registered per item id; downloads write stub
/// bytes and are counted.
pub struct MockFetcher {
    posts: Mutex<HashMap<String, FetchedPost>>,
    pub fetch_calls: AtomicU64,
    pub download_calls: AtomicU64,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            posts: Mutex::new(HashMap::new()),
            fetch_calls: AtomicU64::new(0),
            download_calls: AtomicU64::new(0),
        })
    }

    pub fn put_post(&self, item_id: &str, post: FetchedPost) {
        if let Ok(mut posts) = self.posts.lock() {
            posts.insert(item_id.to_string(), post);
        }
    }

    pub fn put_text_post(&self, item_id: &str, text: &str) {
        self.put_post(item_id, text_post(text));
    }
}

#[async_trait]
impl SourceFetcher for MockFetcher {
    async fn fetch_post(&self, item_id: &str, _source_url: &str) -> Result<FetchedPost> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let posts = self.posts.lock().unwrap_or_else(|e| e.into_inner());
        posts
            .get(item_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no post registered for {item_id}"))
    }

    async fn download(&self, _url: &str, dest: &Path) -> Result<()> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, b"media-bytes")?;
        Ok(())
    }
}

pub fn text_post(text: &str) -> FetchedPost {
    FetchedPost {
        is_thread: false,
        segments: vec![FetchedSegment { text: text.to_string(), media: vec![], urls: vec![] }],
    }
}

pub fn post_with_image(text: &str, image_url: &str) -> FetchedPost {
    FetchedPost {
        is_thread: false,
        segments: vec![FetchedSegment {
            text: text.to_string(),
            media: vec![FetchedMedia { url: image_url.to_string(), mime_type: "image/jpeg".into() }],
            urls: vec![],
        }],
    }
}

pub fn post_with_video(text: &str, video_url: &str) -> FetchedPost {
    FetchedPost {
        is_thread: false,
        segments: vec![FetchedSegment {
            text: text.to_string(),
            media: vec![FetchedMedia { url: video_url.to_string(), mime_type: "video/mp4".into() }],
            urls: vec![],
        }],
    }
}

/// A categorization reply the mock responder can hand back.
pub fn category_json(main: &str, sub: &str, name: &str) -> String {
    format!(r#"{{"main_category": "{main}", "sub_category": "{sub}", "item_name": "{name}"}}"#)
}

pub fn article_json(title: &str) -> String {
    format!(
        r#"{{
            "suggested_title": "{title}",
            "introduction": "Why this matters.",
            "sections": [
                {{"heading": "Details", "content_paragraphs": ["The core idea."]}}
            ],
            "key_takeaways": ["Remember this."],
            "conclusion": "Done."
        }}"#
    )
}

// ── Environment ──────────────────────────────────────────────────────────

pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub db: Arc<Db>,
    pub events: Arc<EventBus>,
    pub config: Arc<Config>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.project_root = dir.path().to_path_buf();
        config.categorization_model = CATEGORIZER_MODEL.to_string();
        config.vision_model = VISION_MODEL.to_string();
        config.text_model = TEXT_MODEL.to_string();
        config.database_url = dir.path().join("kbagent.db").to_string_lossy().to_string();
        config.num_gpus_available = 2;
        config.heartbeat_interval_s = 1;
        config.reconcile_interval_s = 3600;

        let db = Arc::new(Db::open(&config.database_url).expect("open db"));
        db.migrate().expect("migrate");
        let events = EventBus::new(EventBusConfig {
            rate_per_second: 100_000,
            rate_per_minute: 1_000_000,
            batch_max: 8,
            batch_max_age: std::time::Duration::from_millis(10),
            ..EventBusConfig::default()
        });

        Self { dir, db, events, config: Arc::new(config) }
    }

    pub fn deps(
        &self,
        backend: Arc<MockBackend>,
        fetcher: Arc<MockFetcher>,
    ) -> PipelineDeps {
        PipelineDeps {
            db: Arc::clone(&self.db),
            events: Arc::clone(&self.events),
            backend,
            renderer: Arc::new(PromptRenderer::new(None)),
            fetcher,
            categories: Arc::new(DbCategoryStore::new(Arc::clone(&self.db))),
            config: Arc::clone(&self.config),
        }
    }

    pub fn kb_readme(&self, relative_dir: &str) -> std::path::PathBuf {
        self.dir.path().join(relative_dir).join("README.md")
    }
}
