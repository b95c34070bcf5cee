use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Pipeline phases ──────────────────────────────────────────────────────

/// The five fixed pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseId {
    Cache,
    Media,
    Categorize,
    Generate,
    DbSync,
}

impl PhaseId {
    pub const ALL: [PhaseId; 5] = [
        PhaseId::Cache,
        PhaseId::Media,
        PhaseId::Categorize,
        PhaseId::Generate,
        PhaseId::DbSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::Cache => "cache",
            PhaseId::Media => "media",
            PhaseId::Categorize => "categorize",
            PhaseId::Generate => "generate",
            PhaseId::DbSync => "db_sync",
        }
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status carried on a phase_update event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Active,
    InProgress,
    Completed,
    Skipped,
    Interrupted,
    Error,
}

// ── Items ────────────────────────────────────────────────────────────────

/// One media attachment of an item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaItem {
    pub source_url: String,
    /// Path relative to the project root; None until downloaded.
    #[serde(default)]
    pub local_cache_path: Option<String>,
    #[serde(default)]
    pub mime_type: String,
    /// Vision-model description; None until analyzed. Stays None for videos.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_video: bool,
}

impl MediaItem {
    /// A non-video media item that has been cached but not yet described.
    pub fn needs_description(&self) -> bool {
        !self.is_video && self.local_cache_path.is_some() && self.description.is_none()
    }
}

/// One post of a thread. A non-thread item has exactly one segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub urls: Vec<String>,
}

/// One ingested post or thread plus everything derived from it,
/// as stored in the `items` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub source_url: String,
    pub is_thread: bool,
    pub segments: Vec<Segment>,
    /// Concatenation of all segment texts.
    pub full_text: String,
    pub media: Vec<MediaItem>,
    /// Expanded external URLs referenced by the post.
    pub urls: Vec<String>,

    // Classification (set by the categorize phase)
    pub main_category: Option<String>,
    pub sub_category: Option<String>,
    pub item_name: Option<String>,

    // Article (set by the generate phase)
    pub article_title: Option<String>,
    pub article_markdown: Option<String>,
    pub article_raw_json: Option<String>,
    /// Directory under kb_root holding README.md + media/, relative to project root.
    pub kb_dir_path: Option<String>,
    /// Media file paths relative to kb_dir_path.
    pub kb_media_paths: Vec<String>,

    // Phase flags — each reflects on-disk / in-DB truth.
    pub cache_complete: bool,
    pub media_processed: bool,
    pub categories_processed: bool,
    pub article_created: bool,
    pub db_synced: bool,
    /// All five flags true with no errors in the finalizing run.
    pub processed: bool,

    /// Per-run error annotations keyed by phase name. Cleared at run start.
    pub phase_errors: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn new(item_id: impl Into<String>, source_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            item_id: item_id.into(),
            source_url: source_url.into(),
            is_thread: false,
            segments: Vec::new(),
            full_text: String::new(),
            media: Vec::new(),
            urls: Vec::new(),
            main_category: None,
            sub_category: None,
            item_name: None,
            article_title: None,
            article_markdown: None,
            article_raw_json: None,
            kb_dir_path: None,
            kb_media_paths: Vec::new(),
            cache_complete: false,
            media_processed: false,
            categories_processed: false,
            article_created: false,
            db_synced: false,
            processed: false,
            phase_errors: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_phase_error(&mut self, phase: PhaseId, message: impl Into<String>) {
        self.phase_errors.insert(phase.as_str().to_string(), message.into());
    }

    pub fn phase_error(&self, phase: PhaseId) -> Option<&str> {
        self.phase_errors.get(phase.as_str()).map(String::as_str)
    }

    /// True if any phase preceding `phase` recorded an error this run.
    pub fn has_prior_error(&self, phase: PhaseId) -> bool {
        PhaseId::ALL
            .iter()
            .take_while(|p| **p != phase)
            .any(|p| self.phase_errors.contains_key(p.as_str()))
    }

    pub fn all_flags_set(&self) -> bool {
        self.cache_complete
            && self.media_processed
            && self.categories_processed
            && self.article_created
            && self.db_synced
    }
}

// ── Tasks ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            "canceled" => Some(TaskStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A long-running task as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Task type name; routed to the handler registered for this kind.
    pub kind: String,
    pub status: TaskStatus,
    pub preferences: Preferences,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub current_phase: Option<String>,
    pub current_phase_message: String,
    pub progress_percent: i64,
    pub error_message: String,
    pub result_summary: Option<serde_json::Value>,
}

/// Options submitted with a task. Unknown keys are a submission error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Preferences {
    pub skip_fetch_bookmarks: bool,
    pub skip_process_content: bool,
    pub skip_synthesis_generation: bool,
    pub skip_embedding_generation: bool,
    pub skip_readme_generation: bool,
    pub skip_git_push: bool,
    pub force_recache: bool,
    pub force_reprocess_media: bool,
    pub force_reprocess_llm: bool,
    pub force_regenerate_articles: bool,
    pub force_regenerate_db_sync: bool,
}

impl Preferences {
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn force_flag(&self, phase: PhaseId) -> bool {
        match phase {
            PhaseId::Cache => self.force_recache,
            PhaseId::Media => self.force_reprocess_media,
            PhaseId::Categorize => self.force_reprocess_llm,
            PhaseId::Generate => self.force_regenerate_articles,
            PhaseId::DbSync => self.force_regenerate_db_sync,
        }
    }
}

// ── Agent singleton ──────────────────────────────────────────────────────

/// The single row reflecting "is an agent currently running".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub is_running: bool,
    pub current_task_id: Option<String>,
    pub current_phase_message: String,
    pub last_update: DateTime<Utc>,
}

// ── Phase timing ─────────────────────────────────────────────────────────

/// Rolling per-phase timing record used to compute ETCs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseStats {
    pub phase_id: String,
    pub items_processed_total: i64,
    pub duration_seconds_total: f64,
}

impl PhaseStats {
    pub fn avg_seconds_per_item(&self) -> Option<f64> {
        if self.items_processed_total > 0 {
            Some(self.duration_seconds_total / self.items_processed_total as f64)
        } else {
            None
        }
    }
}

// ── Downstream KB row ────────────────────────────────────────────────────

/// Row written into the kb_items table by the db-sync phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbItemRow {
    pub item_id: String,
    pub content: String,
    pub main_category: String,
    pub sub_category: String,
    pub item_name: String,
    pub source_url: String,
    pub kb_dir_path: String,
    pub kb_media_paths: Vec<String>,
    pub created_at_source: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Run summary ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    CompletedWithErrors,
    CompletedWithWarnings,
    Interrupted,
}

/// Result summary recorded on the task after a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub total_items: u64,
    pub items_completed: u64,
    pub items_errored: u64,
    /// Validator repairs performed before the run.
    pub warnings: u64,
}
