//! Pipeline orchestrator.
//!
//! Runs the fixed phase sequence cache → media → categorize → generate →
//! db-sync over a batch of items. The validator runs first and persists its
//! repairs; after the last phase each error-free item with all five flags
//! set is marked processed. Cancellation propagates through a shared token
//! checked at every item boundary.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::InferenceBackend;
use crate::categories::CategoryStore;
use crate::config::Config;
use crate::db::Db;
use crate::events::{AgentEvent, EventBus, LogLevel};
use crate::fetch::SourceFetcher;
use crate::phases::{self, PhaseOutcome};
use crate::prompts::PromptRenderer;
use crate::stats::PhaseTimings;
use crate::types::{Item, PhaseId, PhaseStatus, Preferences, RunOutcome, RunReport};
use crate::validator;

/// Everything a pipeline run needs, minus the per-run cancellation token.
/// The pipeline receives store and emitter handles; it knows nothing about
/// the task registry above it.
#[derive(Clone)]
pub struct PipelineDeps {
    pub db: Arc<Db>,
    pub events: Arc<EventBus>,
    pub backend: Arc<dyn InferenceBackend>,
    pub renderer: Arc<PromptRenderer>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub categories: Arc<dyn CategoryStore>,
    pub config: Arc<Config>,
}

impl PipelineDeps {
    pub fn context(&self, cancel: CancellationToken, task_id: Option<String>) -> PipelineContext {
        PipelineContext {
            db: Arc::clone(&self.db),
            events: Arc::clone(&self.events),
            backend: Arc::clone(&self.backend),
            renderer: Arc::clone(&self.renderer),
            fetcher: Arc::clone(&self.fetcher),
            categories: Arc::clone(&self.categories),
            config: Arc::clone(&self.config),
            timings: PhaseTimings::new(Arc::clone(&self.db)),
            cancel,
            task_id,
        }
    }
}

pub struct PipelineContext {
    pub db: Arc<Db>,
    pub events: Arc<EventBus>,
    pub backend: Arc<dyn InferenceBackend>,
    pub renderer: Arc<PromptRenderer>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub categories: Arc<dyn CategoryStore>,
    pub config: Arc<Config>,
    pub timings: PhaseTimings,
    pub cancel: CancellationToken,
    /// Set when a task owns this run; phase transitions update the task row.
    pub task_id: Option<String>,
}

pub struct Pipeline {
    ctx: PipelineContext,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Run the full phase sequence over `item_ids`.
    pub async fn run(&self, item_ids: &[String], prefs: &Preferences) -> Result<RunReport> {
        let ctx = &self.ctx;
        info!("pipeline run starting: {} item(s)", item_ids.len());

        // Load the batch, creating skeleton rows for ids we have never seen,
        // and clear last run's error annotations.
        let mut items: Vec<Item> = Vec::with_capacity(item_ids.len());
        for item_id in item_ids {
            match ctx.db.get_item(item_id)? {
                Some(mut existing) => {
                    // Error annotations are per-run; stale ones are cleared
                    // before anything else happens.
                    if !existing.phase_errors.is_empty() {
                        existing.phase_errors.clear();
                        ctx.db.upsert_item(&existing)?;
                    }
                    items.push(existing);
                }
                None => {
                    let item = Item::new(item_id.clone(), String::new());
                    ctx.db.upsert_item(&item)?;
                    items.push(item);
                }
            }
        }

        // Pre-run consistency validation; repairs persist before any phase.
        let validation = validator::validate_batch(&ctx.db, &ctx.events, &ctx.config, &mut items)?;
        let warnings = validation.repairs + validation.collisions.len() as u64;
        if warnings > 0 {
            info!(
                "validator: {} repair(s), {} collision(s)",
                validation.repairs,
                validation.collisions.len()
            );
        }

        // LLM-only reprocessing skips cache and media wholesale when every
        // item already holds their results.
        let llm_only = prefs.force_regenerate_articles
            && !prefs.force_recache
            && !prefs.force_reprocess_media
            && items.iter().all(|i| i.cache_complete && i.media_processed);

        let mut interrupted = false;
        for (phase_index, phase) in PhaseId::ALL.into_iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            if llm_only && matches!(phase, PhaseId::Cache | PhaseId::Media) {
                phases::Reporter::new(ctx, phase)
                    .skipped("skipped: LLM-only reprocessing requested");
                continue;
            }

            self.update_task_phase(phase, phase_index, items.len());

            let outcome: PhaseOutcome = match phase {
                PhaseId::Cache => phases::cache::run(ctx, &mut items, prefs).await?,
                PhaseId::Media => phases::media::run(ctx, &mut items, prefs).await?,
                PhaseId::Categorize => phases::categorize::run(ctx, &mut items, prefs).await?,
                PhaseId::Generate => phases::generate::run(ctx, &mut items, prefs).await?,
                PhaseId::DbSync => phases::db_sync::run(ctx, &mut items, prefs).await?,
            };
            if outcome.interrupted {
                interrupted = true;
                break;
            }
        }

        if interrupted {
            warn!("pipeline run interrupted by cancellation");
            ctx.events.emit(AgentEvent::PhaseUpdate {
                phase_id: "pipeline".to_string(),
                status: PhaseStatus::Interrupted,
                message: Some("run canceled".to_string()),
                processed_count: None,
                total_count: None,
                error_count: None,
                estimated_seconds_remaining: None,
                is_sub_step: false,
            });
        }

        // Finalize: items with no errors this run and all five flags true
        // are marked processed; everything else will retry next run.
        let mut completed = 0u64;
        let mut errored = 0u64;
        for item in &items {
            if !item.phase_errors.is_empty() {
                errored += 1;
                continue;
            }
            if item.all_flags_set() {
                if !item.processed {
                    ctx.db.mark_item_processed(&item.item_id)?;
                }
                completed += 1;
            }
        }

        let total = items.len() as u64;
        ctx.events.emit(AgentEvent::progress(completed, total.max(1)));

        let outcome = if interrupted {
            RunOutcome::Interrupted
        } else if errored > 0 {
            RunOutcome::CompletedWithErrors
        } else if warnings > 0 {
            RunOutcome::CompletedWithWarnings
        } else {
            RunOutcome::Completed
        };
        let report = RunReport {
            outcome,
            total_items: total,
            items_completed: completed,
            items_errored: errored,
            warnings,
        };
        info!(
            "pipeline run finished: {:?}, {completed}/{total} item(s) completed, {errored} errored",
            outcome
        );
        if errored > 0 {
            ctx.events.log(
                LogLevel::Warning,
                format!("pipeline finished with {errored} errored item(s)"),
            );
        }
        Ok(report)
    }

    fn update_task_phase(&self, phase: PhaseId, phase_index: usize, batch_size: usize) {
        let Some(task_id) = &self.ctx.task_id else {
            return;
        };
        let percent = (phase_index as i64 * 100) / PhaseId::ALL.len() as i64;
        if let Err(e) = self.ctx.db.update_task_progress(
            task_id,
            Some(phase.as_str()),
            &format!("{phase}: processing {batch_size} item(s)"),
            percent,
        ) {
            warn!("update_task_progress {task_id}: {e}");
        }
    }
}
