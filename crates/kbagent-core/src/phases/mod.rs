//! Phase executors.
//!
//! All five executors share the same shape: compute eligibility, partition
//! into needs-work vs already-done, announce the plan, execute with
//! periodic progress events, record timing stats, and honor cooperative
//! cancellation at item boundaries.

pub mod cache;
pub mod categorize;
pub mod db_sync;
pub mod generate;
pub mod media;

use crate::pipeline::PipelineContext;
use crate::types::{Item, PhaseId, PhaseStatus, Preferences};

// ── Planning ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct PhasePlan {
    /// Indexes into the batch whose prerequisites hold and that carry no
    /// error from an earlier phase this run.
    pub eligible: Vec<usize>,
    /// Eligible subset that is forced by preferences or not yet done.
    pub needs_work: Vec<usize>,
}

impl PhasePlan {
    pub fn already_done(&self) -> u64 {
        (self.eligible.len() - self.needs_work.len()) as u64
    }
}

fn prerequisites_met(item: &Item, phase: PhaseId) -> bool {
    match phase {
        PhaseId::Cache => true,
        PhaseId::Media => item.cache_complete,
        PhaseId::Categorize => item.cache_complete && item.media_processed,
        PhaseId::Generate => item.categories_processed,
        PhaseId::DbSync => item.article_created,
    }
}

fn flag_done(item: &Item, phase: PhaseId) -> bool {
    match phase {
        PhaseId::Cache => item.cache_complete,
        PhaseId::Media => item.media_processed,
        PhaseId::Categorize => item.categories_processed,
        PhaseId::Generate => item.article_created,
        PhaseId::DbSync => item.db_synced,
    }
}

pub(crate) fn plan(items: &[Item], phase: PhaseId, prefs: &Preferences) -> PhasePlan {
    let mut plan = PhasePlan::default();
    let force = prefs.force_flag(phase);
    for (idx, item) in items.iter().enumerate() {
        if !prerequisites_met(item, phase) || item.has_prior_error(phase) {
            continue;
        }
        // An error recorded for this phase itself (e.g. a validator-detected
        // collision) also excludes the item from work.
        if item.phase_error(phase).is_some() {
            continue;
        }
        plan.eligible.push(idx);
        if force || !flag_done(item, phase) {
            plan.needs_work.push(idx);
        }
    }
    plan
}

// ── Outcome ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseOutcome {
    pub eligible: u64,
    pub skipped: u64,
    pub processed: u64,
    pub errors: u64,
    pub interrupted: bool,
}

/// Failure modes of one item's work inside a concurrent executor.
pub(crate) enum WorkError {
    /// Cancellation observed before the item started; not an item failure.
    Canceled,
    Failed(String),
}

// ── Event reporting ──────────────────────────────────────────────────────

pub(crate) struct Reporter<'a> {
    ctx: &'a PipelineContext,
    phase: PhaseId,
}

impl<'a> Reporter<'a> {
    pub fn new(ctx: &'a PipelineContext, phase: PhaseId) -> Self {
        Self { ctx, phase }
    }

    fn emit(
        &self,
        status: PhaseStatus,
        message: Option<String>,
        processed: Option<u64>,
        total: Option<u64>,
        errors: Option<u64>,
        etc: Option<f64>,
    ) {
        self.ctx.events.emit(crate::events::AgentEvent::PhaseUpdate {
            phase_id: self.phase.as_str().to_string(),
            status,
            message,
            processed_count: processed,
            total_count: total,
            error_count: errors,
            estimated_seconds_remaining: etc,
            is_sub_step: false,
        });
    }

    /// The validation/plan event subscribers see before any work starts.
    pub fn pending(&self, already_done: u64, eligible: u64) {
        self.emit(PhaseStatus::Pending, None, Some(already_done), Some(eligible), None, None);
    }

    pub fn active(&self, total: u64) {
        let etc = self.ctx.timings.estimate_remaining(self.phase, total);
        self.emit(PhaseStatus::Active, None, Some(0), Some(total), None, etc);
    }

    pub fn in_progress(&self, processed: u64, total: u64, errors: u64) {
        let remaining = total.saturating_sub(processed);
        let etc = self.ctx.timings.estimate_remaining(self.phase, remaining);
        self.emit(PhaseStatus::InProgress, None, Some(processed), Some(total), Some(errors), etc);
    }

    pub fn completed(&self, processed: u64, total: u64, errors: u64, message: Option<String>) {
        self.emit(PhaseStatus::Completed, message, Some(processed), Some(total), Some(errors), None);
    }

    pub fn interrupted(&self, processed: u64, total: u64) {
        self.emit(PhaseStatus::Interrupted, None, Some(processed), Some(total), None, None);
    }

    pub fn skipped(&self, message: impl Into<String>) {
        self.emit(PhaseStatus::Skipped, Some(message.into()), None, None, None, None);
    }
}

/// Run the shared prologue: plan, announce, and short-circuit when there is
/// nothing to do. Returns None when the phase is already complete.
pub(crate) fn prologue<'a>(
    ctx: &'a PipelineContext,
    items: &[Item],
    phase: PhaseId,
    prefs: &Preferences,
) -> (Reporter<'a>, PhasePlan, Option<PhaseOutcome>) {
    let reporter = Reporter::new(ctx, phase);
    let plan = plan(items, phase, prefs);
    let eligible = plan.eligible.len() as u64;
    let skipped = plan.already_done();
    reporter.pending(skipped, eligible);

    if plan.needs_work.is_empty() {
        reporter.completed(0, 0, 0, Some(format!("{skipped} item(s) already done, skipped")));
        let outcome =
            PhaseOutcome { eligible, skipped, processed: 0, errors: 0, interrupted: false };
        return (reporter, plan, Some(outcome));
    }

    reporter.active(plan.needs_work.len() as u64);
    (reporter, plan, None)
}
