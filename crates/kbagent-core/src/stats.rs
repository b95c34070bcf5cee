//! Historical per-phase timing, used to estimate time-to-completion.

use std::sync::Arc;

use tracing::warn;

use crate::db::Db;
use crate::types::PhaseId;

#[derive(Clone)]
pub struct PhaseTimings {
    db: Arc<Db>,
}

impl PhaseTimings {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Record a finished phase run. Runs that did no work are not recorded,
    /// so skipped batches never skew the average.
    pub fn record(&self, phase: PhaseId, items_this_run: u64, duration_secs: f64) {
        if items_this_run == 0 {
            return;
        }
        if let Err(e) = self.db.record_phase_stats(phase.as_str(), items_this_run as i64, duration_secs)
        {
            warn!("record_phase_stats {phase}: {e}");
        }
    }

    /// Rolling average seconds per item, if this phase has ever done work.
    pub fn avg_seconds_per_item(&self, phase: PhaseId) -> Option<f64> {
        self.db
            .get_phase_stats(phase.as_str())
            .ok()
            .flatten()
            .and_then(|s| s.avg_seconds_per_item())
    }

    /// ETC for `remaining` items of a phase.
    pub fn estimate_remaining(&self, phase: PhaseId, remaining: u64) -> Option<f64> {
        self.avg_seconds_per_item(phase).map(|avg| avg * remaining as f64)
    }
}
