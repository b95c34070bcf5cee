//! Db-sync phase: upsert generated articles into the downstream kb_items
//! table.

use std::time::Instant;

use anyhow::Result;
use tracing::{info, warn};

use crate::events::LogLevel;
use crate::pipeline::PipelineContext;
use crate::types::{Item, KbItemRow, PhaseId, Preferences};

use super::{prologue, PhaseOutcome};

pub async fn run(
    ctx: &PipelineContext,
    items: &mut [Item],
    prefs: &Preferences,
) -> Result<PhaseOutcome> {
    let phase = PhaseId::DbSync;
    let (reporter, plan, done) = prologue(ctx, items, phase, prefs);
    if let Some(outcome) = done {
        return Ok(outcome);
    }

    let total = plan.needs_work.len() as u64;
    let started = Instant::now();
    let mut processed = 0u64;
    let mut errors = 0u64;
    let mut interrupted = false;

    for idx in &plan.needs_work {
        if ctx.cancel.is_cancelled() {
            interrupted = true;
            break;
        }
        let item = &mut items[*idx];
        match sync_one(ctx, item) {
            Ok(()) => {
                item.db_synced = true;
                processed += 1;
                info!("synced kb row for item {}", item.item_id);
            }
            Err(e) => {
                item.db_synced = false;
                item.set_phase_error(phase, e.to_string());
                errors += 1;
                warn!("db-sync failed for item {}: {e:#}", item.item_id);
                ctx.events
                    .log(LogLevel::Error, format!("db-sync failed for item {}: {e:#}", item.item_id));
            }
        }
        ctx.db.upsert_item(item)?;
        reporter.in_progress(processed + errors, total, errors);
    }

    if interrupted {
        reporter.interrupted(processed + errors, total);
    } else {
        reporter.completed(processed + errors, total, errors, None);
    }
    ctx.timings.record(phase, processed, started.elapsed().as_secs_f64());

    Ok(PhaseOutcome {
        eligible: plan.eligible.len() as u64,
        skipped: plan.already_done(),
        processed,
        errors,
        interrupted,
    })
}

fn sync_one(ctx: &PipelineContext, item: &Item) -> Result<()> {
    let (Some(main), Some(sub), Some(name)) =
        (item.main_category.clone(), item.sub_category.clone(), item.item_name.clone())
    else {
        anyhow::bail!("classification fields missing");
    };
    let Some(kb_dir_path) = item.kb_dir_path.clone() else {
        anyhow::bail!("kb_dir_path missing");
    };
    let Some(content) = item.article_markdown.clone() else {
        anyhow::bail!("article markdown missing");
    };

    ctx.db.upsert_kb_item(&KbItemRow {
        item_id: item.item_id.clone(),
        content,
        main_category: main,
        sub_category: sub,
        item_name: name,
        source_url: item.source_url.clone(),
        kb_dir_path,
        kb_media_paths: item.kb_media_paths.clone(),
        created_at_source: Some(item.created_at),
        created_at: item.created_at,
        updated_at: chrono::Utc::now(),
    })
}
