//! Media phase: describe cached images through the vision model.
//!
//! Videos are intentionally skipped; their description stays null and does
//! not block `media_processed`.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use base64::Engine;
use tracing::{info, warn};

use crate::backend::{GenerateOptions, SamplerOptions};
use crate::events::LogLevel;
use crate::pipeline::PipelineContext;
use crate::prompts::{ModelType, PROMPT_IMAGE_DESCRIPTION};
use crate::types::{Item, PhaseId, Preferences};

use super::{prologue, PhaseOutcome};

pub async fn run(
    ctx: &PipelineContext,
    items: &mut [Item],
    prefs: &Preferences,
) -> Result<PhaseOutcome> {
    let phase = PhaseId::Media;
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
        match describe_media(ctx, item).await {
            Ok(described) => {
                item.media_processed = true;
                processed += 1;
                if described > 0 {
                    info!("described {described} media file(s) for item {}", item.item_id);
                }
            }
            Err(e) => {
                item.media_processed = false;
                item.set_phase_error(phase, e.to_string());
                errors += 1;
                warn!("media analysis failed for item {}: {e:#}", item.item_id);
                ctx.events
                    .log(LogLevel::Error, format!("media analysis failed for item {}: {e:#}", item.item_id));
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

/// Describe every non-video media file of one item that lacks a
/// description. Returns how many descriptions were produced.
async fn describe_media(ctx: &PipelineContext, item: &mut Item) -> Result<u64> {
    let prompt = ctx
        .renderer
        .render(PROMPT_IMAGE_DESCRIPTION, ModelType::Standard, &BTreeMap::new(), None)?
        .into_text();

    let mut described = 0u64;
    for media in item.media.iter_mut() {
        if !media.needs_description() {
            continue;
        }
        let Some(relative) = media.local_cache_path.as_deref() else {
            continue;
        };
        let path = ctx.config.resolve(relative);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read cached media {}", path.display()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);

        let opts = GenerateOptions {
            options: SamplerOptions { images: vec![encoded], ..SamplerOptions::default() },
            ..GenerateOptions::default()
        };
        let description = ctx.backend.generate(&ctx.config.vision_model, &prompt, &opts).await?;
        let description = description.trim();
        if description.is_empty() {
            bail!("vision model returned an empty description for {}", media.source_url);
        }
        media.description = Some(description.to_string());
        described += 1;
    }
    Ok(described)
}
