//! Cache phase: fetch source data and download media into the media cache.

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::events::LogLevel;
use crate::pipeline::PipelineContext;
use crate::types::{Item, MediaItem, PhaseId, Preferences, Segment};

use super::{prologue, PhaseOutcome};

pub async fn run(
    ctx: &PipelineContext,
    items: &mut [Item],
    prefs: &Preferences,
) -> Result<PhaseOutcome> {
    let phase = PhaseId::Cache;
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
        match cache_one(ctx, item).await {
            Ok(()) => {
                item.cache_complete = true;
                processed += 1;
                info!(
                    "cached item {}: {} segment(s), {} media file(s)",
                    item.item_id,
                    item.segments.len(),
                    item.media.len()
                );
            }
            Err(e) => {
                item.cache_complete = false;
                item.set_phase_error(phase, e.to_string());
                errors += 1;
                warn!("cache failed for item {}: {e:#}", item.item_id);
                ctx.events.log(LogLevel::Error, format!("cache failed for item {}: {e:#}", item.item_id));
            }
        }
        // The entire item's cache write is row-atomic.
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

async fn cache_one(ctx: &PipelineContext, item: &mut Item) -> Result<()> {
    let post = ctx
        .fetcher
        .fetch_post(&item.item_id, &item.source_url)
        .await
        .with_context(|| format!("fetch source data for {}", item.item_id))?;

    // Keep descriptions already produced for media we have seen before.
    let prior: HashMap<String, MediaItem> =
        item.media.drain(..).map(|m| (m.source_url.clone(), m)).collect();

    let mut segments = Vec::with_capacity(post.segments.len());
    let mut media = Vec::new();
    let mut urls = Vec::new();
    let mut media_index = 0usize;

    for segment in post.segments {
        segments.push(Segment {
            text: segment.text.clone(),
            media_urls: segment.media.iter().map(|m| m.url.clone()).collect(),
            urls: segment.urls.clone(),
        });
        for fetched in segment.media {
            let is_video = fetched.mime_type.starts_with("video/");
            let ext = extension_for(&fetched.url, is_video);
            let filename = format!("{}_{}.{}", item.item_id, media_index, ext);
            let relative = format!("{}/{}", ctx.config.media_cache_dir, filename);
            let dest = ctx.config.resolve(&relative);

            // Files already in the cache are not re-downloaded.
            if !dest.is_file() {
                ctx.fetcher
                    .download(&fetched.url, &dest)
                    .await
                    .with_context(|| format!("download media {}", fetched.url))?;
            }

            media.push(MediaItem {
                description: prior.get(&fetched.url).and_then(|m| m.description.clone()),
                source_url: fetched.url,
                local_cache_path: Some(relative),
                mime_type: fetched.mime_type,
                is_video,
            });
            media_index += 1;
        }
        for url in segment.urls {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
    }

    item.is_thread = post.is_thread;
    item.full_text = segments
        .iter()
        .map(|s| s.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    item.segments = segments;
    item.media = media;
    item.urls = urls;
    Ok(())
}

fn extension_for(url: &str, is_video: bool) -> String {
    if is_video {
        return "mp4".to_string();
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 4)
        .unwrap_or_else(|| "jpg".to_string())
}
