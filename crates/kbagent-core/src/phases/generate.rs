//! Generate phase: produce the article JSON, convert it to Markdown, and
//! commit the item directory under kb_root.
//!
//! Target paths are claimed up front against both the in-flight batch and
//! the state store, so two items that categorize identically cannot write
//! the same directory; the later claimer records a collision error.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{ChatMessage, GenerateOptions, InferenceBackend, SamplerOptions};
use crate::config::Config;
use crate::events::LogLevel;
use crate::markdown::{article_to_markdown, ArticleJson};
use crate::naming::is_valid_directory_name;
use crate::pipeline::PipelineContext;
use crate::prompts::{ModelType, PromptRenderer, Rendered, PROMPT_KB_ITEM_GENERATION};
use crate::types::{Item, PhaseId, Preferences};

use super::{prologue, PhaseOutcome, WorkError};

struct GeneratedArticle {
    title: String,
    markdown: String,
    raw_json: String,
    kb_media_paths: Vec<String>,
}

pub async fn run(
    ctx: &PipelineContext,
    items: &mut [Item],
    prefs: &Preferences,
) -> Result<PhaseOutcome> {
    let phase = PhaseId::Generate;
    let (reporter, plan, done) = prologue(ctx, items, phase, prefs);
    if let Some(outcome) = done {
        return Ok(outcome);
    }

    let total = plan.needs_work.len() as u64;
    let started = Instant::now();
    let mut processed = 0u64;
    let mut errors = 0u64;
    let mut interrupted = false;

    // Claim target directories before any model call. Paths of batch items
    // outside this run's work set are reserved too.
    let needs_work: HashSet<usize> = plan.needs_work.iter().copied().collect();
    let mut claimed: HashSet<String> = items
        .iter()
        .enumerate()
        .filter(|(idx, _)| !needs_work.contains(idx))
        .filter_map(|(_, item)| item.kb_dir_path.clone())
        .collect();

    let mut work: Vec<(usize, String)> = Vec::with_capacity(plan.needs_work.len());
    for idx in &plan.needs_work {
        let item = &mut items[*idx];
        match claim_path(ctx, item, &mut claimed)? {
            Ok(path) => work.push((*idx, path)),
            Err(message) => {
                item.article_created = false;
                item.set_phase_error(phase, message.clone());
                errors += 1;
                warn!("generate rejected for item {}: {message}", item.item_id);
                ctx.events
                    .log(LogLevel::Error, format!("generate rejected for item {}: {message}", item.item_id));
                ctx.db.upsert_item(item)?;
                reporter.in_progress(processed + errors, total, errors);
            }
        }
    }

    let semaphore = Arc::new(Semaphore::new(ctx.config.num_gpus_available.max(1)));
    let mut join: JoinSet<(usize, Result<(GeneratedArticle, String), WorkError>)> = JoinSet::new();
    for (idx, path) in work {
        let backend = Arc::clone(&ctx.backend);
        let renderer = Arc::clone(&ctx.renderer);
        let config = Arc::clone(&ctx.config);
        let cancel = ctx.cancel.clone();
        let semaphore = Arc::clone(&semaphore);
        let item = items[idx].clone();
        join.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (idx, Err(WorkError::Canceled));
            };
            if cancel.is_cancelled() {
                return (idx, Err(WorkError::Canceled));
            }
            let result = generate_one(&*backend, &renderer, &config, &item, &path, &cancel)
                .await
                .map(|article| (article, path));
            (idx, result)
        });
    }

    while let Some(joined) = join.join_next().await {
        let (idx, result) = joined.context("generate worker panicked")?;
        let item = &mut items[idx];
        match result {
            Ok((article, path)) => {
                item.article_title = Some(article.title);
                item.article_markdown = Some(article.markdown);
                item.article_raw_json = Some(article.raw_json);
                item.kb_media_paths = article.kb_media_paths;
                item.kb_dir_path = Some(path);
                item.article_created = true;
                // The kb_items row no longer matches the fresh article.
                item.db_synced = false;
                processed += 1;
                info!("generated article for item {} at {:?}", item.item_id, item.kb_dir_path);
            }
            Err(WorkError::Canceled) => {
                interrupted = true;
                continue;
            }
            Err(WorkError::Failed(message)) => {
                item.article_created = false;
                item.set_phase_error(phase, message.clone());
                errors += 1;
                warn!("generate failed for item {}: {message}", item.item_id);
                ctx.events
                    .log(LogLevel::Error, format!("generate failed for item {}: {message}", item.item_id));
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

/// Compute and claim the item's target directory. The inner Result carries
/// a per-item rejection (collision or invalid name) that must not abort the
/// batch.
fn claim_path(
    ctx: &PipelineContext,
    item: &Item,
    claimed: &mut HashSet<String>,
) -> Result<std::result::Result<String, String>> {
    let (Some(main), Some(sub), Some(name)) =
        (item.main_category.as_deref(), item.sub_category.as_deref(), item.item_name.as_deref())
    else {
        return Ok(Err("classification fields missing".to_string()));
    };
    for part in [main, sub, name] {
        if !is_valid_directory_name(part) {
            return Ok(Err(format!("classification produced an unsafe directory name '{part}'")));
        }
    }

    let path = format!("{}/{main}/{sub}/{name}", ctx.config.kb_root);
    if claimed.contains(&path) {
        return Ok(Err(format!("kb_dir_path collision at '{path}'")));
    }
    if ctx.db.kb_dir_path_taken(&path, &item.item_id)? {
        return Ok(Err(format!("kb_dir_path collision at '{path}' (already in state store)")));
    }
    claimed.insert(path.clone());
    Ok(Ok(path))
}

/// Generate the article JSON, render Markdown, and write the item directory.
/// Partially written directories are left for the validator to reconcile.
async fn generate_one(
    backend: &dyn InferenceBackend,
    renderer: &PromptRenderer,
    config: &Config,
    item: &Item,
    kb_dir_path: &str,
    cancel: &CancellationToken,
) -> Result<GeneratedArticle, WorkError> {
    let context = build_context(item);
    let mut params = BTreeMap::new();
    params.insert("context".to_string(), context);

    let reasoning = config.text_model_thinking;
    let model_type = if reasoning { ModelType::Reasoning } else { ModelType::Standard };
    let rendered = renderer
        .render(PROMPT_KB_ITEM_GENERATION, model_type, &params, None)
        .map_err(|e| WorkError::Failed(e.to_string()))?;

    let mut messages: Vec<ChatMessage> = match &rendered {
        Rendered::Messages(m) => m.clone(),
        Rendered::Text(_) => Vec::new(),
    };
    let prompt_text = match &rendered {
        Rendered::Text(t) => t.clone(),
        Rendered::Messages(_) => String::new(),
    };

    let attempts = config.generation_max_retries.max(1);
    let mut last_error = String::new();
    let mut article: Option<(ArticleJson, String)> = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(WorkError::Canceled);
        }
        let opts = GenerateOptions {
            options: SamplerOptions {
                json_mode: !reasoning && backend.supports_json_mode(),
                ..SamplerOptions::default()
            },
            ..GenerateOptions::default()
        };
        let response = if reasoning {
            backend.chat(&config.text_model, &messages, &opts).await
        } else {
            backend.generate(&config.text_model, &prompt_text, &opts).await
        };
        let text = match response {
            Ok(text) => text,
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!("generate attempt {attempt} for item {}: {e}", item.item_id);
                last_error = e.to_string();
                continue;
            }
            Err(e) => return Err(WorkError::Failed(e.to_string())),
        };
        match ArticleJson::parse(&text) {
            Ok(parsed) => {
                article = Some((parsed, text));
                break;
            }
            Err(parse_error) => {
                last_error = parse_error.clone();
                if reasoning {
                    messages.push(ChatMessage::assistant(text));
                    messages.push(ChatMessage::user(format!(
                        "Your previous response was not usable: {parse_error}. Respond again \
                         with only the requested JSON object, including 'suggested_title' and \
                         a non-empty 'sections' array."
                    )));
                }
            }
        }
    }

    let Some((article, raw_json)) = article else {
        return Err(WorkError::Failed(format!(
            "article generation failed after {attempts} attempt(s): {last_error}"
        )));
    };

    let markdown = article_to_markdown(&article);
    let kb_media_paths = write_item_dir(config, item, kb_dir_path, &markdown)
        .await
        .map_err(|e| WorkError::Failed(format!("{e:#}")))?;

    Ok(GeneratedArticle {
        title: article.suggested_title.0.clone(),
        markdown,
        raw_json,
        kb_media_paths,
    })
}

fn build_context(item: &Item) -> String {
    let mut context = String::new();
    for (idx, segment) in item.segments.iter().enumerate() {
        if item.is_thread {
            context.push_str(&format!("Post {}:\n", idx + 1));
        }
        context.push_str(&segment.text);
        context.push_str("\n\n");
    }
    if context.trim().is_empty() {
        context = item.full_text.clone();
        context.push_str("\n\n");
    }

    let descriptions: Vec<&str> =
        item.media.iter().filter_map(|m| m.description.as_deref()).collect();
    if !descriptions.is_empty() {
        context.push_str("Media descriptions:\n");
        for description in descriptions {
            context.push_str("- ");
            context.push_str(description);
            context.push('\n');
        }
        context.push('\n');
    }

    if !item.urls.is_empty() {
        context.push_str("Referenced links:\n");
        for url in &item.urls {
            context.push_str("- ");
            context.push_str(url);
            context.push('\n');
        }
        context.push('\n');
    }

    if let (Some(main), Some(sub), Some(name)) =
        (&item.main_category, &item.sub_category, &item.item_name)
    {
        context.push_str(&format!("Category: {main} / {sub} / {name}\n"));
    }
    context.trim_end().to_string()
}

/// Write README.md and copy cached media into `<kb_dir>/media/`. Only after
/// both succeed does the caller flip `article_created`.
async fn write_item_dir(
    config: &Config,
    item: &Item,
    kb_dir_path: &str,
    markdown: &str,
) -> Result<Vec<String>> {
    let dir = config.resolve(kb_dir_path);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("create {}", dir.display()))?;

    tokio::fs::write(dir.join("README.md"), markdown)
        .await
        .with_context(|| format!("write {}/README.md", dir.display()))?;

    let mut kb_media_paths = Vec::new();
    let cached: Vec<String> =
        item.media.iter().filter_map(|m| m.local_cache_path.clone()).collect();
    if !cached.is_empty() {
        let media_dir = dir.join("media");
        tokio::fs::create_dir_all(&media_dir)
            .await
            .with_context(|| format!("create {}", media_dir.display()))?;
        for relative in cached {
            let src = config.resolve(&relative);
            let Some(filename) = src.file_name().map(|f| f.to_string_lossy().to_string()) else {
                continue;
            };
            if !src.is_file() {
                continue;
            }
            tokio::fs::copy(&src, media_dir.join(&filename))
                .await
                .with_context(|| format!("copy media {}", src.display()))?;
            kb_media_paths.push(format!("media/{filename}"));
        }
    }
    Ok(kb_media_paths)
}
