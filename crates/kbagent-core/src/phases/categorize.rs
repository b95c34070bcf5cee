//! Categorize phase: LLM classification into (main_category, sub_category,
//! item_name), with parse-retry, corrective chat turns, fallback model, and
//! round-robin GPU distribution.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{ChatMessage, GenerateOptions, InferenceBackend, SamplerOptions};
use crate::categories::format_existing;
use crate::config::Config;
use crate::events::LogLevel;
use crate::markdown::extract_json_object;
use crate::naming::normalize_for_filesystem;
use crate::pipeline::PipelineContext;
use crate::prompts::{ModelType, PromptRenderer, Rendered, PROMPT_CATEGORIZATION};
use crate::types::{Item, PhaseId, Preferences};

use super::{prologue, PhaseOutcome, WorkError};

/// Maximum normalized length for the two category levels.
const CATEGORY_MAX_LENGTH: usize = 30;

#[derive(Debug, Clone)]
pub(crate) struct Classified {
    pub main_category: String,
    pub sub_category: String,
    pub item_name: String,
}

pub async fn run(
    ctx: &PipelineContext,
    items: &mut [Item],
    prefs: &Preferences,
) -> Result<PhaseOutcome> {
    let phase = PhaseId::Categorize;
    let (reporter, plan, done) = prologue(ctx, items, phase, prefs);
    if let Some(outcome) = done {
        return Ok(outcome);
    }

    let listing = format_existing(&ctx.categories.get_categories()?);
    let total = plan.needs_work.len() as u64;
    let started = Instant::now();
    let num_gpus = ctx.config.num_gpus_available.max(1);
    let semaphore = Arc::new(Semaphore::new(num_gpus));

    let mut join: JoinSet<(usize, Result<Classified, WorkError>)> = JoinSet::new();
    for (slot, idx) in plan.needs_work.iter().copied().enumerate() {
        let backend = Arc::clone(&ctx.backend);
        let renderer = Arc::clone(&ctx.renderer);
        let config = Arc::clone(&ctx.config);
        let cancel = ctx.cancel.clone();
        let semaphore = Arc::clone(&semaphore);
        let listing = listing.clone();
        let item = items[idx].clone();
        // Round-robin GPU assignment across submissions.
        let gpu = (slot % num_gpus) as u32;
        join.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (idx, Err(WorkError::Canceled));
            };
            if cancel.is_cancelled() {
                return (idx, Err(WorkError::Canceled));
            }
            let result =
                categorize_one(&*backend, &renderer, &config, &listing, &item, gpu, &cancel).await;
            (idx, result)
        });
    }

    let mut processed = 0u64;
    let mut errors = 0u64;
    let mut interrupted = false;

    while let Some(joined) = join.join_next().await {
        let (idx, result) = joined.context("categorize worker panicked")?;
        let item = &mut items[idx];
        match result {
            Ok(classified) => {
                if let Err(e) = ctx
                    .categories
                    .ensure_category(&classified.main_category, &classified.sub_category)
                {
                    warn!("ensure_category {}/{}: {e}", classified.main_category, classified.sub_category);
                }
                info!(
                    "categorized item {} as {}/{}/{}",
                    item.item_id,
                    classified.main_category,
                    classified.sub_category,
                    classified.item_name
                );
                item.main_category = Some(classified.main_category);
                item.sub_category = Some(classified.sub_category);
                item.item_name = Some(classified.item_name);
                item.categories_processed = true;
                processed += 1;
            }
            Err(WorkError::Canceled) => {
                interrupted = true;
                continue;
            }
            Err(WorkError::Failed(message)) => {
                item.categories_processed = false;
                item.set_phase_error(phase, message.clone());
                errors += 1;
                warn!("categorize failed for item {}: {message}", item.item_id);
                ctx.events
                    .log(LogLevel::Error, format!("categorize failed for item {}: {message}", item.item_id));
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

/// Classify one item. Retries parse failures up to the configured budget,
/// appending a corrective user turn in chat mode or re-sampling in generate
/// mode; attempts beyond the primary budget switch to the fallback model.
async fn categorize_one(
    backend: &dyn InferenceBackend,
    renderer: &PromptRenderer,
    config: &Config,
    listing: &str,
    item: &Item,
    gpu: u32,
    cancel: &CancellationToken,
) -> Result<Classified, WorkError> {
    let mut content = item.full_text.trim().to_string();
    let descriptions: Vec<&str> = item
        .media
        .iter()
        .filter_map(|m| m.description.as_deref())
        .collect();
    if !descriptions.is_empty() {
        content.push_str("\n\nImage Descriptions:\n");
        content.push_str(&descriptions.join("\n"));
    }
    if content.trim().is_empty() {
        return Err(WorkError::Failed(
            "validation failed: item has no text or media content to categorize".to_string(),
        ));
    }

    let reasoning = config.categorization_model_thinking;
    let model_type = if reasoning { ModelType::Reasoning } else { ModelType::Standard };
    let mut params = BTreeMap::new();
    params.insert("content".to_string(), content);
    params.insert("existing_categories".to_string(), listing.to_string());

    let rendered = renderer
        .render(PROMPT_CATEGORIZATION, model_type, &params, None)
        .map_err(|e| WorkError::Failed(e.to_string()))?;

    let primary_attempts = config.categorization_max_retries.max(1);
    let has_fallback = !config.fallback_model.is_empty();
    let total_attempts = if has_fallback { primary_attempts * 2 } else { primary_attempts };

    let mut messages: Vec<ChatMessage> = match &rendered {
        Rendered::Messages(m) => m.clone(),
        Rendered::Text(_) => Vec::new(),
    };
    let prompt_text = match &rendered {
        Rendered::Text(t) => t.clone(),
        Rendered::Messages(_) => String::new(),
    };

    let mut last_error = String::new();
    for attempt in 1..=total_attempts {
        if cancel.is_cancelled() {
            return Err(WorkError::Canceled);
        }
        let model = if attempt <= primary_attempts {
            &config.categorization_model
        } else {
            &config.fallback_model
        };
        let opts = GenerateOptions {
            options: SamplerOptions {
                json_mode: !reasoning && backend.supports_json_mode(),
                gpu_device: Some(gpu),
                ..SamplerOptions::default()
            },
            ..GenerateOptions::default()
        };

        let response = if reasoning {
            backend.chat(model, &messages, &opts).await
        } else {
            backend.generate(model, &prompt_text, &opts).await
        };

        let text = match response {
            Ok(text) => text,
            Err(e) if e.is_retryable() && attempt < total_attempts => {
                warn!("categorize attempt {attempt} for item {}: {e}", item.item_id);
                last_error = e.to_string();
                continue;
            }
            Err(e) => return Err(WorkError::Failed(e.to_string())),
        };

        match parse_classification(&text, config.item_name_max_length) {
            Ok(classified) => return Ok(classified),
            Err(parse_error) => {
                last_error = parse_error.clone();
                if reasoning {
                    // Corrective follow-up turn keeps the conversation going.
                    messages.push(ChatMessage::assistant(text));
                    messages.push(ChatMessage::user(format!(
                        "Your previous response was not usable: {parse_error}. Respond again \
                         with only a JSON object containing non-empty 'main_category', \
                         'sub_category', and 'item_name' fields."
                    )));
                }
            }
        }
    }

    Err(WorkError::Failed(format!(
        "categorization failed after {total_attempts} attempt(s): {last_error}"
    )))
}

/// Parse and normalize a categorization response. All three fields are
/// required and non-empty after trimming.
pub(crate) fn parse_classification(text: &str, name_max_length: usize) -> Result<Classified, String> {
    if text.trim().is_empty() {
        return Err("model returned an empty response".to_string());
    }
    let json = extract_json_object(text)
        .ok_or_else(|| "response did not contain a JSON object".to_string())?;
    let value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| format!("invalid JSON: {e}"))?;

    let mut fields = [String::new(), String::new(), String::new()];
    for (slot, key) in ["main_category", "sub_category", "item_name"].iter().enumerate() {
        let raw = value[*key].as_str().map(str::trim).unwrap_or_default();
        if raw.is_empty() {
            return Err(format!("missing or empty field '{key}'"));
        }
        fields[slot] = raw.to_string();
    }

    let [main, sub, name] = fields;
    Ok(Classified {
        main_category: normalize_for_filesystem(&main, CATEGORY_MAX_LENGTH),
        sub_category: normalize_for_filesystem(&sub, CATEGORY_MAX_LENGTH),
        item_name: normalize_for_filesystem(&name, name_max_length),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let c = parse_classification(
            r#"{"main_category": "Machine Learning", "sub_category": "Transformers", "item_name": "Attention Basics"}"#,
            30,
        )
        .unwrap();
        assert_eq!(c.main_category, "machine_learning");
        assert_eq!(c.sub_category, "transformers");
        assert_eq!(c.item_name, "attention_basics");
    }

    #[test]
    fn parses_fenced_json() {
        let text = "Sure!\n```json\n{\"main_category\": \"rust\", \"sub_category\": \"async\", \"item_name\": \"pinning\"}\n```";
        let c = parse_classification(text, 30).unwrap();
        assert_eq!(c.item_name, "pinning");
    }

    #[test]
    fn rejects_missing_fields() {
        let err = parse_classification(r#"{"main_category": "rust", "sub_category": "async"}"#, 30)
            .unwrap_err();
        assert!(err.contains("item_name"));
    }

    #[test]
    fn rejects_empty_response() {
        assert!(parse_classification("", 30).is_err());
        assert!(parse_classification("   ", 30).is_err());
    }

    #[test]
    fn rejects_whitespace_only_field() {
        let err = parse_classification(
            r#"{"main_category": " ", "sub_category": "async", "item_name": "x"}"#,
            30,
        )
        .unwrap_err();
        assert!(err.contains("main_category"));
    }

    #[test]
    fn clamps_item_name_length() {
        let c = parse_classification(
            r#"{"main_category": "a", "sub_category": "b", "item_name": "a very long item name that keeps going"}"#,
            15,
        )
        .unwrap();
        assert!(c.item_name.len() <= 15, "got {:?}", c.item_name);
    }
}
