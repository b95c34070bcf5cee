//! Cache/state consistency validator.
//!
//! Runs before any phase executor and compares each item's flags against
//! the filesystem and category fields. Inconsistencies are auto-repaired
//! where a single correct value exists; kb_dir_path collisions cannot be
//! repaired and mark the colliding items as errored for the generate phase
//! in this run.

use std::collections::HashMap;

use anyhow::Result;
use tracing::warn;

use crate::config::Config;
use crate::db::Db;
use crate::events::{EventBus, LogLevel};
use crate::types::{Item, PhaseId};

#[derive(Debug, Clone)]
pub struct Collision {
    pub kb_dir_path: String,
    pub item_ids: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub repairs: u64,
    pub collisions: Vec<Collision>,
}

/// Repair one item's flags in place. Returns the repair descriptions.
fn repair_item(config: &Config, item: &mut Item) -> Vec<String> {
    let mut repairs = Vec::new();

    let readme_exists = item
        .kb_dir_path
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| config.resolve(p).join("README.md").is_file())
        .unwrap_or(false);

    if item.article_created && !readme_exists {
        item.article_created = false;
        repairs.push("article_created set but README missing; reset".to_string());
    } else if !item.article_created && readme_exists {
        item.article_created = true;
        repairs.push("README exists on disk; article_created set".to_string());
    }

    if item.categories_processed {
        let complete = [&item.main_category, &item.sub_category, &item.item_name]
            .iter()
            .all(|f| f.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false));
        if !complete {
            item.categories_processed = false;
            repairs.push("categories_processed set but classification incomplete; reset".to_string());
        }
    }

    if item.db_synced && !item.categories_processed {
        item.db_synced = false;
        repairs.push("db_synced set without categories_processed; reset".to_string());
    }

    if item.media_processed && item.media.iter().any(|m| m.needs_description()) {
        item.media_processed = false;
        repairs.push("media_processed set but cached non-video media lacks description; reset".to_string());
    }

    repairs
}

/// Pre-run validation over the current batch. Repairs are persisted before
/// any phase executor runs; collisions are fatal for the colliding items.
pub fn validate_batch(
    db: &Db,
    events: &EventBus,
    config: &Config,
    items: &mut [Item],
) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();

    for item in items.iter_mut() {
        let repairs = repair_item(config, item);
        if !repairs.is_empty() {
            report.repairs += repairs.len() as u64;
            for repair in &repairs {
                warn!("validator: item {}: {repair}", item.item_id);
                events.log(LogLevel::Warning, format!("item {}: {repair}", item.item_id));
            }
            db.upsert_item(item)?;
        }
    }

    // Second pass: kb_dir_path collisions across the batch.
    let mut by_path: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, item) in items.iter().enumerate() {
        if let Some(path) = item.kb_dir_path.as_deref().filter(|p| !p.is_empty()) {
            by_path.entry(path.to_string()).or_default().push(idx);
        }
    }
    let mut paths: Vec<(String, Vec<usize>)> =
        by_path.into_iter().filter(|(_, idxs)| idxs.len() > 1).collect();
    paths.sort_by(|a, b| a.0.cmp(&b.0));

    for (path, indexes) in paths {
        let ids: Vec<String> = indexes.iter().map(|i| items[*i].item_id.clone()).collect();
        warn!("validator: kb_dir_path collision at '{path}': {}", ids.join(", "));
        events.log(
            LogLevel::Warning,
            format!("kb_dir_path collision at '{path}': {}", ids.join(", ")),
        );
        for idx in &indexes {
            let item = &mut items[*idx];
            item.set_phase_error(
                PhaseId::Generate,
                format!("kb_dir_path collision at '{path}'"),
            );
            db.upsert_item(item)?;
        }
        report.collisions.push(Collision { kb_dir_path: path, item_ids: ids });
    }

    Ok(report)
}

// ── Full-store audit ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct AuditReport {
    pub items_checked: u64,
    /// Human-readable invariant violations, one per finding.
    pub violations: Vec<String>,
    pub collisions: Vec<Collision>,
}

/// Report-only audit across the full state store, used by operator tooling.
pub fn audit_store(db: &Db, config: &Config) -> Result<AuditReport> {
    let mut report = AuditReport::default();

    for item in db.list_all_items()? {
        report.items_checked += 1;
        let mut probe = item.clone();
        for repair in repair_item(config, &mut probe) {
            report.violations.push(format!("item {}: {repair}", item.item_id));
        }
        if item.db_synced && db.get_kb_item(&item.item_id)?.is_none() {
            report
                .violations
                .push(format!("item {}: db_synced set but kb_items row missing", item.item_id));
        }
    }

    for (path, ids) in db.list_kb_dir_collisions()? {
        report.collisions.push(Collision { kb_dir_path: path, item_ids: ids });
    }

    Ok(report)
}
