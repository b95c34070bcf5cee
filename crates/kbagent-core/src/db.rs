use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{
    AgentState, Item, KbItemRow, MediaItem, PhaseStats, Preferences, Segment, Task, TaskStatus,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

/// Conjunction of flag constraints for bulk item queries. `None` leaves a
/// flag unconstrained.
#[derive(Debug, Clone, Copy, Default)]
pub struct EligibilityFilter {
    pub cache_complete: Option<bool>,
    pub media_processed: Option<bool>,
    pub categories_processed: Option<bool>,
    pub article_created: Option<bool>,
    pub db_synced: Option<bool>,
    pub processed: Option<bool>,
    /// Require (or forbid) all three classification fields being present.
    pub has_categories: Option<bool>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn now_str() -> String {
    fmt_ts(&Utc::now())
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    let segments_json: String = row.get(3)?;
    let media_json: String = row.get(5)?;
    let urls_json: String = row.get(6)?;
    let kb_media_json: String = row.get(14)?;
    let phase_errors_json: String = row.get(21)?;
    let created_at: String = row.get(22)?;
    let updated_at: String = row.get(23)?;
    Ok(Item {
        item_id: row.get(0)?,
        source_url: row.get(1)?,
        is_thread: row.get::<_, i64>(2)? != 0,
        segments: serde_json::from_str::<Vec<Segment>>(&segments_json).unwrap_or_default(),
        full_text: row.get(4)?,
        media: serde_json::from_str::<Vec<MediaItem>>(&media_json).unwrap_or_default(),
        urls: serde_json::from_str::<Vec<String>>(&urls_json).unwrap_or_default(),
        main_category: row.get(7)?,
        sub_category: row.get(8)?,
        item_name: row.get(9)?,
        article_title: row.get(10)?,
        article_markdown: row.get(11)?,
        article_raw_json: row.get(12)?,
        kb_dir_path: row.get(13)?,
        kb_media_paths: serde_json::from_str::<Vec<String>>(&kb_media_json).unwrap_or_default(),
        cache_complete: row.get::<_, i64>(15)? != 0,
        media_processed: row.get::<_, i64>(16)? != 0,
        categories_processed: row.get::<_, i64>(17)? != 0,
        article_created: row.get::<_, i64>(18)? != 0,
        db_synced: row.get::<_, i64>(19)? != 0,
        processed: row.get::<_, i64>(20)? != 0,
        phase_errors: serde_json::from_str::<BTreeMap<String, String>>(&phase_errors_json)
            .unwrap_or_default(),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

const ITEM_COLUMNS: &str = "item_id, source_url, is_thread, segments, full_text, media, urls, \
     main_category, sub_category, item_name, article_title, article_markdown, \
     article_raw_json, kb_dir_path, kb_media_paths, cache_complete, media_processed, \
     categories_processed, article_created, db_synced, processed, phase_errors, \
     created_at, updated_at";

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(2)?;
    let prefs_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let started_at: Option<String> = row.get(5)?;
    let completed_at: Option<String> = row.get(6)?;
    let heartbeat_at: Option<String> = row.get(7)?;
    let summary_json: Option<String> = row.get(12)?;
    Ok(Task {
        task_id: row.get(0)?,
        kind: row.get(1)?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
        preferences: serde_json::from_str(&prefs_json).unwrap_or_default(),
        created_at: parse_ts(&created_at),
        started_at: started_at.as_deref().map(parse_ts),
        completed_at: completed_at.as_deref().map(parse_ts),
        last_heartbeat_at: heartbeat_at.as_deref().map(parse_ts),
        current_phase: row.get(8)?,
        current_phase_message: row.get(9)?,
        progress_percent: row.get(10)?,
        error_message: row.get(11)?,
        result_summary: summary_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

const TASK_COLUMNS: &str = "task_id, kind, status, preferences, created_at, started_at, \
     completed_at, last_heartbeat_at, current_phase, current_phase_message, \
     progress_percent, error_message, result_summary";

fn row_to_phase_stats(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhaseStats> {
    Ok(PhaseStats {
        phase_id: row.get(0)?,
        items_processed_total: row.get(1)?,
        duration_seconds_total: row.get(2)?,
    })
}

fn row_to_kb_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<KbItemRow> {
    let media_json: String = row.get(7)?;
    let created_at_source: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok(KbItemRow {
        item_id: row.get(0)?,
        content: row.get(1)?,
        main_category: row.get(2)?,
        sub_category: row.get(3)?,
        item_name: row.get(4)?,
        source_url: row.get(5)?,
        kb_dir_path: row.get(6)?,
        kb_media_paths: serde_json::from_str(&media_json).unwrap_or_default(),
        created_at_source: created_at_source.as_deref().map(parse_ts),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        // Idempotent column additions for DBs created before these columns
        // existed. ALTER TABLE fails if the column already exists; ignore.
        let alters = [
            "ALTER TABLE items ADD COLUMN processed INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE items ADD COLUMN phase_errors TEXT NOT NULL DEFAULT '{}'",
            "ALTER TABLE tasks ADD COLUMN cancel_requested INTEGER NOT NULL DEFAULT 0",
        ];
        for sql in alters {
            let _ = conn.execute(sql, []);
        }
        // Legacy rows sometimes carried these as bare strings instead of
        // JSON arrays; normalize once so mappers can rely on JSON.
        for (column, default) in [
            ("segments", "'[]'"),
            ("media", "'[]'"),
            ("urls", "'[]'"),
            ("kb_media_paths", "'[]'"),
            ("phase_errors", "'{}'"),
        ] {
            let sql = format!(
                "UPDATE items SET {column} = {default} WHERE json_valid({column}) = 0"
            );
            let _ = conn.execute(&sql, []);
        }
        Ok(())
    }

    // ── Items ─────────────────────────────────────────────────────────────

    pub fn get_item(&self, item_id: &str) -> Result<Option<Item>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE item_id = ?1");
        conn.query_row(&sql, params![item_id], row_to_item)
            .optional()
            .context("get_item")
    }

    /// Insert or fully replace an item row. Row-level atomic; the connection
    /// mutex serializes writers, so the last writer wins per field.
    pub fn upsert_item(&self, item: &Item) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let segments = serde_json::to_string(&item.segments).unwrap_or_else(|_| "[]".into());
        let media = serde_json::to_string(&item.media).unwrap_or_else(|_| "[]".into());
        let urls = serde_json::to_string(&item.urls).unwrap_or_else(|_| "[]".into());
        let kb_media = serde_json::to_string(&item.kb_media_paths).unwrap_or_else(|_| "[]".into());
        let phase_errors =
            serde_json::to_string(&item.phase_errors).unwrap_or_else(|_| "{}".into());
        conn.execute(
            "INSERT INTO items (item_id, source_url, is_thread, segments, full_text, media, \
             urls, main_category, sub_category, item_name, article_title, article_markdown, \
             article_raw_json, kb_dir_path, kb_media_paths, cache_complete, media_processed, \
             categories_processed, article_created, db_synced, processed, phase_errors, \
             created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24) \
             ON CONFLICT(item_id) DO UPDATE SET \
               source_url = excluded.source_url, \
               is_thread = excluded.is_thread, \
               segments = excluded.segments, \
               full_text = excluded.full_text, \
               media = excluded.media, \
               urls = excluded.urls, \
               main_category = excluded.main_category, \
               sub_category = excluded.sub_category, \
               item_name = excluded.item_name, \
               article_title = excluded.article_title, \
               article_markdown = excluded.article_markdown, \
               article_raw_json = excluded.article_raw_json, \
               kb_dir_path = excluded.kb_dir_path, \
               kb_media_paths = excluded.kb_media_paths, \
               cache_complete = excluded.cache_complete, \
               media_processed = excluded.media_processed, \
               categories_processed = excluded.categories_processed, \
               article_created = excluded.article_created, \
               db_synced = excluded.db_synced, \
               processed = excluded.processed, \
               phase_errors = excluded.phase_errors, \
               updated_at = excluded.updated_at",
            params![
                item.item_id,
                item.source_url,
                item.is_thread as i64,
                segments,
                item.full_text,
                media,
                urls,
                item.main_category,
                item.sub_category,
                item.item_name,
                item.article_title,
                item.article_markdown,
                item.article_raw_json,
                item.kb_dir_path,
                kb_media,
                item.cache_complete as i64,
                item.media_processed as i64,
                item.categories_processed as i64,
                item.article_created as i64,
                item.db_synced as i64,
                item.processed as i64,
                phase_errors,
                fmt_ts(&item.created_at),
                now_str(),
            ],
        )
        .context("upsert_item")?;
        Ok(())
    }

    pub fn mark_item_processed(&self, item_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE items SET processed = 1, updated_at = ?1 WHERE item_id = ?2",
            params![now_str(), item_id],
        )
        .context("mark_item_processed")?;
        Ok(())
    }

    pub fn list_items(&self, item_ids: &[String]) -> Result<Vec<Item>> {
        let mut items = Vec::with_capacity(item_ids.len());
        for id in item_ids {
            if let Some(item) = self.get_item(id)? {
                items.push(item);
            }
        }
        Ok(items)
    }

    pub fn list_unprocessed_item_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .list_eligible(&EligibilityFilter { processed: Some(false), ..EligibilityFilter::default() })?
            .into_iter()
            .map(|item| item.item_id)
            .collect())
    }

    /// Items matching a conjunction of flag values and category presence.
    pub fn list_eligible(&self, filter: &EligibilityFilter) -> Result<Vec<Item>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items \
             WHERE (?1 IS NULL OR cache_complete = ?1) \
             AND (?2 IS NULL OR media_processed = ?2) \
             AND (?3 IS NULL OR categories_processed = ?3) \
             AND (?4 IS NULL OR article_created = ?4) \
             AND (?5 IS NULL OR db_synced = ?5) \
             AND (?6 IS NULL OR processed = ?6) \
             AND (?7 IS NULL OR (main_category IS NOT NULL AND sub_category IS NOT NULL \
                  AND item_name IS NOT NULL) = ?7) \
             ORDER BY created_at ASC, item_id ASC"
        );
        let as_int = |v: Option<bool>| v.map(i64::from);
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(
                params![
                    as_int(filter.cache_complete),
                    as_int(filter.media_processed),
                    as_int(filter.categories_processed),
                    as_int(filter.article_created),
                    as_int(filter.db_synced),
                    as_int(filter.processed),
                    as_int(filter.has_categories),
                ],
                row_to_item,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_eligible")?;
        Ok(items)
    }

    pub fn list_all_items(&self) -> Result<Vec<Item>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items ORDER BY item_id ASC");
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map([], row_to_item)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_all_items")?;
        Ok(items)
    }

    /// Item ids whose persisted kb_dir_path is shared with another item.
    pub fn list_kb_dir_collisions(&self) -> Result<Vec<(String, Vec<String>)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT kb_dir_path, GROUP_CONCAT(item_id, ',') FROM items \
             WHERE kb_dir_path IS NOT NULL \
             GROUP BY kb_dir_path HAVING COUNT(*) > 1 \
             ORDER BY kb_dir_path ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let path: String = row.get(0)?;
                let ids: String = row.get(1)?;
                Ok((path, ids.split(',').map(str::to_string).collect::<Vec<_>>()))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_kb_dir_collisions")?;
        Ok(rows)
    }

    /// Whether any other item already claims this kb_dir_path.
    pub fn kb_dir_path_taken(&self, path: &str, excluding_item: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM items WHERE kb_dir_path = ?1 AND item_id != ?2",
                params![path, excluding_item],
                |r| r.get(0),
            )
            .context("kb_dir_path_taken")?;
        Ok(count > 0)
    }

    // ── Tasks ─────────────────────────────────────────────────────────────

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let prefs = serde_json::to_string(&task.preferences).unwrap_or_else(|_| "{}".into());
        conn.execute(
            "INSERT INTO tasks (task_id, kind, status, preferences, created_at, \
             current_phase_message, progress_percent, error_message) \
             VALUES (?1, ?2, ?3, ?4, ?5, '', 0, '')",
            params![
                task.task_id,
                task.kind,
                task.status.as_str(),
                prefs,
                fmt_ts(&task.created_at),
            ],
        )
        .context("insert_task")?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1");
        conn.query_row(&sql, params![task_id], row_to_task)
            .optional()
            .context("get_task")
    }

    /// Move a task into `running` and stamp started_at / heartbeat.
    pub fn set_task_running(&self, task_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "UPDATE tasks SET status = 'running', started_at = ?1, last_heartbeat_at = ?1 \
             WHERE task_id = ?2 AND status = 'pending'",
            params![now, task_id],
        )
        .context("set_task_running")?;
        Ok(())
    }

    /// Transition a task into a terminal state. A task already terminal is
    /// left untouched, so the transition happens exactly once.
    pub fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        error_message: Option<&str>,
        result_summary: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let summary = result_summary.map(|v| v.to_string());
        let n = conn
            .execute(
                "UPDATE tasks SET status = ?1, completed_at = ?2, \
                 error_message = COALESCE(?3, error_message), \
                 result_summary = COALESCE(?4, result_summary) \
                 WHERE task_id = ?5 AND status NOT IN ('succeeded', 'failed', 'canceled')",
                params![status.as_str(), now_str(), error_message, summary, task_id],
            )
            .context("finish_task")?;
        Ok(n > 0)
    }

    pub fn heartbeat_task(&self, task_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET last_heartbeat_at = ?1 WHERE task_id = ?2",
            params![now_str(), task_id],
        )
        .context("heartbeat_task")?;
        Ok(())
    }

    /// Flag a non-terminal task for cancellation; observed by the owning
    /// worker's heartbeat loop, possibly in another process.
    pub fn request_task_cancel(&self, task_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE tasks SET cancel_requested = 1 \
                 WHERE task_id = ?1 AND status IN ('pending', 'running')",
                params![task_id],
            )
            .context("request_task_cancel")?;
        Ok(n > 0)
    }

    pub fn is_cancel_requested(&self, task_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let flagged: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM tasks WHERE task_id = ?1",
                params![task_id],
                |r| r.get(0),
            )
            .optional()
            .context("is_cancel_requested")?;
        Ok(flagged.unwrap_or(0) != 0)
    }

    /// Backdate a task's heartbeat; used by tests and operator tooling.
    pub fn set_task_heartbeat(&self, task_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET last_heartbeat_at = ?1 WHERE task_id = ?2",
            params![fmt_ts(&at), task_id],
        )
        .context("set_task_heartbeat")?;
        Ok(())
    }

    pub fn update_task_progress(
        &self,
        task_id: &str,
        current_phase: Option<&str>,
        message: &str,
        progress_percent: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET current_phase = ?1, current_phase_message = ?2, \
             progress_percent = ?3 WHERE task_id = ?4",
            params![current_phase, message, progress_percent, task_id],
        )
        .context("update_task_progress")?;
        Ok(())
    }

    pub fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params![status.as_str()], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_tasks_by_status")?;
        Ok(tasks)
    }

    /// Non-terminal tasks whose heartbeat (or creation, when never started)
    /// is older than the threshold.
    pub fn list_stale_candidates(&self, threshold_secs: i64) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = fmt_ts(&(Utc::now() - chrono::Duration::seconds(threshold_secs)));
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status IN ('pending', 'running') \
             AND COALESCE(last_heartbeat_at, created_at) < ?1 \
             ORDER BY created_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params![cutoff], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_stale_candidates")?;
        Ok(tasks)
    }

    pub fn count_tasks_by_status(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status ASC")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("count_tasks_by_status")?;
        Ok(rows)
    }

    // ── Task queue ────────────────────────────────────────────────────────

    pub fn enqueue_task(&self, task_id: &str, priority: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO queue_entries (task_id, priority, enqueued_at, attempts) \
             VALUES (?1, ?2, ?3, 0)",
            params![task_id, priority, now_str()],
        )
        .context("enqueue_task")?;
        Ok(())
    }

    /// Pop the next queue entry, highest priority first then FIFO.
    /// The select-and-delete runs under the connection mutex, so concurrent
    /// workers never pop the same entry.
    pub fn dequeue_next(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let next: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, task_id FROM queue_entries \
                 ORDER BY priority DESC, id ASC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("dequeue_next select")?;
        let Some((id, task_id)) = next else {
            return Ok(None);
        };
        conn.execute("DELETE FROM queue_entries WHERE id = ?1", params![id])
            .context("dequeue_next delete")?;
        Ok(Some(task_id))
    }

    pub fn remove_queue_entries(&self, task_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM queue_entries WHERE task_id = ?1", params![task_id])
            .context("remove_queue_entries")?;
        Ok(())
    }

    // ── Agent singleton ───────────────────────────────────────────────────

    pub fn get_agent_state(&self) -> Result<AgentState> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT is_running, current_task_id, current_phase_message, last_update \
             FROM agent_state WHERE id = 1",
            [],
            |row| {
                let last_update: String = row.get(3)?;
                Ok(AgentState {
                    is_running: row.get::<_, i64>(0)? != 0,
                    current_task_id: row.get(1)?,
                    current_phase_message: row.get(2)?,
                    last_update: parse_ts(&last_update),
                })
            },
        )
        .context("get_agent_state")
    }

    pub fn set_agent_running(&self, task_id: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agent_state SET is_running = 1, current_task_id = ?1, \
             current_phase_message = ?2, last_update = ?3 WHERE id = 1",
            params![task_id, message, now_str()],
        )
        .context("set_agent_running")?;
        Ok(())
    }

    pub fn clear_agent_state(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agent_state SET is_running = 0, current_task_id = NULL, \
             current_phase_message = '', last_update = ?1 WHERE id = 1",
            params![now_str()],
        )
        .context("clear_agent_state")?;
        Ok(())
    }

    // ── Phase stats ───────────────────────────────────────────────────────

    pub fn record_phase_stats(&self, phase_id: &str, items: i64, duration_secs: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO phase_stats (phase_id, items_processed_total, duration_seconds_total, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(phase_id) DO UPDATE SET \
               items_processed_total = items_processed_total + excluded.items_processed_total, \
               duration_seconds_total = duration_seconds_total + excluded.duration_seconds_total, \
               updated_at = excluded.updated_at",
            params![phase_id, items, duration_secs, now_str()],
        )
        .context("record_phase_stats")?;
        Ok(())
    }

    pub fn get_phase_stats(&self, phase_id: &str) -> Result<Option<PhaseStats>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT phase_id, items_processed_total, duration_seconds_total \
             FROM phase_stats WHERE phase_id = ?1",
            params![phase_id],
            row_to_phase_stats,
        )
        .optional()
        .context("get_phase_stats")
    }

    // ── Categories ────────────────────────────────────────────────────────

    pub fn ensure_category(&self, main: &str, sub: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO categories (main_category, sub_category, created_at) \
             VALUES (?1, ?2, ?3)",
            params![main, sub, now_str()],
        )
        .context("ensure_category")?;
        Ok(())
    }

    pub fn list_categories(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT main_category, sub_category FROM categories \
             ORDER BY main_category ASC, sub_category ASC",
        )?;
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_categories")?;
        for (main, sub) in rows {
            map.entry(main).or_default().push(sub);
        }
        Ok(map)
    }

    // ── KB items ──────────────────────────────────────────────────────────

    pub fn upsert_kb_item(&self, row: &KbItemRow) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let media = serde_json::to_string(&row.kb_media_paths).unwrap_or_else(|_| "[]".into());
        conn.execute(
            "INSERT INTO kb_items (item_id, content, main_category, sub_category, item_name, \
             source_url, kb_dir_path, kb_media_paths, created_at_source, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10) \
             ON CONFLICT(item_id) DO UPDATE SET \
               content = excluded.content, \
               main_category = excluded.main_category, \
               sub_category = excluded.sub_category, \
               item_name = excluded.item_name, \
               source_url = excluded.source_url, \
               kb_dir_path = excluded.kb_dir_path, \
               kb_media_paths = excluded.kb_media_paths, \
               created_at_source = excluded.created_at_source, \
               updated_at = excluded.updated_at",
            params![
                row.item_id,
                row.content,
                row.main_category,
                row.sub_category,
                row.item_name,
                row.source_url,
                row.kb_dir_path,
                media,
                row.created_at_source.as_ref().map(fmt_ts),
                now_str(),
            ],
        )
        .context("upsert_kb_item")?;
        Ok(())
    }

    pub fn get_kb_item(&self, item_id: &str) -> Result<Option<KbItemRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT item_id, content, main_category, sub_category, item_name, source_url, \
             kb_dir_path, kb_media_paths, created_at_source, created_at, updated_at \
             FROM kb_items WHERE item_id = ?1",
            params![item_id],
            row_to_kb_item,
        )
        .optional()
        .context("get_kb_item")
    }
}

/// Build a pending task record ready for insertion.
pub fn new_task(task_id: impl Into<String>, kind: impl Into<String>, preferences: Preferences) -> Task {
    Task {
        task_id: task_id.into(),
        kind: kind.into(),
        status: TaskStatus::Pending,
        preferences,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        last_heartbeat_at: None,
        current_phase: None,
        current_phase_message: String::new(),
        progress_percent: 0,
        error_message: String::new(),
        result_summary: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PhaseId;

    fn open_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    #[test]
    fn item_roundtrip() {
        let db = open_db();
        let mut item = Item::new("tweet_1", "https://x.com/i/status/1");
        item.segments = vec![Segment {
            text: "hello".into(),
            media_urls: vec!["https://cdn.example/a.jpg".into()],
            urls: vec![],
        }];
        item.full_text = "hello".into();
        item.media = vec![MediaItem {
            source_url: "https://cdn.example/a.jpg".into(),
            local_cache_path: Some("data/media_cache/tweet_1_0.jpg".into()),
            mime_type: "image/jpeg".into(),
            description: None,
            is_video: false,
        }];
        item.cache_complete = true;
        item.set_phase_error(PhaseId::Media, "vision model unreachable");
        db.upsert_item(&item).unwrap();

        let loaded = db.get_item("tweet_1").unwrap().unwrap();
        assert!(loaded.cache_complete);
        assert_eq!(loaded.segments.len(), 1);
        assert_eq!(loaded.media[0].mime_type, "image/jpeg");
        assert_eq!(loaded.phase_error(PhaseId::Media), Some("vision model unreachable"));

        // Update wins over the previous row.
        let mut loaded2 = loaded.clone();
        loaded2.media_processed = true;
        loaded2.phase_errors.clear();
        db.upsert_item(&loaded2).unwrap();
        let reloaded = db.get_item("tweet_1").unwrap().unwrap();
        assert!(reloaded.media_processed);
        assert!(reloaded.phase_errors.is_empty());
    }

    #[test]
    fn task_lifecycle_terminal_exactly_once() {
        let db = open_db();
        let task = new_task("t1", "content_processing", Preferences::default());
        db.insert_task(&task).unwrap();

        db.set_task_running("t1").unwrap();
        let t = db.get_task("t1").unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert!(t.started_at.is_some());

        assert!(db.finish_task("t1", TaskStatus::Succeeded, None, None).unwrap());
        // A second terminal transition is a no-op.
        assert!(!db.finish_task("t1", TaskStatus::Failed, Some("late"), None).unwrap());
        let t = db.get_task("t1").unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Succeeded);
        assert!(t.error_message.is_empty());
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn queue_pops_priority_then_fifo() {
        let db = open_db();
        for (id, priority) in [("a", 0), ("b", 5), ("c", 0), ("d", 5)] {
            db.insert_task(&new_task(id, "k", Preferences::default())).unwrap();
            db.enqueue_task(id, priority).unwrap();
        }
        let order: Vec<String> =
            std::iter::from_fn(|| db.dequeue_next().unwrap()).collect();
        assert_eq!(order, ["b", "d", "a", "c"]);
        assert!(db.dequeue_next().unwrap().is_none());
    }

    #[test]
    fn stale_candidates_respect_threshold() {
        let db = open_db();
        db.insert_task(&new_task("old", "k", Preferences::default())).unwrap();
        db.set_task_running("old").unwrap();
        db.set_task_heartbeat("old", Utc::now() - chrono::Duration::hours(3)).unwrap();

        db.insert_task(&new_task("fresh", "k", Preferences::default())).unwrap();
        db.set_task_running("fresh").unwrap();

        let stale = db.list_stale_candidates(7200).unwrap();
        let ids: Vec<&str> = stale.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, ["old"]);
    }

    #[test]
    fn agent_singleton_roundtrip() {
        let db = open_db();
        let s = db.get_agent_state().unwrap();
        assert!(!s.is_running);

        db.set_agent_running("t9", "categorize: 3/10").unwrap();
        let s = db.get_agent_state().unwrap();
        assert!(s.is_running);
        assert_eq!(s.current_task_id.as_deref(), Some("t9"));

        db.clear_agent_state().unwrap();
        let s = db.get_agent_state().unwrap();
        assert!(!s.is_running);
        assert!(s.current_task_id.is_none());
    }

    #[test]
    fn phase_stats_accumulate() {
        let db = open_db();
        db.record_phase_stats("categorize", 4, 20.0).unwrap();
        db.record_phase_stats("categorize", 6, 10.0).unwrap();
        let stats = db.get_phase_stats("categorize").unwrap().unwrap();
        assert_eq!(stats.items_processed_total, 10);
        assert!((stats.duration_seconds_total - 30.0).abs() < 1e-9);
        assert!((stats.avg_seconds_per_item().unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn eligibility_filter_is_a_conjunction() {
        let db = open_db();
        let mut cached = Item::new("cached", "");
        cached.cache_complete = true;
        db.upsert_item(&cached).unwrap();

        let mut full = Item::new("full", "");
        full.cache_complete = true;
        full.media_processed = true;
        full.main_category = Some("rust".into());
        full.sub_category = Some("async".into());
        full.item_name = Some("x".into());
        full.categories_processed = true;
        db.upsert_item(&full).unwrap();

        let both = db
            .list_eligible(&EligibilityFilter {
                cache_complete: Some(true),
                ..EligibilityFilter::default()
            })
            .unwrap();
        assert_eq!(both.len(), 2);

        let categorized = db
            .list_eligible(&EligibilityFilter {
                cache_complete: Some(true),
                has_categories: Some(true),
                ..EligibilityFilter::default()
            })
            .unwrap();
        assert_eq!(categorized.len(), 1);
        assert_eq!(categorized[0].item_id, "full");

        let unprocessed = db.list_unprocessed_item_ids().unwrap();
        assert_eq!(unprocessed, vec!["cached".to_string(), "full".to_string()]);
    }

    #[test]
    fn kb_dir_collisions_detected() {
        let db = open_db();
        for id in ["x", "y"] {
            let mut item = Item::new(id, "");
            item.kb_dir_path = Some("kb-generated/rust/async/tips".into());
            db.upsert_item(&item).unwrap();
        }
        let collisions = db.list_kb_dir_collisions().unwrap();
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].1.len(), 2);
        assert!(db.kb_dir_path_taken("kb-generated/rust/async/tips", "x").unwrap());
        assert!(!db.kb_dir_path_taken("kb-generated/other", "x").unwrap());
    }

    #[test]
    fn categories_roundtrip() {
        let db = open_db();
        db.ensure_category("rust", "async").unwrap();
        db.ensure_category("rust", "async").unwrap();
        db.ensure_category("rust", "macros").unwrap();
        let map = db.list_categories().unwrap();
        assert_eq!(map.get("rust").unwrap(), &vec!["async".to_string(), "macros".to_string()]);
    }

    #[test]
    fn kb_item_upsert_roundtrip() {
        let db = open_db();
        let row = KbItemRow {
            item_id: "tweet_1".into(),
            content: "# Title".into(),
            main_category: "rust".into(),
            sub_category: "async".into(),
            item_name: "tips".into(),
            source_url: "https://x.com/1".into(),
            kb_dir_path: "kb-generated/rust/async/tips".into(),
            kb_media_paths: vec!["media/tweet_1_0.jpg".into()],
            created_at_source: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        db.upsert_kb_item(&row).unwrap();
        let loaded = db.get_kb_item("tweet_1").unwrap().unwrap();
        assert_eq!(loaded.kb_media_paths, vec!["media/tweet_1_0.jpg"]);

        let mut row2 = row.clone();
        row2.content = "# Updated".into();
        db.upsert_kb_item(&row2).unwrap();
        let loaded = db.get_kb_item("tweet_1").unwrap().unwrap();
        assert_eq!(loaded.content, "# Updated");
    }
}
