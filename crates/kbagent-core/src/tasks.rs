//! Task registry and worker pool.
//!
//! Submissions create a pending task row plus a queue entry; long-lived
//! workers pop the queue in priority-then-FIFO order and invoke the handler
//! registered for the task's kind with a per-task cancellation token. A
//! heartbeat loop stamps `last_heartbeat_at` while the handler runs, and a
//! periodic reconciler force-fails tasks whose heartbeat went stale with no
//! matching live worker.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{new_task, Db};
use crate::events::{AgentEvent, EventBus};
use crate::pipeline::{Pipeline, PipelineDeps};
use crate::types::{Preferences, RunOutcome, Task, TaskStatus};

/// The built-in task kind that runs the five-phase pipeline.
pub const KIND_CONTENT_PROCESSING: &str = "content_processing";

pub struct TaskContext {
    pub task: Task,
    pub cancel: CancellationToken,
    pub db: Arc<Db>,
    pub events: Arc<EventBus>,
}

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;
pub type TaskHandler = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

pub struct TaskRegistry {
    db: Arc<Db>,
    events: Arc<EventBus>,
    config: Arc<Config>,
    handlers: Mutex<HashMap<String, TaskHandler>>,
    /// Cancellation tokens of tasks currently owned by a worker.
    live: Mutex<HashMap<String, CancellationToken>>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl TaskRegistry {
    pub fn new(db: Arc<Db>, events: Arc<EventBus>, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            db,
            events,
            config,
            handlers: Mutex::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn register_handler(&self, kind: impl Into<String>, handler: TaskHandler) {
        let kind = kind.into();
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(kind, handler);
        }
    }

    fn handler_for(&self, kind: &str) -> Option<TaskHandler> {
        self.handlers.lock().ok().and_then(|h| h.get(kind).cloned())
    }

    // ── Submission / cancellation ─────────────────────────────────────────

    /// Validate and persist a new task, then enqueue it. Unknown kinds and
    /// unknown preference keys are submission errors.
    pub fn submit_task(&self, kind: &str, preferences: &serde_json::Value, priority: i64) -> Result<String> {
        if self.handler_for(kind).is_none() {
            bail!("unknown task kind '{kind}'");
        }
        let prefs = Preferences::from_json(preferences)
            .with_context(|| "invalid preferences")?;

        let task_id = generate_task_id();
        self.db.insert_task(&new_task(task_id.clone(), kind, prefs))?;
        self.db.enqueue_task(&task_id, priority)?;
        self.events.emit(AgentEvent::TaskStatusUpdate {
            task_id: task_id.clone(),
            status: TaskStatus::Pending,
            message: None,
            progress_percent: Some(0),
        });
        info!("submitted task {task_id} kind={kind} priority={priority}");
        self.notify.notify_one();
        Ok(task_id)
    }

    /// Request cancellation. A running task's handler observes the token at
    /// its next suspension point; a pending task is canceled directly. The
    /// persisted flag lets a worker in another process pick the request up
    /// through its heartbeat loop.
    pub fn cancel_task(&self, task_id: &str) -> Result<bool> {
        let flagged = self.db.request_task_cancel(task_id)?;
        if let Ok(live) = self.live.lock() {
            if let Some(token) = live.get(task_id) {
                token.cancel();
                info!("cancellation requested for running task {task_id}");
                return Ok(true);
            }
        }
        let Some(task) = self.db.get_task(task_id)? else {
            return Ok(false);
        };
        if task.status == TaskStatus::Pending {
            self.db.remove_queue_entries(task_id)?;
            self.db.finish_task(task_id, TaskStatus::Canceled, Some("canceled before start"), None)?;
            self.emit_status(task_id, TaskStatus::Canceled, None);
            info!("canceled pending task {task_id}");
            return Ok(true);
        }
        Ok(flagged)
    }

    /// Cancel every pending and running task. Returns how many were hit.
    pub fn revoke_all(&self) -> Result<u64> {
        let mut revoked = 0u64;
        for status in [TaskStatus::Running, TaskStatus::Pending] {
            for task in self.db.list_tasks_by_status(status)? {
                if self.cancel_task(&task.task_id)? {
                    revoked += 1;
                }
            }
        }
        Ok(revoked)
    }

    pub fn live_task_ids(&self) -> Vec<String> {
        self.live
            .lock()
            .map(|l| l.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn worker_concurrency(&self) -> usize {
        self.config.worker_concurrency
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    // ── Worker pool ───────────────────────────────────────────────────────

    /// Start the worker pool and the stale-task reconciler; returns when
    /// shutdown is requested.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut workers = Vec::new();
        for worker_id in 0..self.config.worker_concurrency {
            let registry = Arc::clone(&self);
            workers.push(tokio::spawn(registry.worker_loop(worker_id)));
        }

        let reconciler = {
            let registry = Arc::clone(&self);
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(registry.config.reconcile_interval_s.max(1)));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = registry.shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = registry.reconcile_stale() {
                                warn!("stale-task reconciler: {e:#}");
                            }
                        }
                    }
                }
            })
        };

        self.shutdown.cancelled().await;
        for worker in workers {
            let _ = worker.await;
        }
        reconciler.abort();
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        info!("worker {worker_id} started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.db.dequeue_next() {
                Ok(Some(task_id)) => match self.db.get_task(&task_id) {
                    Ok(Some(task)) => Arc::clone(&self).execute(task).await,
                    Ok(None) => warn!("queue entry for unknown task {task_id}"),
                    Err(e) => error!("worker {worker_id} get_task {task_id}: {e:#}"),
                },
                Ok(None) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!("worker {worker_id} dequeue: {e:#}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("worker {worker_id} stopped");
    }

    /// Run one task through its lifecycle hooks.
    async fn execute(self: Arc<Self>, task: Task) {
        let task_id = task.task_id.clone();
        let cancel = CancellationToken::new();
        if let Ok(mut live) = self.live.lock() {
            live.insert(task_id.clone(), cancel.clone());
        }

        // prerun: task row and agent singleton move together.
        if let Err(e) = self.db.set_task_running(&task_id) {
            error!("set_task_running {task_id}: {e:#}");
        }
        if let Err(e) = self.db.set_agent_running(&task_id, &format!("task {task_id} started")) {
            warn!("set_agent_running {task_id}: {e:#}");
        }
        self.emit_status(&task_id, TaskStatus::Running, None);

        // Heartbeat on the handler's behalf until it returns; the same loop
        // observes externally-requested cancellation.
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = {
            let db = Arc::clone(&self.db);
            let task_id = task_id.clone();
            let stop = heartbeat_stop.clone();
            let cancel = cancel.clone();
            let interval = Duration::from_secs(self.config.heartbeat_interval_s.max(1));
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = db.heartbeat_task(&task_id) {
                                warn!("heartbeat {task_id}: {e:#}");
                            }
                            if db.is_cancel_requested(&task_id).unwrap_or(false) {
                                cancel.cancel();
                            }
                        }
                    }
                }
            })
        };

        let result = match self.handler_for(&task.kind) {
            Some(handler) => {
                let ctx = TaskContext {
                    task: task.clone(),
                    cancel: cancel.clone(),
                    db: Arc::clone(&self.db),
                    events: Arc::clone(&self.events),
                };
                handler(ctx).await
            }
            None => Err(anyhow::anyhow!("no handler registered for kind '{}'", task.kind)),
        };

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        // postrun / failure: terminal state, then the singleton resets.
        if cancel.is_cancelled() {
            let summary = result.ok();
            let _ = self.db.finish_task(&task_id, TaskStatus::Canceled, None, summary.as_ref());
            self.emit_status(&task_id, TaskStatus::Canceled, None);
            info!("task {task_id} canceled");
        } else {
            match result {
                Ok(summary) => {
                    let _ =
                        self.db.finish_task(&task_id, TaskStatus::Succeeded, None, Some(&summary));
                    self.emit_status(&task_id, TaskStatus::Succeeded, None);
                    info!("task {task_id} succeeded");
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    let _ = self.db.finish_task(&task_id, TaskStatus::Failed, Some(&message), None);
                    self.emit_status(&task_id, TaskStatus::Failed, Some(message.clone()));
                    error!("task {task_id} failed: {message}");
                }
            }
        }
        if let Err(e) = self.db.clear_agent_state() {
            warn!("clear_agent_state after {task_id}: {e:#}");
        }
        if let Ok(mut live) = self.live.lock() {
            live.remove(&task_id);
        }
    }

    // ── Stale-task reconciliation ─────────────────────────────────────────

    /// Force-fail tasks whose heartbeat went stale with no live worker, and
    /// reset the agent singleton if it points at one of them. Returns the
    /// ids that were failed.
    pub fn reconcile_stale(&self) -> Result<Vec<String>> {
        let live: Vec<String> = self.live_task_ids();
        let mut failed = Vec::new();
        for task in self.db.list_stale_candidates(self.config.stale_task_threshold_s)? {
            if live.contains(&task.task_id) {
                continue;
            }
            let message = format!(
                "stale task: no heartbeat for over {}s and no live worker",
                self.config.stale_task_threshold_s
            );
            self.db.remove_queue_entries(&task.task_id)?;
            if self.db.finish_task(&task.task_id, TaskStatus::Failed, Some(&message), None)? {
                warn!("reconciler failed stale task {}", task.task_id);
                self.emit_status(&task.task_id, TaskStatus::Failed, Some(message));
                let agent = self.db.get_agent_state()?;
                if agent.current_task_id.as_deref() == Some(task.task_id.as_str()) {
                    self.db.clear_agent_state()?;
                }
                failed.push(task.task_id);
            }
        }
        Ok(failed)
    }

    fn emit_status(&self, task_id: &str, status: TaskStatus, message: Option<String>) {
        self.events.emit(AgentEvent::TaskStatusUpdate {
            task_id: task_id.to_string(),
            status,
            message,
            progress_percent: None,
        });
    }
}

fn generate_task_id() -> String {
    let nonce: u32 = rand::thread_rng().gen();
    format!("task_{}_{nonce:08x}", chrono::Utc::now().timestamp())
}

// ── Built-in handler ─────────────────────────────────────────────────────

/// Handler for the content-processing kind: pulls the unprocessed work list
/// from the state store and drives the pipeline with the task's preferences.
pub fn content_processing_handler(deps: PipelineDeps) -> TaskHandler {
    Arc::new(move |ctx: TaskContext| {
        let deps = deps.clone();
        Box::pin(async move {
            let prefs = ctx.task.preferences.clone();
            if prefs.skip_process_content {
                return Ok(serde_json::json!({
                    "outcome": "completed",
                    "skipped": "content processing skipped by preferences",
                }));
            }
            let item_ids = ctx.db.list_unprocessed_item_ids()?;
            let pipeline =
                Pipeline::new(deps.context(ctx.cancel.clone(), Some(ctx.task.task_id.clone())));
            let report = pipeline.run(&item_ids, &prefs).await?;

            // The run succeeds if at least one item completed all phases;
            // an all-error batch is a task failure.
            if report.outcome != RunOutcome::Interrupted
                && report.total_items > 0
                && report.items_completed == 0
                && report.items_errored > 0
            {
                bail!("no items completed: {} of {} errored", report.items_errored, report.total_items);
            }
            Ok(serde_json::to_value(&report)?)
        })
    })
}
