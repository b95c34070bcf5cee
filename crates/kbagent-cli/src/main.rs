mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use kbagent_core::categories::DbCategoryStore;
use kbagent_core::config::Config;
use kbagent_core::db::Db;
use kbagent_core::events::{EventBus, EventBusConfig};
use kbagent_core::fetch::HttpSourceFetcher;
use kbagent_core::pipeline::PipelineDeps;
use kbagent_core::prompts::PromptRenderer;
use kbagent_core::tasks::{content_processing_handler, TaskRegistry, KIND_CONTENT_PROCESSING};
use kbagent_core::types::TaskStatus;
use kbagent_core::validator;
use kbagent_inference::factory::create_backend;

#[derive(Parser)]
#[command(name = "kbagent", version, about = "Knowledge-base agent: pipeline worker and admin tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the worker pool, stale-task reconciler, and event bus.
    Run,
    /// Submit a task and print its id.
    SubmitTask {
        /// Task kind, e.g. "content_processing".
        kind: String,
        /// Preferences as a JSON object.
        #[arg(long, default_value = "{}")]
        preferences: String,
        /// Higher runs first; equal priorities run FIFO.
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Report running tasks with age and current phase message.
    ListActiveTasks,
    /// Report tasks whose heartbeat looks stale.
    ListStaleTasks {
        /// Override the stale threshold, in hours.
        #[arg(long = "older-than")]
        older_than_hours: Option<u64>,
    },
    /// Request cancellation of one task.
    CancelTask { task_id: String },
    /// Cancel every pending and running task.
    RevokeAll,
    /// Clear the agent singleton row.
    ResetAgentState,
    /// Print per-status task counts and worker-pool configuration.
    Stats,
    /// Run the consistency validator across the full state store.
    CacheAudit,
}

#[tokio::main]
async fn main() {
    // Misuse (bad flags, unknown subcommand) exits 2 via clap.
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Arc::new(Config::from_env()?);
    let db = Arc::new(Db::open(&config.database_url)?);
    db.migrate()?;

    match cli.command {
        Command::Run => serve(config, db).await,
        Command::SubmitTask { kind, preferences, priority } => {
            init_tracing(None);
            let preferences: serde_json::Value =
                serde_json::from_str(&preferences).context("parse --preferences")?;
            let registry = build_registry(&config, &db)?;
            let task_id = registry.submit_task(&kind, &preferences, priority)?;
            println!("{task_id}");
            Ok(())
        }
        Command::ListActiveTasks => {
            init_tracing(None);
            let now = chrono::Utc::now();
            let tasks = db.list_tasks_by_status(TaskStatus::Running)?;
            if tasks.is_empty() {
                println!("no running tasks");
            }
            for task in tasks {
                let age = task
                    .started_at
                    .map(|t| (now - t).num_seconds())
                    .unwrap_or_default();
                println!(
                    "{}  kind={}  age={}s  phase={}  {}",
                    task.task_id,
                    task.kind,
                    age,
                    task.current_phase.as_deref().unwrap_or("-"),
                    task.current_phase_message
                );
            }
            Ok(())
        }
        Command::ListStaleTasks { older_than_hours } => {
            init_tracing(None);
            let threshold = older_than_hours
                .map(|h| (h * 3600) as i64)
                .unwrap_or(config.stale_task_threshold_s);
            let tasks = db.list_stale_candidates(threshold)?;
            if tasks.is_empty() {
                println!("no stale task candidates (threshold {threshold}s)");
            }
            for task in tasks {
                println!(
                    "{}  status={}  last_heartbeat={}",
                    task.task_id,
                    task.status,
                    task.last_heartbeat_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
            Ok(())
        }
        Command::CancelTask { task_id } => {
            init_tracing(None);
            let registry = build_registry(&config, &db)?;
            if registry.cancel_task(&task_id)? {
                println!("cancellation requested for {task_id}");
                Ok(())
            } else {
                anyhow::bail!("task {task_id} not found or already terminal");
            }
        }
        Command::RevokeAll => {
            init_tracing(None);
            let registry = build_registry(&config, &db)?;
            let revoked = registry.revoke_all()?;
            println!("cancellation requested for {revoked} task(s)");
            Ok(())
        }
        Command::ResetAgentState => {
            init_tracing(None);
            db.clear_agent_state()?;
            println!("agent state cleared");
            Ok(())
        }
        Command::Stats => {
            init_tracing(None);
            for (status, count) in db.count_tasks_by_status()? {
                println!("{status}: {count}");
            }
            println!("workers configured: {}", config.worker_concurrency);
            let agent = db.get_agent_state()?;
            println!(
                "agent running: {} (task: {})",
                agent.is_running,
                agent.current_task_id.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        Command::CacheAudit => {
            init_tracing(None);
            let report = validator::audit_store(&db, &config)?;
            println!("items checked: {}", report.items_checked);
            for violation in &report.violations {
                println!("violation: {violation}");
            }
            for collision in &report.collisions {
                println!(
                    "collision: {} claimed by {}",
                    collision.kb_dir_path,
                    collision.item_ids.join(", ")
                );
            }
            if report.violations.is_empty() && report.collisions.is_empty() {
                println!("no invariant violations found");
            }
            Ok(())
        }
    }
}

/// Long-running worker mode: tracing bridges into the event bus, the task
/// registry runs its pool until ctrl-c.
async fn serve(config: Arc<Config>, db: Arc<Db>) -> Result<()> {
    let events = EventBus::new(EventBusConfig::from_config(&config));
    init_tracing(Some(Arc::clone(&events)));

    let registry = build_registry_with_events(&config, &db, Arc::clone(&events))?;

    info!(
        "kbagent worker starting: backend={}, workers={}, db={}",
        config.inference_backend, config.worker_concurrency, config.database_url
    );

    let runner = {
        let registry = Arc::clone(&registry);
        tokio::spawn(registry.run())
    };

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    registry.shutdown();
    let _ = runner.await;
    Ok(())
}

fn build_registry(config: &Arc<Config>, db: &Arc<Db>) -> Result<Arc<TaskRegistry>> {
    let events = EventBus::new(EventBusConfig::from_config(config));
    build_registry_with_events(config, db, events)
}

fn build_registry_with_events(
    config: &Arc<Config>,
    db: &Arc<Db>,
    events: Arc<EventBus>,
) -> Result<Arc<TaskRegistry>> {
    let backend = create_backend(config)?;
    let renderer = Arc::new(PromptRenderer::new(config.prompts_dir.clone().map(PathBuf::from)));
    let fetcher = Arc::new(HttpSourceFetcher::new(config.post_fetch_endpoint.clone())?);
    let categories = Arc::new(DbCategoryStore::new(Arc::clone(db)));

    let deps = PipelineDeps {
        db: Arc::clone(db),
        events: Arc::clone(&events),
        backend,
        renderer,
        fetcher,
        categories,
        config: Arc::clone(config),
    };

    let registry = TaskRegistry::new(Arc::clone(db), events, Arc::clone(config));
    registry.register_handler(KIND_CONTENT_PROCESSING, content_processing_handler(deps));
    Ok(registry)
}

fn init_tracing(events: Option<Arc<kbagent_core::events::EventBus>>) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kbagent=info,kbagent_core=info,kbagent_inference=info".into());

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    match events {
        Some(bus) => {
            let _ = registry.with(logging::EventBusLayer { bus }).try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
}
