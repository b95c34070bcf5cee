//! End-to-end pipeline scenarios over a temp directory with mocked
//! backend and fetcher.

mod support;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use kbagent_core::backend::BackendResult;
use kbagent_core::events::AgentEvent;
use kbagent_core::pipeline::Pipeline;
use kbagent_core::types::{PhaseStatus, Preferences, RunOutcome};

use support::{
    article_json, category_json, post_with_image, post_with_video, MockBackend, MockFetcher,
    TestEnv, CATEGORIZER_MODEL, VISION_MODEL,
};

fn standard_responder() -> impl Fn(&str, &str) -> BackendResult<String> + Send + Sync + 'static {
    |model, _prompt| match model {
        VISION_MODEL => Ok("a terminal screenshot".to_string()),
        CATEGORIZER_MODEL => Ok(category_json("Rust", "Async", "Task Basics")),
        _ => Ok(article_json("Task Basics")),
    }
}

async fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<Vec<AgentEvent>>) -> Vec<AgentEvent> {
    // Let the batcher flush, then drain whatever arrived.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let mut events = Vec::new();
    while let Ok(batch) = rx.try_recv() {
        events.extend(batch);
    }
    events
}

fn completed_phases(events: &[AgentEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::PhaseUpdate { phase_id, status: PhaseStatus::Completed, .. } => {
                Some(phase_id.clone())
            }
            _ => None,
        })
        .collect()
}

// ── Scenario: single-item happy path ─────────────────────────────────────

#[tokio::test]
async fn single_item_happy_path() {
    let env = TestEnv::new();
    let backend = MockBackend::new(standard_responder());
    let fetcher = MockFetcher::new();
    fetcher.put_post("t1", post_with_image("async tasks in rust", "https://cdn/img.jpg"));

    let mut rx = env.events.subscribe();
    let pipeline =
        Pipeline::new(env.deps(backend.clone(), fetcher.clone()).context(CancellationToken::new(), None));
    let report = pipeline.run(&["t1".to_string()], &Preferences::default()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.items_completed, 1);
    assert_eq!(report.items_errored, 0);

    let item = env.db.get_item("t1").unwrap().unwrap();
    assert!(item.all_flags_set());
    assert!(item.processed);
    assert_eq!(item.main_category.as_deref(), Some("rust"));
    assert_eq!(item.sub_category.as_deref(), Some("async"));
    assert_eq!(item.item_name.as_deref(), Some("task_basics"));
    assert_eq!(item.kb_dir_path.as_deref(), Some("kb-generated/rust/async/task_basics"));
    assert_eq!(item.media[0].description.as_deref(), Some("a terminal screenshot"));

    // README on disk, media copied alongside.
    let readme = env.kb_readme("kb-generated/rust/async/task_basics");
    let markdown = std::fs::read_to_string(&readme).unwrap();
    assert!(markdown.starts_with("# Task Basics"));
    assert!(env.dir.path().join("kb-generated/rust/async/task_basics/media/t1_0.jpg").is_file());

    // Downstream row present and matching.
    let row = env.db.get_kb_item("t1").unwrap().unwrap();
    assert_eq!(row.main_category, "rust");
    assert_eq!(row.kb_dir_path, "kb-generated/rust/async/task_basics");
    assert_eq!(row.kb_media_paths, vec!["media/t1_0.jpg"]);

    // Every phase reported completion.
    let events = drain_events(&mut rx).await;
    let completed = completed_phases(&events);
    for phase in ["cache", "media", "categorize", "generate", "db_sync"] {
        assert!(completed.iter().any(|p| p == phase), "phase {phase} missing from {completed:?}");
    }

    // The categorize run registered the category pair.
    let categories = env.db.list_categories().unwrap();
    assert_eq!(categories["rust"], vec!["async"]);
}

// ── Scenario: second run is a no-op ──────────────────────────────────────

#[tokio::test]
async fn second_run_with_same_preferences_does_no_work() {
    let env = TestEnv::new();
    let backend = MockBackend::new(standard_responder());
    let fetcher = MockFetcher::new();
    fetcher.put_post("t1", post_with_image("async tasks", "https://cdn/img.jpg"));

    let pipeline =
        Pipeline::new(env.deps(backend.clone(), fetcher.clone()).context(CancellationToken::new(), None));
    pipeline.run(&["t1".to_string()], &Preferences::default()).await.unwrap();

    let calls_after_first = backend.total_llm_calls();
    let fetches_after_first = fetcher.fetch_calls.load(Ordering::SeqCst);
    let item_before = env.db.get_item("t1").unwrap().unwrap();

    let report = pipeline.run(&["t1".to_string()], &Preferences::default()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(backend.total_llm_calls(), calls_after_first, "idempotent run must not call the backend");
    assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), fetches_after_first);

    let item_after = env.db.get_item("t1").unwrap().unwrap();
    assert!(item_after.all_flags_set());
    assert_eq!(item_before.kb_dir_path, item_after.kb_dir_path);
    assert_eq!(item_before.article_markdown, item_after.article_markdown);
}

// ── Scenario: LLM-only re-run skips cache and media wholesale ────────────

#[tokio::test]
async fn llm_only_rerun_skips_cache_and_media() {
    let env = TestEnv::new();
    let backend = MockBackend::new(standard_responder());
    let fetcher = MockFetcher::new();
    fetcher.put_post("t1", post_with_image("async tasks", "https://cdn/img.jpg"));

    let pipeline =
        Pipeline::new(env.deps(backend.clone(), fetcher.clone()).context(CancellationToken::new(), None));
    pipeline.run(&["t1".to_string()], &Preferences::default()).await.unwrap();

    let fetches = fetcher.fetch_calls.load(Ordering::SeqCst);
    let vision = backend.vision_calls.load(Ordering::SeqCst);
    let readme = env.kb_readme("kb-generated/rust/async/task_basics");
    std::fs::write(&readme, "stale contents").unwrap();

    let mut rx = env.events.subscribe();
    let prefs = Preferences { force_regenerate_articles: true, ..Preferences::default() };
    let report = pipeline.run(&["t1".to_string()], &prefs).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    // Cache and media were reported skipped without touching collaborators.
    assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), fetches);
    assert_eq!(backend.vision_calls.load(Ordering::SeqCst), vision);
    let events = drain_events(&mut rx).await;
    let skipped: Vec<&String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::PhaseUpdate { phase_id, status: PhaseStatus::Skipped, .. } => Some(phase_id),
            _ => None,
        })
        .collect();
    assert!(skipped.iter().any(|p| p.as_str() == "cache"), "cache not skipped: {skipped:?}");
    assert!(skipped.iter().any(|p| p.as_str() == "media"), "media not skipped: {skipped:?}");

    // The README was rewritten and the kb row refreshed.
    let markdown = std::fs::read_to_string(&readme).unwrap();
    assert!(markdown.starts_with("# Task Basics"));
    let item = env.db.get_item("t1").unwrap().unwrap();
    assert!(item.all_flags_set());
}

// ── Scenario: parse failure retries then succeeds ────────────────────────

#[tokio::test]
async fn categorize_retries_after_invalid_json() {
    let env = TestEnv::new();
    let attempts = Arc::new(AtomicU64::new(0));
    let attempts_in_responder = Arc::clone(&attempts);
    let backend = MockBackend::new(move |model, _prompt| match model {
        CATEGORIZER_MODEL => {
            if attempts_in_responder.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok("definitely not json".to_string())
            } else {
                Ok(category_json("DevOps", "CI", "Cache Keys"))
            }
        }
        VISION_MODEL => Ok("img".to_string()),
        _ => Ok(article_json("Cache Keys")),
    });
    let fetcher = MockFetcher::new();
    fetcher.put_text_post("t1", "caching in ci pipelines");

    let pipeline =
        Pipeline::new(env.deps(backend, fetcher).context(CancellationToken::new(), None));
    let report = pipeline.run(&["t1".to_string()], &Preferences::default()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(attempts.load(Ordering::SeqCst), 2, "one failed attempt plus one success");
    let item = env.db.get_item("t1").unwrap().unwrap();
    assert!(item.categories_processed);
    assert!(item.phase_errors.is_empty(), "no error annotation may persist: {:?}", item.phase_errors);
}

// ── Scenario: path collision guard ───────────────────────────────────────

#[tokio::test]
async fn colliding_items_error_in_generate() {
    let env = TestEnv::new();
    // Both items categorize to the identical triple.
    let backend = MockBackend::new(|model, _prompt| match model {
        CATEGORIZER_MODEL => Ok(category_json("Rust", "Async", "Same Name")),
        VISION_MODEL => Ok("img".to_string()),
        _ => Ok(article_json("Same Name")),
    });
    let fetcher = MockFetcher::new();
    fetcher.put_text_post("a", "first post about async");
    fetcher.put_text_post("b", "second post about async");

    let pipeline =
        Pipeline::new(env.deps(backend, fetcher).context(CancellationToken::new(), None));
    let report = pipeline
        .run(&["a".to_string(), "b".to_string()], &Preferences::default())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::CompletedWithErrors);
    assert_eq!(report.items_completed, 1);
    assert_eq!(report.items_errored, 1);

    let a = env.db.get_item("a").unwrap().unwrap();
    let b = env.db.get_item("b").unwrap().unwrap();
    // Batch order decides the winner: "a" claims the path, "b" errors.
    assert!(a.article_created);
    assert!(a.db_synced);
    assert!(!b.article_created);
    assert!(!b.db_synced);
    assert!(b.phase_errors.get("generate").unwrap().contains("collision"));

    // Exactly one README exists.
    assert!(env.kb_readme("kb-generated/rust/async/same_name").is_file());
    let kb_root = env.dir.path().join("kb-generated");
    let dirs: Vec<_> = walk_readmes(&kb_root);
    assert_eq!(dirs.len(), 1, "expected a single README, found {dirs:?}");
}

fn walk_readmes(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().map(|n| n == "README.md").unwrap_or(false) {
                found.push(path);
            }
        }
    }
    found
}

// ── Scenario: cancellation mid-run ───────────────────────────────────────

#[tokio::test]
async fn cancellation_stops_new_items() {
    let env = TestEnv::new();
    let cancel = CancellationToken::new();
    let cancel_in_responder = cancel.clone();
    // The first categorize call flips the token; items not yet started must
    // never begin.
    let backend = MockBackend::new(move |model, _prompt| match model {
        CATEGORIZER_MODEL => {
            cancel_in_responder.cancel();
            Ok(category_json("Rust", "Async", "Only One"))
        }
        VISION_MODEL => Ok("img".to_string()),
        _ => Ok(article_json("Only One")),
    });
    let fetcher = MockFetcher::new();
    let ids: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
    for id in &ids {
        fetcher.put_text_post(id, &format!("post {id}"));
    }

    let pipeline = Pipeline::new(env.deps(backend.clone(), fetcher).context(cancel, None));
    let report = pipeline.run(&ids, &Preferences::default()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Interrupted);
    // At most the in-flight window of categorize calls happened.
    assert!(
        backend.chat_calls.load(Ordering::SeqCst) + backend.generate_calls.load(Ordering::SeqCst)
            <= env.config.num_gpus_available as u64 + 1,
        "no new items may start after cancellation"
    );
    // Nothing moved past categorize, and untouched items carry no errors.
    for id in &ids {
        let item = env.db.get_item(id).unwrap().unwrap();
        assert!(!item.article_created);
        assert!(item.phase_errors.is_empty(), "cancellation must not mark errors: {:?}", item.phase_errors);
    }
}

// ── Boundary: zero-content item fails validation, not the run ────────────

#[tokio::test]
async fn empty_item_is_rejected_at_categorize() {
    let env = TestEnv::new();
    let backend = MockBackend::new(standard_responder());
    let fetcher = MockFetcher::new();
    fetcher.put_text_post("empty", "");

    let pipeline =
        Pipeline::new(env.deps(backend.clone(), fetcher).context(CancellationToken::new(), None));
    let report = pipeline.run(&["empty".to_string()], &Preferences::default()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::CompletedWithErrors);
    let item = env.db.get_item("empty").unwrap().unwrap();
    assert!(!item.categories_processed);
    assert!(item.phase_errors.get("categorize").unwrap().contains("validation"));
    // The backend was never asked to categorize nothing.
    assert_eq!(backend.total_llm_calls(), 0);
}

// ── Boundary: video media is skipped but does not block the phase ────────

#[tokio::test]
async fn video_media_skipped_by_media_phase() {
    let env = TestEnv::new();
    let backend = MockBackend::new(standard_responder());
    let fetcher = MockFetcher::new();
    fetcher.put_post("vid", post_with_video("video demo of tokio console", "https://cdn/demo.mp4"));

    let pipeline =
        Pipeline::new(env.deps(backend.clone(), fetcher).context(CancellationToken::new(), None));
    let report = pipeline.run(&["vid".to_string()], &Preferences::default()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    let item = env.db.get_item("vid").unwrap().unwrap();
    assert!(item.media_processed);
    assert!(item.media[0].is_video);
    assert!(item.media[0].description.is_none(), "video descriptions stay null");
    assert_eq!(backend.vision_calls.load(Ordering::SeqCst), 0);
}

// ── Boundary: persistent empty responses exhaust retries ─────────────────

#[tokio::test]
async fn empty_backend_response_errors_after_retries() {
    let env = TestEnv::new();
    let categorize_calls = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&categorize_calls);
    let backend = MockBackend::new(move |model, _prompt| match model {
        CATEGORIZER_MODEL => {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(String::new())
        }
        VISION_MODEL => Ok("img".to_string()),
        _ => Ok(article_json("unused")),
    });
    let fetcher = MockFetcher::new();
    fetcher.put_text_post("t1", "some content");

    let pipeline =
        Pipeline::new(env.deps(backend, fetcher).context(CancellationToken::new(), None));
    let report = pipeline.run(&["t1".to_string()], &Preferences::default()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::CompletedWithErrors);
    assert_eq!(
        categorize_calls.load(Ordering::SeqCst),
        env.config.categorization_max_retries as u64,
        "each attempt re-samples the model"
    );
    let item = env.db.get_item("t1").unwrap().unwrap();
    assert!(!item.categories_processed);
    assert!(item.phase_errors.contains_key("categorize"));
}

// ── Force flags re-run only their phase ──────────────────────────────────

#[tokio::test]
async fn force_recache_redownloads() {
    let env = TestEnv::new();
    let backend = MockBackend::new(standard_responder());
    let fetcher = MockFetcher::new();
    fetcher.put_post("t1", post_with_image("tokio tips", "https://cdn/pic.jpg"));

    let pipeline =
        Pipeline::new(env.deps(backend.clone(), fetcher.clone()).context(CancellationToken::new(), None));
    pipeline.run(&["t1".to_string()], &Preferences::default()).await.unwrap();
    let fetches = fetcher.fetch_calls.load(Ordering::SeqCst);
    let vision = backend.vision_calls.load(Ordering::SeqCst);

    let prefs = Preferences { force_recache: true, ..Preferences::default() };
    let report = pipeline.run(&["t1".to_string()], &prefs).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), fetches + 1);
    // Media already in the cache is not re-downloaded, and descriptions
    // survive the recache, so the vision model stays idle.
    assert_eq!(backend.vision_calls.load(Ordering::SeqCst), vision);
    let item = env.db.get_item("t1").unwrap().unwrap();
    assert!(item.all_flags_set());
    assert!(item.media[0].description.is_some());
}
