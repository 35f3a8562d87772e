// This is the entry point of the content moderation service.
//
// **Architecture Overview:**
// - `core/` = Business logic (storage-, vendor- and transport-agnostic)
// - `infra/` = Implementations of core traits (SQLite, Gemini, HTTP, Slack...)
// - `intake/` = The request front end (JSON lines over stdin/stdout)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Start the queue workers and the recovery sweep
// 4. Serve intake requests until Ctrl-C

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;
#[path = "intake/intake_layer.rs"]
mod intake;

mod config;

use crate::config::{AppConfig, Backend, NotifyChannel, TextClassifier};
use crate::core::moderation::{
    run_recovery_loop, Classifier, ClassifierRouter, JobQueue, ModerationConfig,
    ModerationService, ModerationStore, ModerationWorker, NotificationGate,
    NotificationTransport, RetryPolicy, WorkerConfig,
};
use crate::infra::ai::{GeminiClassifier, OpenRouterClassifier};
use crate::infra::images::HttpImageFetcher;
use crate::infra::moderation::{
    connect_sqlite, InMemoryJobQueue, InMemoryModerationStore, SqliteJobQueue,
    SqliteModerationStore,
};
use crate::infra::notifications::{BrevoEmailTransport, LogTransport, SlackWebhookTransport};
use anyhow::Context;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries intake responses.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;

    // Keep runtime databases in a dedicated folder so the repo root stays tidy.
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.data_dir))?;

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // This is the "composition root" where we wire everything together.

    let needs_sqlite =
        config.store_backend == Backend::Sqlite || config.queue_backend == Backend::Sqlite;
    let pool = if needs_sqlite {
        Some(
            connect_sqlite(&config.database_path())
                .await
                .context("Failed to open moderation database")?,
        )
    } else {
        None
    };

    let store: Arc<dyn ModerationStore> = match (&pool, config.store_backend) {
        (Some(pool), Backend::Sqlite) => {
            let store = SqliteModerationStore::new(pool.clone());
            store.migrate().await.context("Failed to migrate moderation store")?;
            Arc::new(store)
        }
        _ => {
            tracing::warn!("Using in-memory store; submissions are lost on restart");
            Arc::new(InMemoryModerationStore::new())
        }
    };

    let queue: Arc<dyn JobQueue> = match (&pool, config.queue_backend) {
        (Some(pool), Backend::Sqlite) => {
            let queue = SqliteJobQueue::new(pool.clone(), config.job_lease);
            queue.migrate().await.context("Failed to migrate job queue")?;
            Arc::new(queue)
        }
        _ => Arc::new(InMemoryJobQueue::new(config.job_lease)),
    };

    // Classifiers: images always go to Gemini, text to the configured backend.
    let image_classifier: Arc<dyn Classifier> = Arc::new(GeminiClassifier::new(
        config.gemini_api_key.clone(),
        config.gemini_image_model.clone(),
    ));
    let text_classifier: Arc<dyn Classifier> = match config.text_classifier {
        TextClassifier::Gemini => Arc::new(GeminiClassifier::new(
            config.gemini_api_key.clone(),
            config.gemini_text_model.clone(),
        )),
        TextClassifier::OpenRouter => Arc::new(OpenRouterClassifier::new(
            config
                .openrouter_api_key
                .clone()
                .context("Missing OPENROUTER_API_KEY environment variable!")?,
            config.openrouter_model.clone(),
        )),
    };
    let classifier = Arc::new(ClassifierRouter::new(text_classifier, image_classifier));

    let fetcher = Arc::new(HttpImageFetcher::new(
        config.download_timeout,
        config.max_image_bytes,
    )?);

    let transport: Arc<dyn NotificationTransport> = match &config.notify {
        NotifyChannel::Log => Arc::new(LogTransport),
        NotifyChannel::Slack { webhook_url } => {
            Arc::new(SlackWebhookTransport::new(webhook_url.clone()))
        }
        NotifyChannel::Email { api_key, sender } => {
            Arc::new(BrevoEmailTransport::new(api_key.clone(), sender.clone()))
        }
    };
    let gate = NotificationGate::new(store.clone(), transport);

    let service = Arc::new(ModerationService::new(
        store,
        queue.clone(),
        classifier,
        fetcher,
        gate,
        ModerationConfig {
            classify_timeout: config.classify_timeout,
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                base_delay: config.retry_base_delay,
            },
            stale_after: config.stale_processing,
        },
    ));

    // ========================================================================
    // BACKGROUND TASKS
    // ========================================================================

    if config.job_lease <= config.worst_case_job_duration() {
        tracing::warn!(
            "JOB_LEASE_SECS ({:?}) is shorter than the slowest possible job ({:?}); \
             a worker that stops renewing its lease mid-job will see the job redelivered",
            config.job_lease,
            config.worst_case_job_duration()
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_config = WorkerConfig {
        recovery_interval: config.recovery_interval,
        lease_renewal: config.lease_renewal(),
        ..WorkerConfig::default()
    };

    let mut handles = Vec::new();
    for i in 0..config.worker_count {
        let worker = ModerationWorker::new(
            format!("worker-{}", i),
            service.clone(),
            queue.clone(),
            worker_config.clone(),
        );
        handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }
    // The first tick fires immediately, so this also sweeps once at startup.
    handles.push(tokio::spawn(run_recovery_loop(
        service.clone(),
        worker_config.recovery_interval,
        shutdown_rx.clone(),
    )));

    tracing::info!(
        "Moderation service ready: {} worker(s), store={:?}, queue={:?}",
        config.worker_count,
        config.store_backend,
        config.queue_backend
    );

    // Intake runs until stdin closes; queued work keeps draining after that.
    let intake = tokio::spawn(intake::run(
        service,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    match intake.await {
        Ok(Err(e)) => tracing::error!("Intake stopped with error: {}", e),
        Err(e) => tracing::error!("Intake task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Background task panicked: {}", e);
        }
    }

    Ok(())
}
