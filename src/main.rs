use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use letter_guard::api::{ApiState, api_routes};
use letter_guard::config::ModerationConfig;
use letter_guard::gate::AutoApprovalGate;
use letter_guard::jobs::{
    AdminReset, BatchRunner, JobDispatcher, MaintenanceTicker, spawn_dispatcher,
    spawn_lock_reaper, spawn_maintenance_ticker,
};
use letter_guard::learning::{CachedPatternProvider, LearningEngine, PatternProvider};
use letter_guard::notify::ChannelNotifier;
use letter_guard::pipeline::ModerationPipeline;
use letter_guard::refiner::Refiner;
use letter_guard::safety::SafetyScanner;
use letter_guard::store::{Database, LibSqlBackend};
use letter_guard::workflow::Workflow;

/// Items per page when inferring stages for legacy letters.
const MIGRATION_BATCH: usize = 200;

/// Initialize tracing. Adds a daily rolling file when `LETTER_GUARD_LOG_DIR`
/// is set; the returned guard must live as long as the process.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_target(false);

    let (file, guard) = match std::env::var("LETTER_GUARD_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "letter-guard.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = ModerationConfig::from_env().context("invalid configuration")?;

    eprintln!("✉️  Letter Guard v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}/api", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    let db: Arc<dyn Database> = backend.clone();

    // ── Workflow ─────────────────────────────────────────────────────────
    let workflow = Arc::new(Workflow::new(db.clone(), config.workflow.clone()));
    let migrated = workflow.migrate_legacy(MIGRATION_BATCH).await?;
    if migrated.migrated > 0 || migrated.failed > 0 {
        eprintln!(
            "   Legacy letters: {} staged, {} failed",
            migrated.migrated, migrated.failed
        );
    }
    let recovered = workflow.reset_stale_locks().await?;
    if recovered > 0 {
        eprintln!("   Recovered {recovered} letters stuck in processing");
    }

    // ── Learning ─────────────────────────────────────────────────────────
    let patterns: Arc<dyn PatternProvider> = Arc::new(CachedPatternProvider::new(
        db.clone(),
        config.learning.pattern_cache_ttl,
    ));
    let learning = Arc::new(LearningEngine::new(
        db.clone(),
        patterns.clone(),
        config.learning.clone(),
    ));
    workflow.register_observer(learning.clone());

    // ── Pipeline ─────────────────────────────────────────────────────────
    let (notifier, mut notices) = ChannelNotifier::channel(256);
    let gate = AutoApprovalGate::new(
        db.clone(),
        workflow.clone(),
        Arc::new(notifier),
        backend.clone(),
        config.gate.clone(),
    );
    let refiner = Refiner::new(db.clone(), workflow.clone(), patterns.clone());
    let pipeline = Arc::new(ModerationPipeline::new(
        db.clone(),
        workflow.clone(),
        SafetyScanner::new(&config.scanner),
        gate,
        refiner,
        format!("worker-{}", std::process::id()),
    ));

    // Stand-in for reviewer e-mail delivery.
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            tracing::warn!(
                item_id = %notice.item_id,
                score = notice.score,
                reason = %notice.reason,
                "Letter quarantined for review"
            );
        }
    });

    // ── Jobs ─────────────────────────────────────────────────────────────
    let runner = Arc::new(BatchRunner::new(
        db.clone(),
        backend.clone(),
        backend.clone(),
        pipeline.clone(),
        config.batch.clone(),
    ));
    let reset = Arc::new(AdminReset::new(
        db.clone(),
        backend.clone(),
        backend.clone(),
        workflow.clone(),
        patterns.clone(),
    ));

    let dispatcher = Arc::new(JobDispatcher::new(backend.clone(), runner.clone()));
    let _dispatch_handle = spawn_dispatcher(dispatcher, config.batch.poll_interval);
    eprintln!(
        "   Jobs: batches of {}, polling every {}s",
        config.batch.batch_size,
        config.batch.poll_interval.as_secs()
    );

    let _reaper_handle = spawn_lock_reaper(workflow.clone(), config.workflow.lock_sweep_interval);
    eprintln!(
        "   Locks: stale after {}s, checked every {}s",
        config.workflow.stale_lock_after.as_secs(),
        config.workflow.lock_sweep_interval.as_secs()
    );

    if config.maintenance.enabled {
        let ticker = Arc::new(MaintenanceTicker::new(
            learning.clone(),
            workflow.clone(),
            runner.clone(),
            &config.maintenance,
        )?);
        let _maintenance_handle = spawn_maintenance_ticker(ticker);
        eprintln!("   Maintenance: cron '{}' (UTC)", config.maintenance.schedule);
    } else {
        eprintln!("   Maintenance: disabled");
    }

    match runner.enqueue_backlog().await {
        Ok(tokens) if !tokens.is_empty() => {
            let items: usize = tokens.iter().map(|t| t.item_ids.len()).sum();
            eprintln!("   Backlog: {items} letters queued");
        }
        Ok(_) => {}
        Err(e) => tracing::error!("Failed to enqueue backlog: {e}"),
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api_routes(ApiState {
        db: db.clone(),
        pipeline,
        learning,
        runner,
        reset,
    })
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "Moderation API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
