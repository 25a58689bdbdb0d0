//! Stageflow automation daemon
//!
//! Runs the automation tick on a fixed interval. With `DATABASE_URL` (or
//! `DB_HOST`) set it works against Postgres, otherwise against an in-memory
//! store seeded with the main pipelines of `STAGEFLOW_SCOPE`.

use stageflow::automation::collaborators::{LogNotifier, LogTaskSink, RefDirectory, StaticRoster};
use stageflow::config::{AutomationConfig, Settings};
use stageflow::store::{MemoryStore, PgStore, Store};
use stageflow::{db, AutomationEngine, Clock, Collaborators, PipelineEngine, SystemClock};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("🚀 Starting Stageflow automation daemon...");

    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let recipients = settings.automation.reminder_recipients.clone();
    if recipients.is_empty() {
        warn!("⚠️  AUTOMATION_REMINDER_RECIPIENTS is empty, stage reminders will not be sent");
    } else {
        info!("📬 {} reminder recipient(s) configured", recipients.len());
    }
    let collaborators = Collaborators {
        notifier: Arc::new(LogNotifier),
        tasks: Arc::new(LogTaskSink),
        items: Arc::new(RefDirectory),
        roster: Arc::new(StaticRoster(recipients)),
    };

    match &settings.database {
        Some(database) => {
            let pool = db::create_pool(database).await?;
            let store = PgStore::new(pool);
            store.migrate().await?;
            run(store, clock, collaborators, settings.automation).await
        }
        None => {
            warn!("⚠️  No database configured, running against an in-memory store");
            let store = MemoryStore::new();
            let scope = std::env::var("STAGEFLOW_SCOPE").unwrap_or_else(|_| "default".to_string());
            PipelineEngine::new(store.clone(), clock.clone())
                .ensure_main_pipelines(&scope)
                .await?;
            run(store, clock, collaborators, settings.automation).await
        }
    }
}

/// Tick loop; returns after one tick in run-once mode or on shutdown
async fn run<S: Store>(
    store: S,
    clock: Arc<dyn Clock>,
    collaborators: Collaborators,
    config: AutomationConfig,
) -> anyhow::Result<()> {
    let dry_run = config.dry_run;
    let run_once = config.run_once;
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let engine = AutomationEngine::new(store, clock, collaborators, config);

    if run_once {
        let report = engine.run_tick(dry_run).await?;
        info!("📊 {}", serde_json::to_string(&report)?);
        return Ok(());
    }

    info!(
        "⏰ Scheduling automation every {:?} (dry run: {})",
        interval.period(),
        dry_run
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = engine.run_tick(dry_run).await {
                    error!("❌ Automation tick failed [{}]: {}", e.code(), e);
                }
            }
            _ = &mut shutdown => break,
        }
    }

    info!("👋 Daemon shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stageflow=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
