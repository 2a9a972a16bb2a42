use std::sync::Arc;

use anyhow::{Context, Result};
use triggerflow_durable::action::{register_builtin_actions, ActionRegistry, TriggerRegistry};
use triggerflow_durable::{Engine, InMemoryStore, PostgresStore, Store};
use triggerflow_worker::{init_tracing, Bootstrap, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    // Configure via RUST_LOG or LOG_LEVEL (default: triggerflow=info)
    init_tracing();

    tracing::info!("triggerflow-worker starting...");

    let config = WorkerConfig::from_env()?;

    match config.database_url.clone() {
        Some(url) => {
            let store = PostgresStore::connect(&url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Using PostgreSQL store");
            run(Arc::new(store), config).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store (state is lost on exit)");
            run(Arc::new(InMemoryStore::new()), config).await
        }
    }
}

async fn run<S: Store>(store: Arc<S>, config: WorkerConfig) -> Result<()> {
    let actions = Arc::new(ActionRegistry::new());
    register_builtin_actions(&actions);

    let triggers = Arc::new(TriggerRegistry::new());
    if let Some(path) = &config.bootstrap_file {
        Bootstrap::load(path)
            .await?
            .apply(&triggers, &*store)
            .await?;
    }

    tracing::info!(
        actions = ?actions.action_ids(),
        triggers = triggers.triggers().len(),
        dlq_batch_size = config.engine.dlq.batch_size,
        "Starting engine"
    );

    let engine = Engine::new(store, actions, triggers, config.engine.clone());
    let jobs = engine.start_background_jobs();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    jobs.shutdown(config.shutdown_timeout).await;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
