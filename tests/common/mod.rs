//! Shared helpers for store-backed integration tests.
//!
//! Tests default to a private in-memory SQLite store so they run
//! hermetically; set `APIARY_TEST_DATABASE_URL` to exercise a real server.

#![allow(dead_code)]

use std::time::Duration;

use apiary::{CauseOfDeath, HiveConfig, JobStore, RunnableRegistry, Worker, WorkerConfig};

pub async fn connect_store() -> JobStore {
    let url = std::env::var("APIARY_TEST_DATABASE_URL")
        .unwrap_or_else(|_| "sqlite::memory:".to_string());
    let mut config = HiveConfig::new(url);
    // One connection so an in-memory SQLite store is shared by every query.
    config.pool_size = 1;
    config.deadlock_backoff = Duration::from_millis(10);
    let store = JobStore::connect(&config)
        .await
        .expect("connect to test store");
    store.init_schema().await.expect("initialize schema");
    cleanup(&store).await;
    store
}

/// Empty every table, children before parents.
pub async fn cleanup(store: &JobStore) {
    for table in [
        "accu",
        "job_file",
        "job_message",
        "job",
        "analysis_ctrl_rule",
        "dataflow_rule",
        "analysis_data",
        "worker",
        "analysis_stats",
        "analysis",
    ] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(store.pool())
            .await
            .expect("cleanup table");
    }
}

/// Register a worker on `logic_name` and run it to retirement.
pub async fn run_worker(
    store: &JobStore,
    registry: &RunnableRegistry,
    logic_name: &str,
) -> CauseOfDeath {
    run_worker_with(store, registry, logic_name, WorkerConfig::default()).await
}

pub async fn run_worker_with(
    store: &JobStore,
    registry: &RunnableRegistry,
    logic_name: &str,
    mut config: WorkerConfig,
) -> CauseOfDeath {
    config.claim_grace = Duration::ZERO;
    let worker = Worker::register(store.clone(), registry.clone(), logic_name, config)
        .await
        .expect("register worker");
    worker.run().await.expect("run worker")
}
