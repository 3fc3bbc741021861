//! Worker process entry point.
//!
//! Connects to the shared store, specializes into one analysis matching
//! `--analyses-pattern` (the one that needs workers most), then claims and
//! runs jobs until a termination cause. Deployments embedding user modules
//! build their own binary on the same scaffolding with a richer
//! [`RunnableRegistry`].

use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use apiary::{HiveConfig, JobStore, RunnableRegistry, Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "apiary-worker", about = "Claim and run jobs for one analysis")]
struct Cli {
    /// Database URL of the shared store
    #[arg(long)]
    url: String,

    /// Glob selecting the analyses this worker may specialize into
    #[arg(long, default_value = "*")]
    analyses_pattern: String,

    /// Reclaim and run one specific job, then exit
    #[arg(long)]
    job_id: Option<i64>,

    /// Jobs claimed per poll (defaults to the analysis's own batch size)
    #[arg(long)]
    batch_size: Option<i64>,

    /// Soft wall-clock limit in seconds, checked between jobs
    #[arg(long)]
    life_span: Option<u64>,

    /// Retire after this many completed jobs
    #[arg(long)]
    job_limit: Option<u64>,

    /// Log verbosity: 0 info, 1 debug, 2+ trace
    #[arg(long, default_value_t = 0)]
    debug: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match cli.debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = HiveConfig::new(cli.url.clone());
    let store = JobStore::connect(&config).await?;
    store.init_schema().await?;
    let registry = RunnableRegistry::with_builtins();

    let worker_config = WorkerConfig {
        batch_size: cli.batch_size,
        job_limit: cli.job_limit,
        life_span: cli.life_span.map(Duration::from_secs),
        claim_grace: config.claim_grace,
        ..WorkerConfig::default()
    };

    if let Some(job_id) = cli.job_id {
        let job = store.fetch_job(job_id).await?;
        let analysis = store.fetch_analysis(job.analysis_id).await?;
        let mut worker = Worker::register(
            store.clone(),
            registry,
            &analysis.logic_name,
            worker_config,
        )
        .await?;
        let ran = worker.run_specific_job(job_id).await?;
        if !ran {
            return Err(anyhow!("job {job_id} was not READY to reclaim"));
        }
        return Ok(());
    }

    // Specialization: refresh the stats, then bind to the matching analysis
    // that wants workers most.
    store.recalculate_all_stats().await?;
    let analyses = store.list_analyses_matching(&cli.analyses_pattern).await?;
    if analyses.is_empty() {
        return Err(anyhow!(
            "no analyses match pattern '{}'",
            cli.analyses_pattern
        ));
    }

    let mut chosen = None;
    let mut best_need = 0;
    for analysis in &analyses {
        let need = store
            .fetch_analysis_stats(analysis.analysis_id)
            .await?
            .map(|stats| stats.num_required_workers)
            .unwrap_or(0);
        if need > best_need {
            best_need = need;
            chosen = Some(analysis);
        }
    }
    let Some(analysis) = chosen else {
        info!(
            pattern = %cli.analyses_pattern,
            "no matching analysis needs workers; nothing to do"
        );
        return Ok(());
    };

    let worker = Worker::register(
        store.clone(),
        registry,
        &analysis.logic_name,
        worker_config,
    )
    .await?;
    let cause = worker.run().await?;
    info!(cause_of_death = %cause, "worker exited");
    Ok(())
}
