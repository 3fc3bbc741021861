//! Deduplication, oversized-input offload, and semaphore accounting under
//! racing creators.

mod common;

use serde_json::json;
use serial_test::serial;

use apiary::{params, AnalysisSpec, JobStatus, NewJob, ParamSet, EXT_INPUT_PREFIX};

/// Two creators race the same `(input_id, analysis_id)` into the same
/// funnel, each having pre-incremented the counter speculatively. Exactly
/// one insert survives and the loser's increment is cancelled.
#[tokio::test]
#[serial]
async fn racing_creators_net_one_job_and_one_increment() {
    let store = common::connect_store().await;
    let fan = store
        .create_analysis(AnalysisSpec::new("fan", "Anything"))
        .await
        .unwrap();
    let funnel_host = store
        .create_analysis(AnalysisSpec::new("funnel_host", "Anything"))
        .await
        .unwrap();

    let funnel_id = store
        .create_job(NewJob::new(funnel_host.analysis_id, params!["k" => json!(0)]))
        .await
        .unwrap()
        .unwrap();

    let input = params!["piece" => json!(7)];
    let mut created = Vec::new();
    for _ in 0..2 {
        // Speculative increment, then the guarded insert.
        store.increase_semaphore_count(funnel_id, 1).await.unwrap();
        let result = store
            .create_job(NewJob {
                analysis_id: fan.analysis_id,
                input: input.clone(),
                semaphored_job_id: Some(funnel_id),
                ..NewJob::default()
            })
            .await
            .unwrap();
        created.push(result);
    }

    assert!(created[0].is_some());
    assert!(created[1].is_none(), "the second insert must collide");

    let jobs = store.fetch_jobs_for_analysis(fan.analysis_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].semaphored_job_id, Some(funnel_id));

    let funnel = store.fetch_job(funnel_id).await.unwrap();
    assert_eq!(
        funnel.semaphore_count, 1,
        "loser's speculative increment must be cancelled"
    );
}

/// Key order never defeats the dedup key: stringification is canonical.
#[tokio::test]
#[serial]
async fn dedup_is_content_based_not_order_based() {
    let store = common::connect_store().await;
    let analysis = store
        .create_analysis(AnalysisSpec::new("orderly", "Anything"))
        .await
        .unwrap();

    let mut forward = ParamSet::new();
    forward.insert("a", json!(1));
    forward.insert("b", json!(2));
    let mut backward = ParamSet::new();
    backward.insert("b", json!(2));
    backward.insert("a", json!(1));

    let first = store
        .create_job(NewJob::new(analysis.analysis_id, forward))
        .await
        .unwrap();
    let second = store
        .create_job(NewJob::new(analysis.analysis_id, backward))
        .await
        .unwrap();
    assert!(first.is_some());
    assert_eq!(second, None);
}

/// Inputs past the column limit ride the `analysis_data` side table and
/// come back byte-identical, still deduplicating by content.
#[tokio::test]
#[serial]
async fn oversized_inputs_offload_and_roundtrip() {
    let store = common::connect_store().await;
    let analysis = store
        .create_analysis(AnalysisSpec::new("bulky", "Anything"))
        .await
        .unwrap();

    let blob = "x".repeat(400);
    let input = params!["payload" => json!(blob)];
    let job_id = store
        .create_job(NewJob::new(analysis.analysis_id, input.clone()))
        .await
        .unwrap()
        .unwrap();

    let job = store.fetch_job(job_id).await.unwrap();
    assert!(
        job.input_id.starts_with(EXT_INPUT_PREFIX),
        "oversized input must be referenced by token, got '{}'",
        job.input_id
    );

    let roundtripped = store.job_input_params(&job).await.unwrap();
    assert_eq!(roundtripped, input);

    // Same content, same token, same dedup outcome.
    let again = store
        .create_job(NewJob::new(analysis.analysis_id, input.clone()))
        .await
        .unwrap();
    assert_eq!(again, None);

    let data_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analysis_data")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(data_rows, 1, "store-if-needed must not duplicate content");

    let found = store
        .lookup_job_by_input(analysis.analysis_id, &input)
        .await
        .unwrap();
    assert_eq!(found.map(|j| j.job_id), Some(job_id));
}

/// The exact original string survives the offload round-trip.
#[tokio::test]
#[serial]
async fn analysis_data_returns_the_exact_string() {
    let store = common::connect_store().await;
    let content = format!("{{\"k\":\"{}\"}}", "0123456789".repeat(40));
    let id = store.store_analysis_data_if_needed(&content).await.unwrap();
    let id_again = store.store_analysis_data_if_needed(&content).await.unwrap();
    assert_eq!(id, id_again);
    assert_eq!(store.fetch_analysis_data(id).await.unwrap(), content);
}

/// DONE records the observability fields and releases the funnel slot in
/// the same operation.
#[tokio::test]
#[serial]
async fn done_updates_are_atomic_with_the_semaphore() {
    let store = common::connect_store().await;
    let fan = store
        .create_analysis(AnalysisSpec::new("fan2", "Anything"))
        .await
        .unwrap();
    let funnel_host = store
        .create_analysis(AnalysisSpec::new("funnel_host2", "Anything"))
        .await
        .unwrap();

    let funnel_id = store
        .create_job(NewJob::new(funnel_host.analysis_id, params!["k" => json!(1)]))
        .await
        .unwrap()
        .unwrap();
    store.increase_semaphore_count(funnel_id, 1).await.unwrap();
    let child_id = store
        .create_job(NewJob {
            analysis_id: fan.analysis_id,
            input: params!["p" => json!(1)],
            semaphored_job_id: Some(funnel_id),
            ..NewJob::default()
        })
        .await
        .unwrap()
        .unwrap();

    let worker = store
        .register_worker(fan.analysis_id, "LOCAL", "host", 1)
        .await
        .unwrap();
    let claimed = store
        .claim_jobs_for_worker(worker.worker_id, fan.analysis_id, 1)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let mut job = claimed.into_iter().next().unwrap();
    job.runtime_msec = Some(12);
    job.query_count = Some(3);
    store.update_job_status(&job, JobStatus::Done).await.unwrap();

    let job = store.fetch_job(child_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.completed.is_some());
    assert_eq!(job.runtime_msec, Some(12));
    assert_eq!(job.query_count, Some(3));
    assert_eq!(
        store.fetch_job(funnel_id).await.unwrap().semaphore_count,
        0
    );
}

/// `job_file` rows replace on `(job_id, retry)`: re-running an attempt
/// overwrites its paths instead of accumulating rows.
#[tokio::test]
#[serial]
async fn out_files_replace_per_attempt() {
    let store = common::connect_store().await;
    let analysis = store
        .create_analysis(AnalysisSpec::new("noisy", "Anything"))
        .await
        .unwrap();
    let job_id = store
        .create_job(NewJob::new(analysis.analysis_id, params!["p" => json!(9)]))
        .await
        .unwrap()
        .unwrap();

    store
        .store_out_files(job_id, 0, 1, Some("/tmp/first.out"), None)
        .await
        .unwrap();
    store
        .store_out_files(job_id, 0, 1, Some("/tmp/second.out"), Some("/tmp/second.err"))
        .await
        .unwrap();
    store
        .store_out_files(job_id, 1, 2, Some("/tmp/retry.out"), None)
        .await
        .unwrap();

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_file")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(rows, 2, "one row per (job_id, retry)");

    let select = format!(
        "SELECT stdout_file FROM job_file WHERE job_id = {} AND retry = 0",
        store.dialect().ph(1)
    );
    let stdout: String = sqlx::query_scalar(&select)
        .bind(job_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(stdout, "/tmp/second.out");
}

/// A fan child that fails permanently also releases its funnel: the funnel
/// must not wait forever on a job that will never complete.
#[tokio::test]
#[serial]
async fn permanent_failure_releases_the_funnel() {
    let store = common::connect_store().await;
    let fan = store
        .create_analysis(AnalysisSpec::new("fan3", "Anything"))
        .await
        .unwrap();
    let funnel_host = store
        .create_analysis(AnalysisSpec::new("funnel_host3", "Anything"))
        .await
        .unwrap();

    let funnel_id = store
        .create_job(NewJob::new(funnel_host.analysis_id, params!["k" => json!(2)]))
        .await
        .unwrap()
        .unwrap();
    store.increase_semaphore_count(funnel_id, 1).await.unwrap();
    let child_id = store
        .create_job(NewJob {
            analysis_id: fan.analysis_id,
            input: params!["p" => json!(2)],
            semaphored_job_id: Some(funnel_id),
            ..NewJob::default()
        })
        .await
        .unwrap()
        .unwrap();

    let landed = store.release_and_age(child_id, 0, false).await.unwrap();
    assert_eq!(landed, JobStatus::Failed);
    assert_eq!(
        store.fetch_job(funnel_id).await.unwrap().semaphore_count,
        0
    );
}
