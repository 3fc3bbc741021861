//! Garbage collection of jobs held by dead workers.

mod common;

use serde_json::json;
use serial_test::serial;

use apiary::{
    params, AnalysisSpec, BranchCode, CauseOfDeath, DataflowRuleSpec, GarbageCollector, JobStatus,
    NewJob,
};

/// A worker dies holding one RUN job and two untouched claims. The RUN job
/// ages one retry; the claims go back unaged; every job gets a message.
#[tokio::test]
#[serial]
async fn fatality_ages_the_running_job_and_releases_the_rest() {
    let store = common::connect_store().await;
    let analysis = store
        .create_analysis(AnalysisSpec {
            batch_size: 3,
            ..AnalysisSpec::new("crashy", "Anything")
        })
        .await
        .unwrap();

    for n in 0..3 {
        store
            .create_job(NewJob::new(analysis.analysis_id, params!["n" => json!(n)]))
            .await
            .unwrap()
            .unwrap();
    }

    let worker = store
        .register_worker(analysis.analysis_id, "LOCAL", "deadhost", 4242)
        .await
        .unwrap();
    let claimed = store
        .claim_jobs_for_worker(worker.worker_id, analysis.analysis_id, 3)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 3);
    store
        .update_job_status(&claimed[0], JobStatus::Run)
        .await
        .unwrap();

    let outcome = GarbageCollector::new(&store)
        .collect_dead_worker(worker.worker_id, CauseOfDeath::Fatality)
        .await
        .unwrap();
    assert_eq!(outcome.released_unstarted, 2);
    assert_eq!(outcome.aged_to_ready, 1);
    assert_eq!(outcome.passed_on, 0);
    assert_eq!(outcome.failed, 0);

    let ran = store.fetch_job(claimed[0].job_id).await.unwrap();
    assert_eq!(ran.status, JobStatus::Ready);
    assert_eq!(ran.retry_count, 1);
    assert_eq!(ran.worker_id, None);

    for job in &claimed[1..] {
        let job = store.fetch_job(job.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Ready);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.worker_id, None);
    }

    for job in &claimed {
        let messages = store.fetch_job_messages(job.job_id).await.unwrap();
        assert!(
            !messages.is_empty(),
            "job {} lost its message",
            job.job_id
        );
    }

    let worker = store.fetch_worker(worker.worker_id).await.unwrap();
    assert_eq!(worker.cause_of_death, Some(CauseOfDeath::Fatality));
    assert!(worker.died.is_some());
}

/// MEMLIMIT with a `MEMLIMIT` dataflow branch configured: the job is passed
/// on to the himem analysis with the same input, and its funnel slot moves
/// to the new job.
#[tokio::test]
#[serial]
async fn memlimit_passes_the_job_on_to_the_himem_analysis() {
    let store = common::connect_store().await;
    let a_mem = store
        .create_analysis(AnalysisSpec::new("a_mem", "Anything"))
        .await
        .unwrap();
    let a_himem = store
        .create_analysis(AnalysisSpec::new("a_himem", "Anything"))
        .await
        .unwrap();
    let funnel_host = store
        .create_analysis(AnalysisSpec::new("funnel_host", "Anything"))
        .await
        .unwrap();
    store
        .create_dataflow_rule(DataflowRuleSpec {
            from_analysis_id: a_mem.analysis_id,
            branch_code: BranchCode::parse("MEMLIMIT"),
            to_url: "a_himem".to_string(),
            input_id_template: None,
            funnel_group: None,
        })
        .await
        .unwrap();

    let funnel_id = store
        .create_job(NewJob::new(funnel_host.analysis_id, params!["sum" => json!(1)]))
        .await
        .unwrap()
        .unwrap();
    store.increase_semaphore_count(funnel_id, 1).await.unwrap();
    let child_id = store
        .create_job(NewJob {
            analysis_id: a_mem.analysis_id,
            input: params!["x" => json!(1)],
            semaphored_job_id: Some(funnel_id),
            ..NewJob::default()
        })
        .await
        .unwrap()
        .unwrap();

    let worker = store
        .register_worker(a_mem.analysis_id, "LOCAL", "smallhost", 77)
        .await
        .unwrap();
    let claimed = store
        .claim_jobs_for_worker(worker.worker_id, a_mem.analysis_id, 1)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    store
        .update_job_status(&claimed[0], JobStatus::Run)
        .await
        .unwrap();
    assert_eq!(
        store.fetch_job(funnel_id).await.unwrap().semaphore_count,
        1
    );

    let outcome = GarbageCollector::new(&store)
        .collect_dead_worker(worker.worker_id, CauseOfDeath::MemLimit)
        .await
        .unwrap();
    assert_eq!(outcome.passed_on, 1);
    assert_eq!(outcome.aged_to_ready, 0);

    let child = store.fetch_job(child_id).await.unwrap();
    assert_eq!(child.status, JobStatus::PassedOn);
    assert_eq!(child.retry_count, 0);

    // Same input re-flowed; the funnel now waits on the himem job instead.
    let himem_jobs = store
        .fetch_jobs_for_analysis(a_himem.analysis_id)
        .await
        .unwrap();
    assert_eq!(himem_jobs.len(), 1);
    assert_eq!(himem_jobs[0].input_id, child.input_id);
    assert_eq!(himem_jobs[0].semaphored_job_id, Some(funnel_id));
    assert_eq!(himem_jobs[0].status, JobStatus::Ready);
    assert_eq!(
        store.fetch_job(funnel_id).await.unwrap().semaphore_count,
        1,
        "the funnel slot transfers: one increment for the himem job, one \
         decrement for the passed-on child"
    );
}

/// RUNLIMIT on a worker that was completing jobs is not resource
/// overusage: the job is retried in place, not passed on.
#[tokio::test]
#[serial]
async fn runlimit_with_progress_retries_in_place() {
    let store = common::connect_store().await;
    let analysis = store
        .create_analysis(AnalysisSpec::new("slow", "Anything"))
        .await
        .unwrap();
    store
        .create_dataflow_rule(DataflowRuleSpec {
            from_analysis_id: analysis.analysis_id,
            branch_code: BranchCode::parse("RUNLIMIT"),
            to_url: "slow".to_string(),
            input_id_template: None,
            funnel_group: None,
        })
        .await
        .unwrap();

    let job_id = store
        .create_job(NewJob::new(analysis.analysis_id, params!["x" => json!(1)]))
        .await
        .unwrap()
        .unwrap();
    let worker = store
        .register_worker(analysis.analysis_id, "LOCAL", "slowhost", 88)
        .await
        .unwrap();
    let claimed = store
        .claim_jobs_for_worker(worker.worker_id, analysis.analysis_id, 1)
        .await
        .unwrap();
    store
        .update_job_status(&claimed[0], JobStatus::Run)
        .await
        .unwrap();
    // The worker finished something earlier in its life.
    store
        .increment_worker_work_done(worker.worker_id)
        .await
        .unwrap();

    let outcome = GarbageCollector::new(&store)
        .collect_dead_worker(worker.worker_id, CauseOfDeath::RunLimit)
        .await
        .unwrap();
    assert_eq!(outcome.passed_on, 0);
    assert_eq!(outcome.aged_to_ready, 1);

    let job = store.fetch_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.retry_count, 1);
}

/// Without any matching branch, a MEMLIMIT victim is failed outright (no
/// in-place retry for resource overusage).
#[tokio::test]
#[serial]
async fn memlimit_without_branch_fails_the_job() {
    let store = common::connect_store().await;
    let analysis = store
        .create_analysis(AnalysisSpec::new("hungry", "Anything"))
        .await
        .unwrap();
    let job_id = store
        .create_job(NewJob::new(analysis.analysis_id, params!["x" => json!(1)]))
        .await
        .unwrap()
        .unwrap();
    let worker = store
        .register_worker(analysis.analysis_id, "LOCAL", "smallhost", 99)
        .await
        .unwrap();
    let claimed = store
        .claim_jobs_for_worker(worker.worker_id, analysis.analysis_id, 1)
        .await
        .unwrap();
    store
        .update_job_status(&claimed[0], JobStatus::Run)
        .await
        .unwrap();

    let outcome = GarbageCollector::new(&store)
        .collect_dead_worker(worker.worker_id, CauseOfDeath::MemLimit)
        .await
        .unwrap();
    assert_eq!(outcome.failed, 1);

    let job = store.fetch_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}
