//! The job factory end-to-end: batch sources expanded into fanned jobs.

mod common;

use std::collections::HashSet;
use std::io::Write;

use serde_json::json;
use serial_test::serial;

use apiary::{
    params, AnalysisSpec, BranchCode, CauseOfDeath, DataflowRuleSpec, JobStore, NewJob, ParamSet,
    RunnableRegistry,
};

async fn factory_pipeline(store: &JobStore, factory_params: ParamSet) -> (i64, i64) {
    let expand = store
        .create_analysis(AnalysisSpec {
            parameters: factory_params,
            ..AnalysisSpec::new("expand", "JobFactory")
        })
        .await
        .unwrap();
    let consume = store
        .create_analysis(AnalysisSpec::new("consume", "Consume"))
        .await
        .unwrap();
    store
        .create_dataflow_rule(DataflowRuleSpec {
            from_analysis_id: expand.analysis_id,
            branch_code: BranchCode::FAN,
            to_url: "consume".to_string(),
            input_id_template: None,
            funnel_group: None,
        })
        .await
        .unwrap();
    store
        .create_job(NewJob::new(expand.analysis_id, ParamSet::new()))
        .await
        .unwrap()
        .unwrap();
    (expand.analysis_id, consume.analysis_id)
}

async fn run_factory(store: &JobStore) -> CauseOfDeath {
    let registry = RunnableRegistry::with_builtins();
    common::run_worker(store, &registry, "expand").await
}

#[tokio::test]
#[serial]
async fn inputlist_rows_become_named_jobs() {
    let store = common::connect_store().await;
    let (_, consume_id) = factory_pipeline(
        &store,
        params![
            "inputlist" => json!([["chr1", 100], ["chr2", 200], ["chr3", 300]]),
            "column_names" => json!(["name", "length"]),
        ],
    )
    .await;

    assert_eq!(run_factory(&store).await, CauseOfDeath::NoWork);

    let jobs = store.fetch_jobs_for_analysis(consume_id).await.unwrap();
    assert_eq!(jobs.len(), 3);
    let mut names = HashSet::new();
    for job in &jobs {
        let params = store.job_input_params(job).await.unwrap();
        names.insert(params.get_str("name").unwrap());
        assert!(params.get_i64("length").is_some());
    }
    assert_eq!(names.len(), 3);
}

#[tokio::test]
#[serial]
async fn scalar_inputlist_uses_positional_params() {
    let store = common::connect_store().await;
    let (_, consume_id) = factory_pipeline(
        &store,
        params!["inputlist" => json!(["alpha", "beta"])],
    )
    .await;

    run_factory(&store).await;

    let jobs = store.fetch_jobs_for_analysis(consume_id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    let mut zeroth = HashSet::new();
    for job in &jobs {
        let params = store.job_input_params(job).await.unwrap();
        zeroth.insert(params.get_str("_0").unwrap());
        assert!(params.get("_").is_some());
    }
    assert_eq!(
        zeroth,
        HashSet::from(["alpha".to_string(), "beta".to_string()])
    );
}

#[tokio::test]
#[serial]
async fn inputfile_with_header_names_its_columns() {
    let store = common::connect_store().await;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "seq\tlen").unwrap();
    writeln!(file, "chrX\t1000").unwrap();
    writeln!(file, "chrY\t500").unwrap();
    file.flush().unwrap();

    let (_, consume_id) = factory_pipeline(
        &store,
        params![
            "inputfile" => json!(file.path().to_str().unwrap()),
            "delimiter" => json!("\t"),
            "column_names" => json!(true),
        ],
    )
    .await;

    run_factory(&store).await;

    let jobs = store.fetch_jobs_for_analysis(consume_id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    let mut seqs = HashSet::new();
    for job in &jobs {
        let params = store.job_input_params(job).await.unwrap();
        seqs.insert(params.get_str("seq").unwrap());
    }
    assert_eq!(seqs, HashSet::from(["chrX".to_string(), "chrY".to_string()]));
}

#[tokio::test]
#[serial]
async fn inputquery_takes_column_names_from_metadata() {
    let store = common::connect_store().await;
    let (_, consume_id) = factory_pipeline(
        &store,
        params![
            "inputquery" =>
                json!("SELECT logic_name AS target FROM analysis ORDER BY analysis_id"),
        ],
    )
    .await;

    run_factory(&store).await;

    let jobs = store.fetch_jobs_for_analysis(consume_id).await.unwrap();
    assert_eq!(jobs.len(), 2, "one job per analysis row");
    let mut targets = HashSet::new();
    for job in &jobs {
        let params = store.job_input_params(job).await.unwrap();
        targets.insert(params.get_str("target").unwrap());
    }
    assert_eq!(
        targets,
        HashSet::from(["expand".to_string(), "consume".to_string()])
    );
}

#[tokio::test]
#[serial]
async fn inputcmd_output_is_treated_like_a_file() {
    let store = common::connect_store().await;
    let (_, consume_id) = factory_pipeline(
        &store,
        params!["inputcmd" => json!("printf 'one\\ntwo\\n'")],
    )
    .await;

    run_factory(&store).await;

    let jobs = store.fetch_jobs_for_analysis(consume_id).await.unwrap();
    assert_eq!(jobs.len(), 2);
}

#[tokio::test]
#[serial]
async fn minibatching_emits_key_ranges() {
    let store = common::connect_store().await;
    let (_, consume_id) = factory_pipeline(
        &store,
        params![
            "inputlist" => json!(["1", "2", "3", "4", "5", "6", "7"]),
            "step" => json!(3),
        ],
    )
    .await;

    run_factory(&store).await;

    let jobs = store.fetch_jobs_for_analysis(consume_id).await.unwrap();
    assert_eq!(jobs.len(), 3, "7 contiguous keys in steps of 3");
    let mut starts = HashSet::new();
    for job in &jobs {
        let params = store.job_input_params(job).await.unwrap();
        starts.insert(params.get_str("_range_start").unwrap());
        assert!(params.get_i64("_range_count").is_some());
    }
    assert_eq!(
        starts,
        HashSet::from(["1".to_string(), "4".to_string(), "7".to_string()])
    );
}

#[tokio::test]
#[serial]
async fn randomize_reorders_but_preserves_the_set() {
    let store = common::connect_store().await;
    let (_, consume_id) = factory_pipeline(
        &store,
        params![
            "inputlist" => json!(["a", "b", "c", "d", "e"]),
            "randomize" => json!(true),
        ],
    )
    .await;

    run_factory(&store).await;

    let jobs = store.fetch_jobs_for_analysis(consume_id).await.unwrap();
    let mut values = HashSet::new();
    for job in &jobs {
        let params = store.job_input_params(job).await.unwrap();
        values.insert(params.get_str("_0").unwrap());
    }
    assert_eq!(
        values,
        HashSet::from_iter(["a", "b", "c", "d", "e"].map(String::from))
    );
}

/// Configuring two sources (or none) is a config error: the job fails fast
/// with no retry.
#[tokio::test]
#[serial]
async fn conflicting_sources_fail_fast() {
    let store = common::connect_store().await;
    let (expand_id, _) = factory_pipeline(
        &store,
        params![
            "inputlist" => json!(["x"]),
            "inputcmd" => json!("true"),
        ],
    )
    .await;

    run_factory(&store).await;

    let jobs = store.fetch_jobs_for_analysis(expand_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, apiary::JobStatus::Failed);
    assert_eq!(jobs[0].retry_count, 1, "config errors are not retried");
}
