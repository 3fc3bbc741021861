//! Schema bootstrap for the shared store.
//!
//! One statement per table so the batch runs unchanged on drivers that
//! reject multi-statement queries. Autoincrement and secondary-index
//! spellings differ per dialect; everything else is common SQL.
//!
//! `input_id` is VARCHAR(255) on purpose: it participates in the
//! `UNIQUE(input_id, analysis_id)` dedup key, and payloads longer than that
//! are offloaded to `analysis_data` and referenced by token.

use crate::dialect::SqlDialect;

fn pk(dialect: SqlDialect, name: &str) -> String {
    match dialect {
        SqlDialect::Sqlite => format!("{name} INTEGER PRIMARY KEY AUTOINCREMENT"),
        SqlDialect::MySql => format!("{name} BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY"),
        SqlDialect::Postgres => format!("{name} BIGSERIAL PRIMARY KEY"),
    }
}

pub(crate) fn statements(dialect: SqlDialect) -> Vec<String> {
    let long_text = match dialect {
        SqlDialect::MySql => "LONGTEXT",
        _ => "TEXT",
    };

    // MySQL has no CREATE INDEX IF NOT EXISTS, so secondary indexes go
    // inline there and as separate statements elsewhere.
    let job_claim_key = match dialect {
        SqlDialect::MySql => ",\n    KEY job_claim_idx (analysis_id, status, semaphore_count, retry_count)",
        _ => "",
    };
    let accu_key = match dialect {
        SqlDialect::MySql => ",\n    KEY accu_receiving_idx (receiving_job_id)",
        _ => "",
    };

    let mut statements = vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS analysis (
                {pk},
                logic_name VARCHAR(255) NOT NULL UNIQUE,
                module VARCHAR(255) NOT NULL,
                parameters TEXT NOT NULL,
                batch_size BIGINT NOT NULL DEFAULT 1,
                hive_capacity BIGINT NOT NULL DEFAULT 4,
                max_retry_count INTEGER NOT NULL DEFAULT 3,
                failed_job_tolerance DOUBLE PRECISION NOT NULL DEFAULT 0
            )
            "#,
            pk = pk(dialect, "analysis_id")
        ),
        r#"
            CREATE TABLE IF NOT EXISTS analysis_stats (
                analysis_id BIGINT PRIMARY KEY,
                status VARCHAR(16) NOT NULL DEFAULT 'READY',
                total_job_count BIGINT NOT NULL DEFAULT 0,
                unclaimed_job_count BIGINT NOT NULL DEFAULT 0,
                done_job_count BIGINT NOT NULL DEFAULT 0,
                failed_job_count BIGINT NOT NULL DEFAULT 0,
                num_required_workers BIGINT NOT NULL DEFAULT 0
            )
            "#
        .to_string(),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS job (
                {pk},
                analysis_id BIGINT NOT NULL,
                input_id VARCHAR(255) NOT NULL,
                prev_job_id BIGINT,
                worker_id BIGINT,
                status VARCHAR(16) NOT NULL DEFAULT 'READY',
                retry_count INTEGER NOT NULL DEFAULT 0,
                semaphore_count INTEGER NOT NULL DEFAULT 0,
                semaphored_job_id BIGINT,
                completed VARCHAR(40),
                runtime_msec BIGINT,
                query_count BIGINT,
                UNIQUE (input_id, analysis_id){job_claim_key}
            )
            "#,
            pk = pk(dialect, "job_id")
        ),
        r#"
            CREATE TABLE IF NOT EXISTS job_file (
                job_id BIGINT NOT NULL,
                retry INTEGER NOT NULL,
                worker_id BIGINT,
                stdout_file TEXT,
                stderr_file TEXT,
                PRIMARY KEY (job_id, retry)
            )
            "#
        .to_string(),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS job_message (
                {pk},
                job_id BIGINT,
                worker_id BIGINT,
                msg TEXT NOT NULL,
                is_error INTEGER NOT NULL DEFAULT 0,
                time VARCHAR(40) NOT NULL
            )
            "#,
            pk = pk(dialect, "message_id")
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_data (
                {pk},
                checksum CHAR(64) NOT NULL UNIQUE,
                data {long_text} NOT NULL
            )
            "#,
            pk = pk(dialect, "analysis_data_id")
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS worker (
                {pk},
                analysis_id BIGINT NOT NULL,
                meadow_type VARCHAR(64) NOT NULL,
                host VARCHAR(255) NOT NULL,
                process_id BIGINT NOT NULL,
                born VARCHAR(40) NOT NULL,
                died VARCHAR(40),
                cause_of_death VARCHAR(16),
                work_done BIGINT NOT NULL DEFAULT 0
            )
            "#,
            pk = pk(dialect, "worker_id")
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS dataflow_rule (
                {pk},
                from_analysis_id BIGINT NOT NULL,
                branch_code VARCHAR(64) NOT NULL,
                to_url TEXT NOT NULL,
                input_id_template TEXT,
                funnel_group VARCHAR(64)
            )
            "#,
            pk = pk(dialect, "rule_id")
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_ctrl_rule (
                {pk},
                condition_analysis_id BIGINT NOT NULL,
                ctrled_analysis_id BIGINT NOT NULL
            )
            "#,
            pk = pk(dialect, "rule_id")
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS accu (
                receiving_job_id BIGINT NOT NULL,
                accu_name VARCHAR(255) NOT NULL,
                accu_address VARCHAR(255) NOT NULL DEFAULT '',
                value TEXT NOT NULL{accu_key}
            )
            "#
        ),
    ];

    if dialect != SqlDialect::MySql {
        statements.push(
            "CREATE INDEX IF NOT EXISTS job_claim_idx \
             ON job (analysis_id, status, semaphore_count, retry_count)"
                .to_string(),
        );
        statements.push(
            "CREATE INDEX IF NOT EXISTS accu_receiving_idx ON accu (receiving_job_id)"
                .to_string(),
        );
    }

    statements
}
