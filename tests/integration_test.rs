//! Integration tests for auditpart.
//!
//! These tests drive the pipeline end to end over in-process memory stores.
//! Memory locations with the same name are shared within the process, so
//! every test uses its own store name.
//!
//! Run with: cargo test --test integration_test

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, Int64Array};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use futures::StreamExt;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use auditpart::config::Config;
use auditpart::enrich::SESSION_DURATION_COLUMN;
use auditpart::error::PipelineError;
use auditpart::job::{JobPhase, output_base_for};
use auditpart::lease::Lease;
use auditpart::parse::HEADER;
use auditpart::partition::part_name;
use auditpart::retry::Backoff;
use auditpart::schedule::RESUME_HANDLER;
use auditpart::storage::{StorageProvider, StorageProviderRef};
use auditpart::{InvocationOutcome, Pipeline, WatchdogOutcome, runlog};

/// Config over the memory store `name`, with fast lease retries.
fn memory_config(name: &str) -> Config {
    let mut config = Config::with_paths(
        &format!("memory://{name}/inbox"),
        &format!("memory://{name}/parts"),
        &format!("memory://{name}/state"),
    );
    config.error_handling.max_attempts = 2;
    config.error_handling.backoff_base_ms = 1;
    config.error_handling.backoff_max_ms = 2;
    config
}

async fn provider(url: &str) -> StorageProviderRef {
    Arc::new(
        StorageProvider::for_url_with_options(url, HashMap::new())
            .await
            .unwrap(),
    )
}

/// An audit file of `rows` plain edit events.
fn audit_file(rows: usize) -> String {
    let mut text = format!("{HEADER}\n");
    for i in 0..rows {
        text.push_str(&format!(
            "user{i}|{i}|0|edited step {i}|2024-01-01T00:00:00Z|Edit|Recipe|Mix A|1\n"
        ));
    }
    text
}

async fn put_source(name: &str, file: &str, text: String) {
    provider(&format!("memory://{name}/inbox"))
        .await
        .put(file, Bytes::from(text))
        .await
        .unwrap();
}

async fn read_part(name: &str, part: &str) -> Vec<RecordBatch> {
    let bytes = provider(&format!("memory://{name}/parts"))
        .await
        .get(part)
        .await
        .unwrap();
    ParquetRecordBatchReaderBuilder::try_new(bytes)
        .unwrap()
        .build()
        .unwrap()
        .map(|batch| batch.unwrap())
        .collect()
}

/// Object name of part `index` exported from `source`.
fn part(source: &str, index: usize) -> String {
    part_name(&output_base_for(source), index)
}

async fn part_rows(name: &str, part: &str) -> usize {
    read_part(name, part)
        .await
        .iter()
        .map(|batch| batch.num_rows())
        .sum()
}

mod config_tests {
    use super::*;

    #[test]
    fn test_config_file_loading() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("auditpart.yaml");
        std::fs::write(
            &path,
            r#"
source:
  path: "${AUDITPART_TEST_UNSET_SOURCE:-memory://cfg/inbox}"
  extensions: [".txt"]
sink:
  path: "memory://cfg/parts"
  chunk_rows: 1000
  compression: zstd
state:
  path: "memory://cfg/state"
schedule:
  resume_delay_secs: 120
log:
  path: "memory://cfg/log"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.source.path, "memory://cfg/inbox");
        assert_eq!(config.source.extensions, vec![".txt".to_string()]);
        assert_eq!(config.sink.chunk_rows, 1000);
        assert_eq!(config.sink.max_cells, 10_000_000);
        assert_eq!(config.schedule.resume_delay_secs, 120);
        assert_eq!(config.schedule.retry_delay_secs, 30);
        assert_eq!(config.job.row_budget, 30_000);
        assert_eq!(config.log.path.as_deref(), Some("memory://cfg/log"));
    }

    #[test]
    fn test_missing_env_var_is_reported() {
        let yaml = r#"
source:
  path: "${AUDITPART_TEST_UNSET_SOURCE}"
sink:
  path: "/out"
state:
  path: "/state"
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("interpolation"));
    }

    #[test]
    fn test_missing_sink_section_fails() {
        let yaml = r#"
source:
  path: "/in"
state:
  path: "/state"
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }
}

mod resume_tests {
    use super::*;

    #[tokio::test]
    async fn test_row_budget_bounds_each_invocation() {
        let name = "it-budget";
        put_source(name, "audit_2024-01.txt", audit_file(25)).await;

        let mut config = memory_config(name);
        config.sink.chunk_rows = 4;
        config.job.row_budget = 10;
        let pipeline = Pipeline::new(config).await.unwrap();

        let report = pipeline.start().await.unwrap().unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.first.as_deref(), Some("audit_2024-01.txt"));

        let first = pipeline.resume().await.unwrap();
        assert!(matches!(
            first,
            InvocationOutcome::Paused {
                cursor: 10,
                total: 25,
                rows_emitted: 10,
                ..
            }
        ));

        let status = pipeline.status().await.unwrap();
        assert_eq!(status.phase, JobPhase::Paused);
        let job = status.job.unwrap();
        assert_eq!(job.cursor, 10);
        assert_eq!(job.part_index, 4);
        assert_eq!(job.total_cols, Some(20));
        assert!(status.pending_resume.is_some());

        let second = pipeline.resume().await.unwrap();
        assert!(matches!(
            second,
            InvocationOutcome::Paused {
                cursor: 20,
                rows_emitted: 10,
                ..
            }
        ));

        let third = pipeline.resume().await.unwrap();
        assert_eq!(
            third,
            InvocationOutcome::Finished {
                completed: "audit_2024-01.txt".to_string(),
                rows_emitted: 5,
            }
        );

        // 4,4,2 | 4,4,2 | 4,1
        let expected = [4, 4, 2, 4, 4, 2, 4, 1];
        for (index, rows) in expected.iter().enumerate() {
            let object = part("audit_2024-01.txt", index + 1);
            assert_eq!(part_rows(name, &object).await, *rows, "{object}");
        }

        let status = pipeline.status().await.unwrap();
        assert_eq!(status.phase, JobPhase::Absent);
        assert!(status.pending_resume.is_none());
        assert_eq!(pipeline.resume().await.unwrap(), InvocationOutcome::Idle);
    }

    #[tokio::test]
    async fn test_default_budget_emits_thirty_thousand_rows() {
        let name = "it-default-budget";
        put_source(name, "audit_2024-02.txt", audit_file(30_005)).await;

        let pipeline = Pipeline::new(memory_config(name)).await.unwrap();
        pipeline.start().await.unwrap();

        let outcome = pipeline.resume().await.unwrap();
        assert_eq!(outcome.rows_emitted(), 30_000);
        assert!(matches!(
            outcome,
            InvocationOutcome::Paused {
                cursor: 30_000,
                total: 30_005,
                ..
            }
        ));
        assert_eq!(part_rows(name, &part("audit_2024-02.txt", 1)).await, 30_000);
    }

    #[tokio::test]
    async fn test_existing_parts_are_skipped_on_restart() {
        let name = "it-skip";
        put_source(name, "audit_2024-01.txt", audit_file(6)).await;

        let mut config = memory_config(name);
        config.sink.chunk_rows = 4;
        let pipeline = Pipeline::new(config).await.unwrap();

        pipeline.start().await.unwrap();
        let outcome = pipeline.resume().await.unwrap();
        assert_eq!(outcome.rows_emitted(), 6);

        assert!(pipeline.reset().await.unwrap());
        pipeline.start().await.unwrap();

        let outcome = pipeline.resume().await.unwrap();
        assert_eq!(
            outcome,
            InvocationOutcome::Finished {
                completed: "audit_2024-01.txt".to_string(),
                rows_emitted: 0,
            }
        );
        assert_eq!(part_rows(name, &part("audit_2024-01.txt", 1)).await, 4);
        assert_eq!(part_rows(name, &part("audit_2024-01.txt", 2)).await, 2);
        assert!(
            !provider(&format!("memory://{name}/parts"))
                .await
                .exists(part("audit_2024-01.txt", 3).as_str())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_queue_runs_newest_month_first() {
        let name = "it-queue";
        put_source(name, "misc.txt", audit_file(2)).await;
        put_source(name, "audit_2023-11.txt", audit_file(2)).await;
        put_source(name, "audit_2024-01.txt", audit_file(2)).await;
        put_source(name, "notes.parquet", audit_file(2)).await;

        let pipeline = Pipeline::new(memory_config(name)).await.unwrap();
        let report = pipeline.start().await.unwrap().unwrap();
        assert_eq!(report.files, 3);
        assert_eq!(report.first.as_deref(), Some("audit_2024-01.txt"));

        let InvocationOutcome::Advanced {
            completed, next, ..
        } = pipeline.resume().await.unwrap()
        else {
            panic!("expected the queue to advance");
        };
        assert_eq!(completed, "audit_2024-01.txt");
        assert_eq!(next, "audit_2023-11.txt");

        let InvocationOutcome::Advanced {
            completed, next, ..
        } = pipeline.resume().await.unwrap()
        else {
            panic!("expected the queue to advance");
        };
        assert_eq!(completed, "audit_2023-11.txt");
        assert_eq!(next, "misc.txt");

        assert!(matches!(
            pipeline.resume().await.unwrap(),
            InvocationOutcome::Finished { ref completed, .. } if completed == "misc.txt"
        ));

        let status = pipeline.status().await.unwrap();
        assert_eq!(status.queue_current, Some(3));
        assert_eq!(status.queue_len, Some(3));
    }

    #[tokio::test]
    async fn test_same_stem_sources_keep_separate_parts() {
        let name = "it-same-stem";
        put_source(name, "audit_2024-01.txt", audit_file(3)).await;
        put_source(name, "audit_2024-01.csv", audit_file(5)).await;

        let pipeline = Pipeline::new(memory_config(name)).await.unwrap();
        let report = pipeline.start().await.unwrap().unwrap();
        assert_eq!(report.files, 2);

        let first = pipeline.resume().await.unwrap();
        assert!(matches!(
            first,
            InvocationOutcome::Advanced { rows_emitted: 3, .. }
        ));
        let second = pipeline.resume().await.unwrap();
        assert!(matches!(
            second,
            InvocationOutcome::Finished { rows_emitted: 5, .. }
        ));

        assert_ne!(part("audit_2024-01.txt", 1), part("audit_2024-01.csv", 1));
        assert_eq!(part_rows(name, &part("audit_2024-01.txt", 1)).await, 3);
        assert_eq!(part_rows(name, &part("audit_2024-01.csv", 1)).await, 5);

        let parts = provider(&format!("memory://{name}/parts"))
            .await
            .list_objects()
            .await
            .unwrap();
        assert_eq!(parts.len(), 2);
    }

    #[tokio::test]
    async fn test_changed_source_fails_and_arms_retry() {
        let name = "it-changed";
        put_source(name, "audit_2024-01.txt", audit_file(10)).await;

        let mut config = memory_config(name);
        config.job.row_budget = 4;
        let pipeline = Pipeline::new(config).await.unwrap();

        pipeline.start().await.unwrap();
        pipeline.resume().await.unwrap();
        pipeline.scheduler().cancel(RESUME_HANDLER).await.unwrap();

        put_source(name, "audit_2024-01.txt", audit_file(3)).await;
        let err = pipeline.resume().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SourceChanged {
                available: 3,
                required: 10,
                ..
            }
        ));

        let status = pipeline.status().await.unwrap();
        assert!(status.pending_resume.is_some());
        assert_eq!(status.job.unwrap().cursor, 4);
        assert!(status.lease.is_none());
    }
}

mod export_tests {
    use super::*;

    #[tokio::test]
    async fn test_session_duration_is_exported() {
        let name = "it-session";
        let text = format!(
            "{HEADER}\n\
             A|1|0|started x|2024-01-01T00:00:00Z|Edit|recipe|RID1|1\n\
             A|2|0|checked out recipe|2024-01-01T00:00:00Z|Edit|recipe|RID1|1\n\
             A|3|0|checked in recipe|2024-01-01T01:00:00Z|Edit|recipe|RID1|1\n"
        );
        put_source(name, "Jan2024_audit.txt", text).await;

        let pipeline = Pipeline::new(memory_config(name)).await.unwrap();
        pipeline.start().await.unwrap();
        let outcome = pipeline.resume().await.unwrap();
        assert_eq!(outcome.rows_emitted(), 3);

        let batches = read_part(name, &part("Jan2024_audit.txt", 1)).await;
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), 20);

        let durations = batch
            .column(SESSION_DURATION_COLUMN)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert!(durations.is_null(0));
        assert_eq!(durations.value(1), 3600);
        assert!(durations.is_null(2));
    }

    #[tokio::test]
    async fn test_flagged_lines_go_to_bad_line_sink() {
        let name = "it-badlines";
        let text = format!(
            "{HEADER}\n\
             u1|1|0|fine|2024-01-01T00:00:00Z|Edit|Recipe|Mix A|1\n\
             u2|2|0\n"
        );
        put_source(name, "audit_2024-01.txt", text).await;

        let mut config = memory_config(name);
        config.error_handling.bad_lines_path = Some(format!("memory://{name}/bad"));
        let pipeline = Pipeline::new(config).await.unwrap();
        pipeline.start().await.unwrap();

        // Padded lines are kept as rows and also recorded
        assert_eq!(pipeline.resume().await.unwrap().rows_emitted(), 2);

        let bad = provider(&format!("memory://{name}/bad")).await;
        let bytes = bad.get("bad_lines/gen-000001.ndjson").await.unwrap();
        let content = String::from_utf8(bytes.to_vec()).unwrap();
        let entries: Vec<serde_json::Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["reason"], "PADDED");
        assert_eq!(entries[0]["line_number"], 3);
        assert_eq!(entries[0]["raw"], "u2|2|0");
    }

    #[tokio::test]
    async fn test_bad_lines_are_not_duplicated_after_reset() {
        let name = "it-badlines-reset";
        let text = format!(
            "{HEADER}\n\
             u1|1|0|fine|2024-01-01T00:00:00Z|Edit|Recipe|Mix A|1\n\
             u2|2|0\n"
        );
        put_source(name, "audit_2024-01.txt", text).await;

        let mut config = memory_config(name);
        config.error_handling.bad_lines_path = Some(format!("memory://{name}/bad"));
        let pipeline = Pipeline::new(config).await.unwrap();

        pipeline.start().await.unwrap();
        pipeline.resume().await.unwrap();
        assert!(pipeline.reset().await.unwrap());
        pipeline.start().await.unwrap();
        assert!(matches!(
            pipeline.resume().await.unwrap(),
            InvocationOutcome::Finished { .. }
        ));

        let bad = provider(&format!("memory://{name}/bad")).await;
        let bytes = bad.get("bad_lines/gen-000001.ndjson").await.unwrap();
        assert_eq!(String::from_utf8(bytes.to_vec()).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_execution_log_tracks_latest_status() {
        let name = "it-runlog";
        put_source(name, "audit_2024-01.txt", audit_file(3)).await;

        let mut config = memory_config(name);
        config.log.path = Some(format!("memory://{name}/log"));
        let pipeline = Pipeline::new(config).await.unwrap();

        pipeline.start().await.unwrap();
        let log = provider(&format!("memory://{name}/log")).await;
        let status = runlog::read_status(&log).await.unwrap();
        assert_eq!(status.phase, "start");
        assert_eq!(status.status, "QUEUED");
        assert!(status.next_scheduled.is_some());

        pipeline.resume().await.unwrap();
        let status = runlog::read_status(&log).await.unwrap();
        assert_eq!(status.phase, "resume");
        assert_eq!(status.status, "FINISHED");
        assert_eq!(status.file.as_deref(), Some("audit_2024-01.txt"));

        let events: Vec<String> = log
            .list(true)
            .map(|meta| meta.unwrap().location.to_string())
            .filter(|path| std::future::ready(path.starts_with("events/")))
            .collect()
            .await;
        // One events object per invocation
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|path| path.ends_with("-start.ndjson")));
    }
}

mod watchdog_tests {
    use super::*;

    #[tokio::test]
    async fn test_watchdog_repairs_missing_resume() {
        let name = "it-watchdog";
        put_source(name, "audit_2024-01.txt", audit_file(3)).await;

        let pipeline = Pipeline::new(memory_config(name)).await.unwrap();
        assert_eq!(pipeline.watchdog().await.unwrap(), WatchdogOutcome::Idle);

        pipeline.start().await.unwrap();
        assert_eq!(pipeline.watchdog().await.unwrap(), WatchdogOutcome::Ok);

        pipeline.scheduler().cancel(RESUME_HANDLER).await.unwrap();
        assert_eq!(pipeline.watchdog().await.unwrap(), WatchdogOutcome::Repaired);

        let trigger = pipeline
            .scheduler()
            .pending(RESUME_HANDLER)
            .await
            .unwrap()
            .unwrap();
        assert!(trigger.due_at > trigger.armed_at);
        assert_eq!(pipeline.watchdog().await.unwrap(), WatchdogOutcome::Ok);
    }

    #[tokio::test]
    async fn test_held_lease_makes_invocations_busy() {
        let name = "it-busy";
        put_source(name, "audit_2024-01.txt", audit_file(3)).await;

        let pipeline = Pipeline::new(memory_config(name)).await.unwrap();
        pipeline.start().await.unwrap();

        let other = Lease::new(
            provider(&format!("memory://{name}/state")).await,
            Duration::from_secs(60),
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 1),
        );
        let guard = other.acquire().await.unwrap();

        assert_eq!(pipeline.resume().await.unwrap(), InvocationOutcome::Busy);
        assert_eq!(pipeline.watchdog().await.unwrap(), WatchdogOutcome::Ok);
        assert!(!pipeline.reset().await.unwrap());
        assert!(pipeline.start().await.unwrap().is_none());

        let status = pipeline.status().await.unwrap();
        assert_eq!(
            status.lease.map(|info| info.holder_id),
            Some(other.holder_id().to_string())
        );

        guard.release().await.unwrap();
        assert_eq!(pipeline.resume().await.unwrap().rows_emitted(), 3);
    }

    #[tokio::test]
    async fn test_reset_clears_job_and_queue() {
        let name = "it-reset";
        put_source(name, "audit_2024-01.txt", audit_file(10)).await;

        let mut config = memory_config(name);
        config.job.row_budget = 5;
        let pipeline = Pipeline::new(config).await.unwrap();

        pipeline.start().await.unwrap();
        pipeline.resume().await.unwrap();
        assert_eq!(pipeline.status().await.unwrap().phase, JobPhase::Paused);

        assert!(pipeline.reset().await.unwrap());
        let status = pipeline.status().await.unwrap();
        assert_eq!(status.phase, JobPhase::Absent);
        assert!(status.queue_len.is_none());
        assert!(status.pending_resume.is_none());
        assert_eq!(pipeline.resume().await.unwrap(), InvocationOutcome::Idle);
        assert_eq!(pipeline.watchdog().await.unwrap(), WatchdogOutcome::Idle);
    }
}
