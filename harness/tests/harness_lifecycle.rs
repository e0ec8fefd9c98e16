//! End-to-end run lifecycle tests.
//!
//! Each test drives `Harness::run` against a real `/bin/sh` task and checks
//! the result along with the state of the workspace root afterwards.

use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use harness::controller::{HarnessError, RunOptions};
use harness::core::output::StreamId;
use harness::core::state::RunState;
use harness::core::types::{ResourceLimits, StructuredResult, TaskExit, TaskSpec, TaskStatus};
use harness::io::launcher::LaunchError;
use harness::test_support::{TestHarness, shell_task};

#[tokio::test]
async fn clean_exit_without_result_file_succeeds() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task("hello", "echo hello; echo warn >&2");

    let result = env.run(&spec).await.expect("run");

    assert_eq!(result.status, TaskStatus::Succeeded);
    assert_eq!(result.exit, TaskExit::Exited { code: 0 });
    assert_eq!(result.exit_code(), Some(0));
    assert_eq!(result.final_state, RunState::Done);
    assert_eq!(result.result, StructuredResult::Absent);
    assert!(result.result_parse_error().is_none());
    assert!(result.files.is_empty());
    assert_eq!(result.stdout(), b"hello\n");
    assert_eq!(result.stderr(), b"warn\n");
    assert!(result.program_sha256.is_some());
    assert_eq!(env.workspace_count().expect("count"), 0);
    assert!(!result.workspace.root.exists());
}

#[tokio::test]
async fn nonzero_exit_is_a_failed_result() {
    let env = TestHarness::new().expect("harness");
    let result = env
        .run(&shell_task("fails", "exit 7"))
        .await
        .expect("run");

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.exit_code(), Some(7));
    assert_eq!(result.final_state, RunState::Done);
}

#[tokio::test]
async fn output_budget_keeps_leading_bytes_and_one_marker() {
    let env = TestHarness::new().expect("harness");
    let limits = ResourceLimits {
        max_output_bytes: 1000,
        ..ResourceLimits::default()
    };
    let spec = shell_task("chatty", "head -c 200000 /dev/zero; echo done >&2").limits(limits);

    let result = env.run(&spec).await.expect("run");

    assert_eq!(result.status, TaskStatus::Succeeded);
    assert_eq!(result.output.captured_bytes, 1000);
    assert_eq!(result.output.truncation_count(), 1);
    assert_eq!(
        result.output.discarded_bytes,
        200_000 + 5 - 1000,
        "every byte past the budget is drained and counted"
    );
    let stdout = result.stdout();
    assert_eq!(stdout.len(), 1000);
    assert!(stdout.iter().all(|byte| *byte == 0));
    assert!(!result.output.drain_incomplete);
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn timeout_terminates_and_keeps_partial_outputs() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task(
        "sleepy",
        "echo partial > \"$HARNESS_OUTPUTS/partial.txt\"; echo started; sleep 30",
    )
    .timeout(Duration::from_millis(500));

    let started = Instant::now();
    let result = env.run(&spec).await.expect("run");

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.status, TaskStatus::TimedOut);
    assert_eq!(result.exit, TaskExit::TimedOut);
    assert_eq!(result.final_state, RunState::TimedOut);
    assert_eq!(result.exit_code(), None);
    let partial = result.file("partial.txt").expect("partial output");
    assert_eq!(partial.size, "partial\n".len() as u64);
    assert_eq!(result.stdout(), b"started\n");
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn timeout_escalates_past_ignored_sigterm() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task("stubborn", "trap '' TERM; sleep 30").timeout(Duration::from_millis(300));

    let started = Instant::now();
    let result = env.run(&spec).await.expect("run");

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.status, TaskStatus::TimedOut);
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn signal_death_is_a_crash() {
    let env = TestHarness::new().expect("harness");
    let result = env
        .run(&shell_task("crash", "echo before; kill -KILL $$"))
        .await
        .expect("run");

    assert_eq!(result.status, TaskStatus::Crashed);
    assert_eq!(result.exit, TaskExit::Crashed { signal: Some(9) });
    assert_eq!(result.final_state, RunState::Crashed);
    assert_eq!(result.stdout(), b"before\n");
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn structured_result_round_trips() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task(
        "structured",
        r#"printf '{"status":"success","message":"ok","timestamp":"2026-03-04T05:06:07Z"}' > "$HARNESS_OUTPUTS/result.json""#,
    );

    let result = env.run(&spec).await.expect("run");

    let expected: Map<String, Value> = match json!({
        "status": "success",
        "message": "ok",
        "timestamp": "2026-03-04T05:06:07Z",
    }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    assert_eq!(result.status, TaskStatus::Succeeded);
    assert_eq!(result.result.payload(), Some(&expected));
    assert!(result.result_parse_error().is_none());
    assert!(result.file("result.json").is_some());
}

#[tokio::test]
async fn malformed_result_file_is_not_fatal() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task(
        "malformed",
        r#"echo '{oops' > "$HARNESS_OUTPUTS/result.json"; echo note > "$HARNESS_OUTPUTS/notes.txt""#,
    );

    let result = env.run(&spec).await.expect("run");

    assert_eq!(result.status, TaskStatus::Succeeded);
    assert!(result.result_parse_error().is_some());
    assert_eq!(result.files.len(), 2);
    assert!(result.file("notes.txt").is_some());
}

#[tokio::test]
async fn offsetless_iso8601_timestamp_round_trips() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task(
        "naive-time",
        r#"printf '{"status":"success","message":"ok","timestamp":"2026-03-04T05:06:07.123456"}' > "$HARNESS_OUTPUTS/result.json""#,
    );

    let result = env.run(&spec).await.expect("run");

    assert!(result.result_parse_error().is_none(), "{:?}", result.result);
    assert_eq!(result.result.status(), Some("success"));
    assert_eq!(
        result
            .result
            .payload()
            .and_then(|payload| payload.get("timestamp")),
        Some(&Value::from("2026-03-04T05:06:07.123456"))
    );
}

#[tokio::test]
async fn fifo_result_file_does_not_block_collection() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task("fifo", r#"mkfifo "$HARNESS_OUTPUTS/result.json""#);

    let result = tokio::time::timeout(Duration::from_secs(10), env.run(&spec))
        .await
        .expect("run finishes")
        .expect("run");

    assert_eq!(result.status, TaskStatus::Succeeded);
    let diagnostic = result.result_parse_error().expect("diagnostic");
    assert!(diagnostic.contains("not a regular file"), "{diagnostic}");
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn missing_executable_is_a_launch_error_without_leftovers() {
    let env = TestHarness::new().expect("harness");
    let spec = TaskSpec::new("ghost", env.path().join("does/not/exist"));

    let err = env.run(&spec).await.expect_err("launch error");

    assert!(matches!(err, HarnessError::Launch(LaunchError::NotFound { .. })));
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn missing_input_is_a_setup_error_without_leftovers() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task("needs-input", "true").input("absent.csv");

    let err = env.run(&spec).await.expect_err("workspace error");

    assert!(matches!(err, HarnessError::Workspace(_)));
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn run_dropped_during_setup_removes_its_workspace() {
    let env = TestHarness::new().expect("harness");
    for index in 0..200 {
        env.write_input(&format!("bulk/file{index:03}.txt"), "payload")
            .expect("input");
    }
    let spec = shell_task("dropped", "true").input("bulk/*.txt");

    let dropped = tokio::time::timeout(Duration::ZERO, env.run(&spec)).await;
    assert!(dropped.is_err(), "run should still be staging inputs");

    // Staging finishes on a blocking thread after the drop.
    let deadline = Instant::now() + Duration::from_secs(5);
    tokio::time::sleep(Duration::from_millis(500)).await;
    while env.workspace_count().expect("count") > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn sequential_runs_use_fresh_workspaces() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task(
        "repeat",
        r#"ls -A "$HARNESS_OUTPUTS" | wc -l; ls -A "$HARNESS_INPUTS" | wc -l; echo x > "$HARNESS_OUTPUTS/out.txt"; echo y > leftover.txt"#,
    );

    let first = env.run(&spec).await.expect("first run");
    let second = env.run(&spec).await.expect("second run");

    assert_ne!(first.workspace.root, second.workspace.root);
    for result in [&first, &second] {
        assert_eq!(result.status, TaskStatus::Succeeded);
        let counts: Vec<String> = result
            .stdout_text()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        assert_eq!(counts, vec!["0".to_string(), "0".to_string()]);
        assert_eq!(result.files.len(), 1);
    }
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn inputs_are_staged_read_only() {
    let env = TestHarness::new().expect("harness");
    env.write_input("data/a.csv", "1,2\n").expect("input");
    env.write_input("data/skip.txt", "no").expect("input");
    let spec = shell_task(
        "reader",
        r#"cat "$HARNESS_INPUTS/data/a.csv"; stat -c %a "$HARNESS_INPUTS/data/a.csv" "$HARNESS_INPUTS"; test -e "$HARNESS_INPUTS/data/skip.txt" || echo skipped"#,
    )
    .input("data/*.csv");

    let result = env.run(&spec).await.expect("run");

    assert_eq!(result.status, TaskStatus::Succeeded);
    assert_eq!(result.stdout_text(), "1,2\n444\n555\nskipped\n");
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn cancellation_stops_the_task_and_tears_down() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task(
        "cancelled",
        "echo partial > \"$HARNESS_OUTPUTS/partial.txt\"; sleep 30",
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = env
        .run_with(
            &spec,
            RunOptions {
                cancel,
                ..RunOptions::default()
            },
        )
        .await
        .expect("run");

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert_eq!(result.final_state, RunState::Cancelled);
    assert!(result.file("partial.txt").is_some());
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn background_children_do_not_hold_the_run_open() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task("forks", "sleep 30 & echo parent done");

    let started = Instant::now();
    let result = env.run(&spec).await.expect("run");

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.status, TaskStatus::Succeeded);
    assert_eq!(result.stdout(), b"parent done\n");
    assert!(!result.output.drain_incomplete);
}

#[tokio::test]
async fn concurrent_runs_are_isolated() {
    let env = TestHarness::new().expect("harness");
    let left = shell_task("left", r#"echo left > "$HARNESS_OUTPUTS/side.txt"; ls "$HARNESS_OUTPUTS""#);
    let right = shell_task("right", r#"echo right > "$HARNESS_OUTPUTS/side.txt"; ls "$HARNESS_OUTPUTS""#);

    let harness = env.harness().clone();
    let (left, right) = tokio::join!(env.run(&left), harness.run(&right));
    let (left, right) = (left.expect("left"), right.expect("right"));

    assert_ne!(left.workspace.root, right.workspace.root);
    for result in [&left, &right] {
        assert_eq!(result.status, TaskStatus::Succeeded);
        assert_eq!(result.stdout_text(), "side.txt\n");
        assert_eq!(result.file("side.txt").map(|file| file.size), Some(if result.task == "left" { 5 } else { 6 }));
    }
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn outputs_outside_the_rules_fail_the_run() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task(
        "policy",
        r#"mkdir -p "$HARNESS_OUTPUTS/reports"; echo ok > "$HARNESS_OUTPUTS/reports/a.md"; echo x > "$HARNESS_OUTPUTS/stray.tmp""#,
    )
    .outputs(vec!["outputs/reports/".to_string()]);

    let result = env.run(&spec).await.expect("run");

    assert_eq!(result.exit_code(), Some(0));
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.policy_violations, vec!["stray.tmp".to_string()]);
}

#[tokio::test]
async fn outputs_can_be_exported_before_teardown() {
    let env = TestHarness::new().expect("harness");
    let dest = env.path().join("exported");
    let spec = shell_task(
        "export",
        r#"mkdir -p "$HARNESS_OUTPUTS/nested"; echo keep > "$HARNESS_OUTPUTS/nested/file.txt""#,
    );

    let result = env
        .run_with(
            &spec,
            RunOptions {
                export_outputs: Some(dest.clone()),
                ..RunOptions::default()
            },
        )
        .await
        .expect("run");

    assert!(result.collection_errors.is_empty());
    assert_eq!(
        std::fs::read_to_string(dest.join("nested/file.txt")).expect("exported file"),
        "keep\n"
    );
    assert_eq!(env.workspace_count().expect("count"), 0);
}

#[tokio::test]
async fn interleaved_streams_keep_arrival_order() {
    let env = TestHarness::new().expect("harness");
    let spec = shell_task(
        "interleave",
        "echo one; sleep 0.2; echo two >&2; sleep 0.2; echo three",
    );

    let result = env.run(&spec).await.expect("run");

    let order: Vec<(StreamId, String)> = result
        .output
        .records
        .iter()
        .filter_map(|record| match record {
            harness::core::output::CaptureRecord::Data { stream, bytes, .. } => {
                Some((*stream, String::from_utf8_lossy(bytes).into_owned()))
            }
            harness::core::output::CaptureRecord::Truncated { .. } => None,
        })
        .collect();
    assert_eq!(
        order,
        vec![
            (StreamId::Stdout, "one\n".to_string()),
            (StreamId::Stderr, "two\n".to_string()),
            (StreamId::Stdout, "three\n".to_string()),
        ]
    );
}
