//! Task-processing programs end to end, against the mock backend.

use std::fs;
use std::time::Duration;

use serde_json::Value;

use crate::fixtures::{
    send_signal, stderr_of, stdout_of, wait_for_file, wait_with_timeout, TestEnv,
};

const PROCESS_TIMEOUT: Duration = Duration::from_secs(15);

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_worker_processes_existing_and_new_files() {
    let env = TestEnv::new();
    env.submit_task(
        "first.json",
        r#"{"id": "task-001", "type": "analysis", "task": "Review sales", "priority": "high"}"#,
    );
    env.submit_task("broken.json", r#"{"id": "task-bad", "task": "no type"}"#);

    let mut worker = env.spawn(&["worker"]);

    let first = env.output_dir().join("task-001_result.json");
    assert!(wait_for_file(&first, PROCESS_TIMEOUT), "existing file not processed");

    env.submit_task(
        "second.json",
        r#"{"id": "task-002", "type": "general", "task": "Say hello"}"#,
    );
    let second = env.output_dir().join("task-002_result.json");
    assert!(wait_for_file(&second, PROCESS_TIMEOUT), "new file not processed");
    assert!(wait_for_file(
        &env.processed_dir().join("second.json"),
        PROCESS_TIMEOUT
    ));

    send_signal(worker.id(), libc::SIGTERM);
    let status = wait_with_timeout(&mut worker, PROCESS_TIMEOUT).expect("worker should stop");
    assert_eq!(status.code(), Some(0));

    let result = read_json(&first);
    assert_eq!(result["task_id"], "task-001");
    assert_eq!(result["status"], "completed");
    assert_eq!(result["original_task"]["priority"], "high");
    assert!(result["result"]["response"]
        .as_str()
        .unwrap()
        .contains("mock response"));

    assert!(env.processed_dir().join("first.json").exists());
    assert!(!env.input_dir().join("first.json").exists());
    // Invalid records stay where they were and produce nothing.
    assert!(env.input_dir().join("broken.json").exists());
    assert!(!env.output_dir().join("task-bad_result.json").exists());
}

#[test]
fn test_agent_mode_runs_worker_until_signalled() {
    let env = TestEnv::new();
    env.submit_task(
        "job.json",
        r#"{"id": "task-010", "type": "general", "task": "Ping"}"#,
    );

    let mut dispatcher = env.spawn(&["agent"]);
    let result = env.output_dir().join("task-010_result.json");
    assert!(wait_for_file(&result, PROCESS_TIMEOUT));

    send_signal(dispatcher.id(), libc::SIGTERM);
    let status =
        wait_with_timeout(&mut dispatcher, PROCESS_TIMEOUT).expect("agent should stop");
    assert_eq!(status.code(), Some(0));

    let log = fs::read_to_string(env.log_file()).unwrap();
    assert!(log.contains("Forwarding SIGTERM"));
    assert!(log.contains("Agent shutdown complete"));
}

#[test]
fn test_task_mode_runs_single_task() {
    let env = TestEnv::new();

    let output = env.run(&["task", "summarize", "file.csv"]);

    assert_eq!(output.status.code(), Some(0), "{}", stderr_of(&output));
    let stdout = stdout_of(&output);
    assert!(stdout.contains("mock response"));

    let results: Vec<_> = fs::read_dir(env.output_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(results.len(), 1);
    let result = read_json(&results[0]);
    assert_eq!(result["original_task"]["task"], "summarize file.csv");
    assert_eq!(result["original_task"]["type"], "general");
    assert!(result["task_id"].as_str().unwrap().starts_with("task-"));
}

#[test]
fn test_run_task_requires_credential() {
    let env = TestEnv::new().without_key();
    let output = env.run(&["run-task", "hello"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("GEMINI_API_KEY"));
}
