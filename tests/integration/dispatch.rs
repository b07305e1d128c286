//! Startup, validation and `task` mode tests.

use std::fs;
use std::time::Duration;

use crate::fixtures::{stderr_of, stdout_of, wait_for_file, TestEnv};

const MODES: [&str; 4] = ["agent", "task", "web", "shell"];

#[test]
fn test_missing_credential_fails_before_any_child() {
    let env = TestEnv::new().without_key();
    let marker = env.root().join("child-started");
    env.write_config(&format!(
        "task = [\"/bin/sh\", \"-c\", \"touch {}\"]\n",
        marker.display()
    ));

    let output = env.run(&["task", "do X"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output)
        .contains("Error: GEMINI_API_KEY environment variable is required"));
    assert!(!marker.exists(), "no child may run without a credential");
}

#[test]
fn test_shell_without_credential_exits_one() {
    let env = TestEnv::new().without_key();
    let output = env.run(&["shell"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("GEMINI_API_KEY"));
}

#[test]
fn test_unknown_verb_prints_usage() {
    let env = TestEnv::new();
    for verb in ["dance", "help", "--help", "-h", "--version"] {
        let output = env.run(&[verb]);
        assert_eq!(output.status.code(), Some(1), "{verb} should exit 1");
        let text = stdout_of(&output);
        for mode in MODES {
            assert!(text.contains(mode), "{verb}: usage should mention {mode}: {text}");
        }
    }
    assert!(!env.data.exists());
}

#[test]
fn test_missing_verb_prints_usage() {
    let env = TestEnv::new();
    let output = env.run(&[]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout_of(&output).contains("Usage:"));
    // Usage errors have no side effects.
    assert!(!env.data.exists());
}

#[test]
fn test_task_exit_status_is_propagated() {
    for (script, expected) in [("exit 0", 0), ("exit 1", 1), ("kill -9 $$", 137)] {
        let env = TestEnv::new();
        env.write_config(&format!("task = [\"/bin/sh\", \"-c\", \"{script}\"]\n"));
        let output = env.run(&["task", "do X"]);
        assert_eq!(
            output.status.code(),
            Some(expected),
            "script {script:?}: {}",
            stderr_of(&output)
        );
    }
}

#[test]
fn test_startup_creates_layout_and_log() {
    let env = TestEnv::new();
    env.write_config("task = [\"/bin/sh\", \"-c\", \"exit 0\"]\n");

    let output = env.run(&["task", "noop"]);

    assert!(output.status.success());
    for dir in ["input", "output", "temp", "processed"] {
        assert!(env.data.join(dir).is_dir(), "{dir} should exist");
    }
    assert!(env.log_file().is_file());
    let log = fs::read_to_string(env.log_file()).unwrap();
    assert!(log.contains("Starting Gemini Agent"));
    assert!(log.contains("Executing single task: noop"));

    let banner = stdout_of(&output);
    assert!(banner.contains("Working directory:"));
    assert!(banner.contains(&format!("Data directory: {}", env.data.display())));
}

#[test]
fn test_task_stub_writes_result() {
    let env = TestEnv::new();
    let result = env.output_dir().join("task-001_result.json");
    env.write_config(&format!(
        "task = [\"/bin/sh\", \"-c\", \"echo '{{}}' > {}\"]\n",
        result.display()
    ));

    let output = env.run(&["task", "summarize file.csv"]);

    assert_eq!(output.status.code(), Some(0));
    assert!(wait_for_file(&result, Duration::from_secs(1)));
}

#[test]
fn test_credential_from_override_file() {
    let env = TestEnv::new().without_key();
    fs::write(
        &env.env_file,
        "# container overrides\nexport GEMINI_API_KEY=\"from-file\"\n",
    )
    .unwrap();
    let seen = env.root().join("seen-key");
    env.write_config(&format!(
        "task = [\"/bin/sh\", \"-c\", \"printf '%s' \\\"$GEMINI_API_KEY\\\" > {}\"]\n",
        seen.display()
    ));

    let output = env.run(&["task", "x"]);

    assert_eq!(output.status.code(), Some(0), "{}", stderr_of(&output));
    assert_eq!(fs::read_to_string(seen).unwrap(), "from-file");
}

#[test]
fn test_model_settings_do_not_block_the_child() {
    let env = TestEnv::new();
    env.write_config("task = [\"/bin/sh\", \"-c\", \"exit 0\"]\n");

    let output = env
        .command(&["task", "x"])
        .env("GEMINI_TEMPERATURE", "hot")
        .env("MAX_CONCURRENT_TASKS", "many")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", stderr_of(&output));

    // The in-process executor is where those settings are checked.
    let output = env
        .command(&["run-task", "x"])
        .env("GEMINI_TEMPERATURE", "hot")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("GEMINI_TEMPERATURE"));
}

#[test]
fn test_missing_credential_reported_before_bad_settings() {
    let env = TestEnv::new().without_key();
    let output = env
        .command(&["shell"])
        .env("GEMINI_TEMPERATURE", "hot")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output)
        .contains("Error: GEMINI_API_KEY environment variable is required"));
}

#[test]
fn test_bad_override_lines_are_logged() {
    let env = TestEnv::new();
    fs::write(&env.env_file, "GOOD_VAR=1\nnot an assignment\n").unwrap();
    env.write_config("task = [\"/bin/sh\", \"-c\", \"exit 0\"]\n");

    let output = env.run(&["task", "x"]);

    assert_eq!(output.status.code(), Some(0), "{}", stderr_of(&output));
    let log = fs::read_to_string(env.log_file()).unwrap();
    assert!(log.contains("[WARN]"), "{log}");
    assert!(log.contains("Ignoring override line 2: missing '='"), "{log}");
    assert!(log.contains("Applied overrides from"));
}

#[test]
fn test_health_reports_checks() {
    let env = TestEnv::new();
    fs::create_dir_all(env.input_dir()).unwrap();
    fs::create_dir_all(env.output_dir()).unwrap();
    fs::create_dir_all(env.processed_dir()).unwrap();
    fs::create_dir_all(&env.logs).unwrap();

    let output = env.run(&["health"]);
    assert_eq!(output.status.code(), Some(0), "{}", stdout_of(&output));
    assert!(stdout_of(&output).contains("All health checks passed"));

    let output = env.without_key().run(&["health"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout_of(&output).contains("❌ environment"));
}
