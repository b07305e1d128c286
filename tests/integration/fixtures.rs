//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - An isolated data/log/config layout in a temporary directory
//! - Stub child programs and a mock backend script
//! - Waiting on files and processes with a deadline

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

pub const TEST_KEY: &str = "test-key";

/// Path of the binary under test.
pub fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_gemini-agent")
}

/// A container-like layout rooted in a temporary directory.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub data: PathBuf,
    pub logs: PathBuf,
    pub config_path: PathBuf,
    pub env_file: PathBuf,
    pub with_key: bool,
}

impl TestEnv {
    /// A fresh layout with the credential set and the mock backend configured.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().to_path_buf();
        let env = Self {
            data: root.join("data"),
            logs: root.join("logs"),
            config_path: root.join("config.toml"),
            env_file: root.join(".env"),
            with_key: true,
            temp_dir,
        };
        env.write_config("");
        env
    }

    pub fn without_key(mut self) -> Self {
        self.with_key = false;
        self
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Write the config file: `[programs]` entries from `programs`, plus the
    /// mock backend unless `programs` names its own.
    pub fn write_config(&self, programs: &str) {
        let mut body = String::from("[programs]\n");
        body.push_str(programs);
        if !programs.contains("backend") {
            let backend = self.mock_backend();
            body.push_str(&format!("\nbackend = [\"{}\"]\n", backend.display()));
        }
        fs::write(&self.config_path, body).expect("Failed to write config");
    }

    /// An executable script that answers every prompt with a fixed line.
    pub fn mock_backend(&self) -> PathBuf {
        let path = self.root().join("mock-backend.sh");
        if !path.exists() {
            write_script(&path, "#!/bin/sh\necho \"mock response\"\n");
        }
        path
    }

    /// The binary with this layout's environment applied.
    pub fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(bin());
        cmd.args(args)
            .env("AGENT_DATA_DIR", &self.data)
            .env("AGENT_LOG_DIR", &self.logs)
            .env("AGENT_CONFIG_FILE", &self.config_path)
            .env("AGENT_ENV_FILE", &self.env_file)
            .env("HEALTH_CHECK_INTERVAL", "3600")
            .env_remove("GEMINI_API_KEY")
            .env_remove("LOG_LEVEL");
        for var in [
            "AGENT_COMMAND",
            "TASK_COMMAND",
            "WEB_COMMAND",
            "SHELL_COMMAND",
            "BACKEND_COMMAND",
        ] {
            cmd.env_remove(var);
        }
        if self.with_key {
            cmd.env("GEMINI_API_KEY", TEST_KEY);
        }
        cmd
    }

    pub fn run(&self, args: &[&str]) -> Output {
        self.command(args)
            .output()
            .expect("Failed to run gemini-agent")
    }

    pub fn spawn(&self, args: &[&str]) -> Child {
        self.command(args)
            .spawn()
            .expect("Failed to spawn gemini-agent")
    }

    pub fn input_dir(&self) -> PathBuf {
        self.data.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data.join("output")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.data.join("processed")
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs.join("agent.log")
    }

    /// Drop a task file into `input/`, creating the directory if needed.
    pub fn submit_task(&self, file_name: &str, body: &str) -> PathBuf {
        fs::create_dir_all(self.input_dir()).expect("Failed to create input dir");
        let staging = self.root().join(format!("{file_name}.staging"));
        fs::write(&staging, body).expect("Failed to write task");
        let target = self.input_dir().join(file_name);
        fs::rename(&staging, &target).expect("Failed to move task into input");
        target
    }
}

pub fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("Failed to write script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .expect("Failed to chmod script");
}

/// Stub child that records its pid in `pid_file` and then sleeps.
pub fn sleeping_child(pid_file: &Path) -> String {
    format!(
        "[\"/bin/sh\", \"-c\", \"echo $$ > {}; exec sleep 30\"]",
        pid_file.display()
    )
}

/// Poll until `path` exists or `timeout` passes.
pub fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

/// Read a pid written by `sleeping_child`, waiting for it to appear.
pub fn read_pid(path: &Path) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(text) = fs::read_to_string(path) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("pid file {} never appeared", path.display());
}

/// Wait for `child` to exit, killing it if `timeout` passes.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().expect("try_wait failed") {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(50));
    }
    let _ = child.kill();
    let _ = child.wait();
    None
}

pub fn send_signal(pid: u32, signal: libc::c_int) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    assert_eq!(rc, 0, "kill({pid}) failed");
}

pub fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

pub fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}
