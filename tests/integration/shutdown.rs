//! Graceful shutdown of the long-running modes.
//!
//! Each test starts the dispatcher with a stub child that records its pid,
//! signals the dispatcher and checks that both are gone.

use std::os::unix::process::CommandExt;
use std::time::Duration;

use crate::fixtures::{
    process_alive, read_pid, send_signal, sleeping_child, wait_with_timeout, TestEnv,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn assert_graceful_shutdown(mode: &str, signal: libc::c_int) {
    let env = TestEnv::new();
    let pid_file = env.root().join(format!("{mode}.pid"));
    env.write_config(&format!("{mode} = {}\n", sleeping_child(&pid_file)));

    let mut dispatcher = env.spawn(&[mode]);
    let child_pid = read_pid(&pid_file);
    assert!(process_alive(child_pid));

    send_signal(dispatcher.id(), signal);

    let status = wait_with_timeout(&mut dispatcher, SHUTDOWN_TIMEOUT)
        .unwrap_or_else(|| panic!("{mode} dispatcher did not exit after signal"));
    assert_eq!(status.code(), Some(0), "{mode} should exit 0 on shutdown");
    assert!(
        !process_alive(child_pid),
        "{mode} child {child_pid} should be gone"
    );
}

#[test]
fn test_agent_sigterm_stops_child() {
    assert_graceful_shutdown("agent", libc::SIGTERM);
}

#[test]
fn test_web_sigterm_stops_child() {
    assert_graceful_shutdown("web", libc::SIGTERM);
}

#[test]
fn test_agent_sigint_stops_child() {
    assert_graceful_shutdown("agent", libc::SIGINT);
}

/// Ctrl-C in a terminal signals the whole foreground group, so the child
/// dies of SIGINT at the same moment the dispatcher hears about it.
#[test]
fn test_group_sigint_is_a_clean_shutdown() {
    for round in 0..10 {
        let env = TestEnv::new();
        let pid_file = env.root().join("web.pid");
        env.write_config(&format!("web = {}\n", sleeping_child(&pid_file)));

        let mut dispatcher = env
            .command(&["web"])
            .process_group(0)
            .spawn()
            .expect("Failed to spawn gemini-agent");
        let child_pid = read_pid(&pid_file);

        let group = dispatcher.id() as libc::pid_t;
        assert_eq!(unsafe { libc::kill(-group, libc::SIGINT) }, 0);

        let status = wait_with_timeout(&mut dispatcher, SHUTDOWN_TIMEOUT)
            .expect("dispatcher should exit after group SIGINT");
        assert_eq!(status.code(), Some(0), "round {round}");
        assert!(!process_alive(child_pid));
    }
}

#[test]
fn test_child_exit_propagates_without_signal() {
    let env = TestEnv::new();
    env.write_config("web = [\"/bin/sh\", \"-c\", \"exit 4\"]\n");

    let mut dispatcher = env.spawn(&["web"]);
    let status = wait_with_timeout(&mut dispatcher, SHUTDOWN_TIMEOUT)
        .expect("dispatcher should exit with its child");
    assert_eq!(status.code(), Some(4));
}

#[test]
fn test_child_trapping_sigterm_exits_cleanly() {
    let env = TestEnv::new();
    let pid_file = env.root().join("agent.pid");
    env.write_config(&format!(
        "agent = [\"/bin/sh\", \"-c\", \"trap 'exit 0' TERM; echo $$ > {}; while true; do sleep 0.1; done\"]\n",
        pid_file.display()
    ));

    let mut dispatcher = env.spawn(&["agent"]);
    let child_pid = read_pid(&pid_file);
    send_signal(dispatcher.id(), libc::SIGTERM);

    let status = wait_with_timeout(&mut dispatcher, SHUTDOWN_TIMEOUT)
        .expect("dispatcher should exit after the child handles SIGTERM");
    assert_eq!(status.code(), Some(0));
    assert!(!process_alive(child_pid));
}
