//! Child process supervision for the dispatcher.
//!
//! The supervisor owns the single "currently supervised child" slot. The
//! lifecycle it walks through is:
//!
//! Initializing -> Validating -> Running(mode) -> ShuttingDown -> Terminated
//!
//! Shutdown requests arrive as a `CancellationToken` cancelled by the signal
//! listener; the blocking wait on the child races against it.

use std::fmt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::config::SELF_PLACEHOLDER;
use crate::environment::Environment;
use crate::{glog, glog_debug, glog_warn, Error, Result};

/// Operating mode selected by the first command-line argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Agent,
    Task,
    Web,
    Shell,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Agent, Mode::Task, Mode::Web, Mode::Shell];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Agent => "agent",
            Mode::Task => "task",
            Mode::Web => "web",
            Mode::Shell => "shell",
        }
    }

    /// Modes whose child runs until signalled.
    pub fn is_long_running(&self) -> bool {
        matches!(self, Mode::Agent | Mode::Web)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Validating,
    Running(Mode),
    ShuttingDown,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Initializing => write!(f, "initializing"),
            Phase::Validating => write!(f, "validating"),
            Phase::Running(mode) => write!(f, "running({})", mode),
            Phase::ShuttingDown => write!(f, "shutting_down"),
            Phase::Terminated => write!(f, "terminated"),
        }
    }
}

/// A record of a phase transition with timestamp.
#[derive(Debug, Clone)]
pub struct PhaseHistoryEntry {
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
}

/// Tracks the dispatcher's phase and rejects out-of-order transitions.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    current: Phase,
    history: Vec<PhaseHistoryEntry>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            current: Phase::Initializing,
            history: vec![PhaseHistoryEntry {
                phase: Phase::Initializing,
                entered_at: Utc::now(),
            }],
        }
    }
}

impl PhaseTracker {
    /// Valid transitions:
    /// - Initializing -> Validating | Terminated
    /// - Validating -> Running(any) | Terminated
    /// - Running(agent|web) -> ShuttingDown
    /// - Running(any) -> Terminated
    /// - ShuttingDown -> Terminated
    pub fn can_transition(&self, target: Phase) -> bool {
        matches!(
            (self.current, target),
            (Phase::Initializing, Phase::Validating)
                | (Phase::Initializing, Phase::Terminated)
                | (Phase::Validating, Phase::Running(_))
                | (Phase::Validating, Phase::Terminated)
                | (Phase::Running(_), Phase::Terminated)
                | (Phase::ShuttingDown, Phase::Terminated)
        ) || matches!(
            (self.current, target),
            (Phase::Running(mode), Phase::ShuttingDown) if mode.is_long_running()
        )
    }

    pub fn transition(&mut self, target: Phase) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            });
        }
        glog_debug!("Phase {} -> {}", self.current, target);
        self.current = target;
        self.history.push(PhaseHistoryEntry {
            phase: target,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn history(&self) -> &[PhaseHistoryEntry] {
        &self.history
    }
}

/// Program and arguments for a supervised child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ChildSpec {
    /// Build a spec from a configured argv. A leading `{self}` expands to
    /// `self_exe`.
    pub fn from_argv(name: &str, argv: &[String], self_exe: &Path) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::EmptyCommand(name.to_string()))?;
        let program = if program == SELF_PLACEHOLDER {
            self_exe.to_path_buf()
        } else {
            PathBuf::from(program)
        };
        Ok(Self {
            program,
            args: args.to_vec(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn command(&self, env: &Environment) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).envs(env.iter());
        cmd
    }

    /// Replace the current process with this program. Only returns on failure.
    pub fn exec(&self, env: &Environment) -> Error {
        let err = std::process::Command::new(&self.program)
            .args(&self.args)
            .envs(env.iter())
            .exec();
        Error::Spawn {
            program: self.program.display().to_string(),
            source: err,
        }
    }
}

impl fmt::Display for ChildSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Shell-style exit code: the child's code, or 128 + signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

/// Forward SIGTERM to the child in `slot` and wait for it to exit.
///
/// Best-effort: an empty slot or an already exited child is not an error.
/// Returns the child's exit status when one could be observed.
pub async fn terminate_child(slot: &mut Option<Child>) -> Option<ExitStatus> {
    let Some(mut child) = slot.take() else {
        glog_debug!("terminate_child: no child tracked");
        return None;
    };

    match child.try_wait() {
        Ok(Some(status)) => {
            glog_debug!("terminate_child: child already exited ({})", status);
            return Some(status);
        }
        Ok(None) => {}
        Err(e) => glog_warn!("terminate_child: try_wait failed: {}", e),
    }

    // `id()` is None once the child has been reaped, so the pid is still ours.
    if let Some(pid) = child.id() {
        glog!("Forwarding SIGTERM to child {}", pid);
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            glog_warn!(
                "kill({}) failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }

    match child.wait().await {
        Ok(status) => {
            glog!("Child exited after SIGTERM ({})", status);
            Some(status)
        }
        Err(e) => {
            glog_warn!("terminate_child: wait failed: {}", e);
            None
        }
    }
}

/// SIGTERM and SIGINT streams.
///
/// Installing them replaces the default disposition, so a signal that
/// arrives after `install` returns is queued here instead of killing the
/// process.
#[derive(Debug)]
pub struct ShutdownSignals {
    terminate: Signal,
    interrupt: Signal,
}

impl ShutdownSignals {
    pub fn install() -> Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            biased;
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        }
    }

    /// A signal that has already been delivered, without waiting for one.
    pub async fn pending(&mut self) -> Option<&'static str> {
        tokio::time::timeout(Duration::ZERO, self.recv()).await.ok()
    }
}

/// Cancel `token` on the first SIGTERM or SIGINT.
///
/// Handlers are installed before this returns.
pub fn listen_for_shutdown(token: CancellationToken) -> Result<()> {
    let mut signals = ShutdownSignals::install()?;

    tokio::spawn(async move {
        tokio::select! {
            name = signals.recv() => glog!("Received {}", name),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
    Ok(())
}

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The child exited on its own with this code.
    Exited(i32),
    /// A shutdown request was honoured; the dispatcher exits 0.
    ShutDown,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Exited(code) => *code,
            Outcome::ShutDown => 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Supervisor {
    child: Option<Child>,
    phase: PhaseTracker,
    signals: Option<ShutdownSignals>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start supervising an already spawned child.
    pub fn with_child(child: Child) -> Self {
        Self {
            child: Some(child),
            ..Self::default()
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.current()
    }

    pub fn enter(&mut self, phase: Phase) -> Result<()> {
        self.phase.transition(phase)
    }

    /// Treat SIGTERM and SIGINT as shutdown requests from now on.
    ///
    /// Call before spawning, so a signal sent right after the child starts
    /// is not lost.
    pub fn install_signal_handlers(&mut self) -> Result<()> {
        self.signals = Some(ShutdownSignals::install()?);
        Ok(())
    }

    /// Pid of the tracked child, if it is still unreaped.
    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn spawn(&mut self, spec: &ChildSpec, env: &Environment) -> Result<u32> {
        glog!("Launching: {}", spec);
        let child = spec
            .command(env)
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: spec.program.display().to_string(),
                source,
            })?;
        let pid = child.id().unwrap_or_default();
        glog_debug!("Child started with pid {}", pid);
        self.child = Some(child);
        Ok(pid)
    }

    /// Run a child to completion and return its exit code.
    pub async fn run_to_completion(&mut self, spec: &ChildSpec, env: &Environment) -> Result<i32> {
        self.spawn(spec, env)?;
        let Some(child) = self.child.as_mut() else {
            return Ok(0);
        };
        let status = child.wait().await?;
        self.child = None;
        glog!("Child finished ({})", status);
        Ok(exit_code(status))
    }

    /// Spawn a long-running child and block until it exits or `shutdown`
    /// is cancelled. On cancellation the child is terminated first.
    pub async fn supervise(
        &mut self,
        spec: &ChildSpec,
        env: &Environment,
        shutdown: CancellationToken,
    ) -> Result<Outcome> {
        self.spawn(spec, env)?;
        self.wait_or_shutdown(shutdown).await
    }

    /// Block on the tracked child, honouring a shutdown request.
    ///
    /// A shutdown request wins over the child's own exit when both are ready.
    /// This matters when a signal reaches the whole process group: the child
    /// dies of it at the same moment the request arrives here.
    pub async fn wait_or_shutdown(&mut self, shutdown: CancellationToken) -> Result<Outcome> {
        let exited = match self.child.as_mut() {
            Some(child) => tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                name = next_signal(&mut self.signals) => {
                    glog!("Received {}", name);
                    None
                }
                status = child.wait() => Some(status?),
            },
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    name = next_signal(&mut self.signals) => glog!("Received {}", name),
                }
                None
            }
        };

        if let Some(status) = exited {
            self.child = None;
            let late = match self.signals.as_mut() {
                Some(signals) => signals.pending().await,
                None => None,
            };
            if !shutdown.is_cancelled() && late.is_none() {
                glog!("Supervised child exited on its own ({})", status);
                return Ok(Outcome::Exited(exit_code(status)));
            }
            glog!(
                "Child exited ({}) alongside a shutdown request{}",
                status,
                late.map(|name| format!(" ({name})")).unwrap_or_default()
            );
        }

        if let Phase::Running(_) = self.phase() {
            self.enter(Phase::ShuttingDown)?;
        }
        glog!("Shutting down");
        terminate_child(&mut self.child).await;
        Ok(Outcome::ShutDown)
    }
}

async fn next_signal(signals: &mut Option<ShutdownSignals>) -> &'static str {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}
