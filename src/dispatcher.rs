//! The container entrypoint: initialize, validate, then run one mode.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::environment::{Environment, API_KEY_VAR};
use crate::log::{self, LogLevel};
use crate::supervisor::{ChildSpec, Mode, Phase, Supervisor};
use crate::workspace::Workspace;
use crate::{glog, glog_error, glog_warn, Error, Result};

pub const USAGE: &str = "\
Usage: gemini-agent {agent|task|web|shell} [args...]

Modes:
  agent                Start the autonomous agent loop
  task <description>   Execute a single task and exit
  web                  Start the web interface on port 8080
  shell                Start an interactive shell";

/// A parsed mode request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Agent,
    Task(String),
    Web,
    Shell,
}

impl Request {
    pub fn mode(&self) -> Mode {
        match self {
            Request::Agent => Mode::Agent,
            Request::Task(_) => Mode::Task,
            Request::Web => Mode::Web,
            Request::Shell => Mode::Shell,
        }
    }
}

/// Everything a process needs once the environment has been read: the
/// workspace exists and logging is set up.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub env: Environment,
    pub workspace: Workspace,
}

impl Bootstrap {
    pub fn init(env: Environment) -> Result<Self> {
        let workspace = Workspace::from_env(&env);
        workspace.ensure()?;

        let level = LogLevel::parse(env.get("LOG_LEVEL").unwrap_or("INFO"));
        log::init(&workspace.log_file(), level)?;

        for line in env.skipped() {
            glog_warn!("{} in {}", line, env.env_file_path().display());
        }
        if !env.overrides().is_empty() {
            glog!(
                "Applied overrides from {}: {}",
                env.env_file_path().display(),
                env.overrides().join(", ")
            );
        }

        Ok(Self { env, workspace })
    }

    /// Full configuration for the task programs. Invalid settings are fatal.
    pub fn load_config(&self) -> Result<Config> {
        let config = Config::load(&self.env)?;
        log::set_level(LogLevel::parse(&config.log_level));
        Ok(config)
    }

    pub fn require_credential(&self) -> Result<&str> {
        self.env
            .api_key()
            .ok_or_else(|| Error::MissingCredential(API_KEY_VAR.to_string()))
    }
}

pub struct Dispatcher {
    boot: Bootstrap,
    self_exe: PathBuf,
    supervisor: Supervisor,
}

impl Dispatcher {
    /// The Initializing phase. Prints the startup banner.
    pub fn initialize(env: Environment, self_exe: impl Into<PathBuf>) -> Result<Self> {
        let boot = Bootstrap::init(env)?;
        let started = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "?".to_string());
        for line in [
            format!("Starting Gemini Agent at {started}"),
            format!("Working directory: {cwd}"),
            format!("Data directory: {}", boot.workspace.data_root().display()),
        ] {
            println!("{line}");
            glog!("{}", line);
        }

        Ok(Self {
            boot,
            self_exe: self_exe.into(),
            supervisor: Supervisor::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.supervisor.phase()
    }

    pub fn workspace(&self) -> &Workspace {
        &self.boot.workspace
    }

    /// The Validating phase. A missing credential is fatal.
    pub fn validate(&mut self) -> Result<()> {
        self.supervisor.enter(Phase::Validating)?;
        if let Err(e) = self.boot.require_credential() {
            self.supervisor.enter(Phase::Terminated)?;
            return Err(e);
        }
        glog!("Environment validated");
        Ok(())
    }

    /// Child program for `mode`, with `{self}` resolved.
    pub fn child_spec(&self, mode: Mode) -> Result<ChildSpec> {
        let programs = Config::load_programs(&self.boot.env)?;
        let argv = match mode {
            Mode::Agent => &programs.agent,
            Mode::Task => &programs.task,
            Mode::Web => &programs.web,
            Mode::Shell => &programs.shell,
        };
        ChildSpec::from_argv(mode.as_str(), argv, &self.self_exe)
    }

    /// The Running phase. Returns the dispatcher's exit code.
    pub async fn run(&mut self, request: Request) -> Result<i32> {
        let mode = request.mode();
        let spec = self.child_spec(mode)?;
        self.supervisor.enter(Phase::Running(mode))?;

        let code = match request {
            Request::Task(description) => {
                glog!("Executing single task: {}", description);
                let spec = spec.arg(description);
                self.supervisor
                    .run_to_completion(&spec, &self.boot.env)
                    .await?
            }
            Request::Agent | Request::Web => {
                glog!("Starting {} mode", mode);
                self.supervisor.install_signal_handlers()?;
                let outcome = self
                    .supervisor
                    .supervise(&spec, &self.boot.env, CancellationToken::new())
                    .await?;
                outcome.exit_code()
            }
            Request::Shell => {
                glog!("Starting interactive shell: {}", spec);
                return Err(spec.exec(&self.boot.env));
            }
        };

        self.supervisor.enter(Phase::Terminated)?;
        glog!("Dispatcher exiting with status {}", code);
        Ok(code)
    }
}

/// Run the whole dispatcher lifecycle and map it to a process exit code.
pub async fn dispatch(request: Request, env: Environment, self_exe: &Path) -> i32 {
    let result = async {
        let mut dispatcher = Dispatcher::initialize(env, self_exe)?;
        dispatcher.validate()?;
        dispatcher.run(request).await
    }
    .await;

    match result {
        Ok(code) => code,
        Err(e) => {
            glog_error!("{}", e);
            eprintln!("Error: {e}");
            1
        }
    }
}
