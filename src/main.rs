use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use gemini_agent::backend::CliBackend;
use gemini_agent::config::Config;
use gemini_agent::dispatcher::{dispatch, Bootstrap, Request, USAGE};
use gemini_agent::environment::Environment;
use gemini_agent::health::run_checks;
use gemini_agent::intake::AgentLoop;
use gemini_agent::processor::TaskProcessor;
use gemini_agent::supervisor::listen_for_shutdown;
use gemini_agent::task::{ResultStatus, TaskRecord};
use gemini_agent::workspace::Workspace;
use gemini_agent::{glog, glog_error, Result};

/// Gemini agent container entrypoint
#[derive(Parser, Debug)]
#[command(name = "gemini-agent")]
#[command(version, about, long_about = None, disable_help_subcommand = true)]
#[command(after_help = "ENVIRONMENT:\n    GEMINI_API_KEY   Required for every mode\n    LOG_LEVEL        ERROR|WARN|INFO|DEBUG|TRACE (default INFO)")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start the autonomous agent loop
    Agent,

    /// Execute a single task and exit
    Task {
        /// The task description
        #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
        description: Vec<String>,
    },

    /// Start the web interface on port 8080
    Web,

    /// Start an interactive shell
    Shell,

    /// Run the agent loop in this process (launched by `agent`)
    #[command(hide = true)]
    Worker,

    /// Execute one task in this process (launched by `task`)
    #[command(hide = true, name = "run-task")]
    RunTask {
        #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
        description: Vec<String>,
    },

    /// Check directories, credential and backend availability
    Health,
}

fn main() {
    // Help and version flags are not modes either.
    let Ok(cli) = Cli::try_parse() else {
        usage_exit();
    };
    let Some(command) = cli.command else {
        usage_exit();
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(command));
    std::process::exit(code);
}

fn usage_exit() -> ! {
    println!("{USAGE}");
    std::process::exit(1);
}

async fn run(command: Command) -> i32 {
    let request = match command {
        Command::Agent => Request::Agent,
        Command::Task { description } => Request::Task(description.join(" ")),
        Command::Web => Request::Web,
        Command::Shell => Request::Shell,
        Command::Worker => return report(run_worker().await),
        Command::RunTask { description } => return report(run_task(description.join(" ")).await),
        Command::Health => return report(run_health()),
    };

    let env = match Environment::capture() {
        Ok(env) => env,
        Err(e) => return report(Err(e)),
    };
    dispatch(request, env, &self_exe()).await
}

fn report(result: Result<i32>) -> i32 {
    result.unwrap_or_else(|e| {
        glog_error!("{}", e);
        eprintln!("Error: {e}");
        1
    })
}

fn self_exe() -> PathBuf {
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("gemini-agent"))
}

fn processor_for(boot: &Bootstrap, config: &Config) -> TaskProcessor {
    let backend = Arc::new(CliBackend::from_config(config));
    TaskProcessor::new(backend, boot.workspace.clone())
}

async fn run_worker() -> Result<i32> {
    let boot = Bootstrap::init(Environment::capture()?)?;
    boot.require_credential()?;
    let config = boot.load_config()?;
    glog!(
        "Worker starting: model={}, max_concurrent_tasks={}",
        config.gemini_model,
        config.max_concurrent_tasks
    );

    let shutdown = CancellationToken::new();
    listen_for_shutdown(shutdown.clone())?;

    let processor = processor_for(&boot, &config);
    AgentLoop::new(processor, boot.env, config)
        .run(shutdown)
        .await?;
    Ok(0)
}

async fn run_task(description: String) -> Result<i32> {
    let boot = Bootstrap::init(Environment::capture()?)?;
    boot.require_credential()?;
    let config = boot.load_config()?;

    let task = TaskRecord::general(&description);
    glog!("Running single task {}: {}", task.id, description);
    let record = processor_for(&boot, &config)
        .execute_and_save(task)
        .await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    Ok(match record.status {
        ResultStatus::Completed => 0,
        ResultStatus::Failed => 1,
    })
}

fn run_health() -> Result<i32> {
    let env = Environment::capture()?;
    let workspace = Workspace::from_env(&env);
    let config = Config::load(&env)?;
    let report = run_checks(&workspace, &env, &config);
    println!("{report}");
    Ok(report.exit_code())
}
