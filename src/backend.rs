//! Model backend: turns a prompt into a response.
//!
//! The only production backend is `CliBackend`, which shells out to a
//! command-line client (the `gemini` CLI by default). Any failure is folded
//! into a failed `TaskOutcome`; the caller decides what to do with it.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::config::Config;
use crate::task::TaskOutcome;
use crate::{glog, glog_debug, glog_warn, Error};

/// Instructions prepended to every prompt.
pub const SYSTEM_PROMPT: &str = "You are an autonomous AI agent running in a Docker container.
Your role is to complete tasks efficiently and accurately. You have access to:
- File system operations in the data directory
- Various data processing capabilities
- The ability to generate reports and analysis

Always provide detailed, actionable responses. When working with files or data,
be explicit about your actions and results.";

/// Longest rendering of a list or object value in the context section.
const CONTEXT_VALUE_LIMIT: usize = 200;

/// Key/value context rendered into the prompt.
pub type Context = Map<String, Value>;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Model identifier reported in outcomes.
    fn model(&self) -> &str;

    /// Send a fully prepared prompt.
    async fn complete(&self, prompt: &str) -> TaskOutcome;

    /// Prepare `prompt` with the system preamble and `context`, then send it.
    async fn generate(&self, prompt: &str, context: Option<&Context>) -> TaskOutcome {
        let full = prepare_prompt(prompt, context);
        glog!("Generating response, prompt_length={}", full.len());
        self.complete(&full).await
    }
}

/// Build the full prompt: preamble, optional context section, then the task.
pub fn prepare_prompt(prompt: &str, context: Option<&Context>) -> String {
    let context_section = match context {
        Some(ctx) if !ctx.is_empty() => format!("\nContext:\n{}\n", format_context(ctx)),
        _ => String::new(),
    };
    format!("{SYSTEM_PROMPT}{context_section}\nTask: {prompt}")
}

fn format_context(context: &Context) -> String {
    context
        .iter()
        .map(|(key, value)| match value {
            Value::Array(_) | Value::Object(_) => {
                let rendered = value.to_string();
                let truncated: String = rendered.chars().take(CONTEXT_VALUE_LIMIT).collect();
                format!("- {key}: {truncated}...")
            }
            Value::String(s) => format!("- {key}: {s}"),
            other => format!("- {key}: {other}"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Retry schedule for failed generations: `attempts` tries with exponential
/// backoff starting at `base` and capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_secs(4),
            max: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Generate with retries. Returns the last outcome when all attempts fail.
pub async fn generate_with_retry(
    backend: &dyn ModelBackend,
    policy: RetryPolicy,
    prompt: &str,
    context: Option<&Context>,
) -> TaskOutcome {
    let mut attempt = 1;
    loop {
        let outcome = backend.generate(prompt, context).await;
        if outcome.success || attempt >= policy.attempts {
            return outcome;
        }
        let delay = policy.delay(attempt);
        glog_warn!(
            "Generation attempt {}/{} failed ({}), retrying in {:?}",
            attempt,
            policy.attempts,
            outcome.error.as_deref().unwrap_or("unknown error"),
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Backend that runs a command-line client per prompt.
///
/// `{model}` and `{prompt}` in the argv are substituted; without a
/// `{prompt}` placeholder the prompt is appended as the last argument.
#[derive(Debug, Clone)]
pub struct CliBackend {
    argv: Vec<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl CliBackend {
    pub fn new(argv: Vec<String>, model: &str) -> Self {
        let defaults = Config::default();
        Self {
            argv,
            model: model.to_string(),
            temperature: defaults.gemini_temperature,
            max_tokens: defaults.gemini_max_tokens,
            timeout: Duration::from_secs(defaults.task_timeout),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            argv: config.programs.backend.clone(),
            model: config.gemini_model.clone(),
            temperature: config.gemini_temperature,
            max_tokens: config.gemini_max_tokens,
            timeout: Duration::from_secs(config.task_timeout),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The program the backend runs.
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Argv with placeholders substituted for `prompt`.
    pub fn render_args(&self, prompt: &str) -> Vec<String> {
        let has_prompt = self.argv.iter().any(|a| a.contains("{prompt}"));
        let mut args: Vec<String> = self
            .argv
            .iter()
            .skip(1)
            .map(|a| a.replace("{model}", &self.model).replace("{prompt}", prompt))
            .collect();
        if !has_prompt {
            args.push(prompt.to_string());
        }
        args
    }
}

#[async_trait]
impl ModelBackend for CliBackend {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> TaskOutcome {
        let Some(program) = self.program() else {
            return TaskOutcome::failure("backend command is empty").with_model(&self.model);
        };
        glog_debug!("CliBackend::complete program={}", program);

        let result = tokio::time::timeout(
            self.timeout,
            Command::new(program)
                .args(self.render_args(prompt))
                .env("GEMINI_MODEL", &self.model)
                .env("GEMINI_TEMPERATURE", self.temperature.to_string())
                .env("GEMINI_MAX_TOKENS", self.max_tokens.to_string())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return TaskOutcome::failure(format!("failed to run {program}: {e}"))
                    .with_model(&self.model)
            }
            Err(_) => {
                return TaskOutcome::failure(Error::Timeout(self.timeout).to_string())
                    .with_model(&self.model)
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let msg = if stderr.trim().is_empty() {
                format!(
                    "backend exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return TaskOutcome::failure(msg).with_model(&self.model);
        }

        glog!("Response generated, response_length={}", stdout.len());
        TaskOutcome::success(stdout.trim()).with_model(&self.model)
    }
}
