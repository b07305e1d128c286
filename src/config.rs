use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use crate::environment::Environment;
use crate::{glog_debug, Error, Result};

/// Variable naming the TOML config file.
pub const CONFIG_FILE_VAR: &str = "AGENT_CONFIG_FILE";

/// Config file used when `AGENT_CONFIG_FILE` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "/app/config/config.toml";

/// Placeholder in a program argv that expands to the running executable.
pub const SELF_PLACEHOLDER: &str = "{self}";

/// Port the web interface binds to on all interfaces.
pub const WEB_PORT: u16 = 8080;

/// Argv for each program the dispatcher or worker may launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Programs {
    pub agent: Vec<String>,
    pub task: Vec<String>,
    pub web: Vec<String>,
    pub shell: Vec<String>,
    /// Prompt-to-response program. `{model}` and `{prompt}` are substituted.
    pub backend: Vec<String>,
}

impl Default for Programs {
    fn default() -> Self {
        let port = WEB_PORT.to_string();
        Self {
            agent: argv(&[SELF_PLACEHOLDER, "worker"]),
            task: argv(&[SELF_PLACEHOLDER, "run-task"]),
            web: argv(&["web-interface", "--host", "0.0.0.0", "--port", &port]),
            shell: argv(&["/bin/bash"]),
            backend: argv(&["gemini", "--model", "{model}", "--prompt", "{prompt}"]),
        }
    }
}

impl Programs {
    /// `*_COMMAND` variables replace an argv, split on whitespace.
    pub fn apply_env(&mut self, env: &Environment) {
        for (var, slot) in [
            ("AGENT_COMMAND", &mut self.agent),
            ("TASK_COMMAND", &mut self.task),
            ("WEB_COMMAND", &mut self.web),
            ("SHELL_COMMAND", &mut self.shell),
            ("BACKEND_COMMAND", &mut self.backend),
        ] {
            if let Some(v) = env.non_empty(var) {
                *slot = v.split_whitespace().map(str::to_string).collect();
            }
        }
    }
}

/// The config file as the dispatcher sees it: only `[programs]` is read.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProgramsFile {
    programs: Programs,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gemini_model: String,
    pub gemini_temperature: f32,
    pub gemini_max_tokens: u32,
    pub log_level: String,
    /// Seconds between worker health checks.
    pub health_check_interval: u64,
    pub max_concurrent_tasks: usize,
    /// Seconds a single backend invocation may run.
    pub task_timeout: u64,
    pub programs: Programs,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemini_model: "gemini-2.0-flash-lite".to_string(),
            gemini_temperature: 0.7,
            gemini_max_tokens: 2048,
            log_level: "INFO".to_string(),
            health_check_interval: 30,
            max_concurrent_tasks: 5,
            task_timeout: 600,
            programs: Programs::default(),
        }
    }
}

impl Config {
    pub fn config_path(env: &Environment) -> PathBuf {
        expand_tilde(env.get(CONFIG_FILE_VAR).unwrap_or(DEFAULT_CONFIG_FILE))
    }

    /// Load the TOML file (if present), then apply environment overrides.
    pub fn load(env: &Environment) -> Result<Self> {
        let path = Self::config_path(env);
        glog_debug!("Config::load path={}", path.display());
        let mut config = if path.exists() {
            toml::from_str(&fs::read_to_string(&path)?)?
        } else {
            glog_debug!("Config file not found, using defaults");
            Self::default()
        };
        config.apply_env(env)?;
        config.validate()?;
        glog_debug!(
            "Config loaded: model={}, temperature={}, max_tokens={}, max_concurrent_tasks={}",
            config.gemini_model,
            config.gemini_temperature,
            config.gemini_max_tokens,
            config.max_concurrent_tasks
        );
        Ok(config)
    }

    /// Load only the program table. The model and tuning settings belong to
    /// the task programs, so they are neither parsed nor validated here.
    pub fn load_programs(env: &Environment) -> Result<Programs> {
        let path = Self::config_path(env);
        let mut programs = if path.exists() {
            toml::from_str::<ProgramsFile>(&fs::read_to_string(&path)?)?.programs
        } else {
            Programs::default()
        };
        programs.apply_env(env);
        Ok(programs)
    }

    pub fn apply_env(&mut self, env: &Environment) -> Result<()> {
        if let Some(v) = env.non_empty("GEMINI_MODEL") {
            self.gemini_model = v.to_string();
        }
        if let Some(v) = env.non_empty("LOG_LEVEL") {
            self.log_level = v.to_string();
        }
        set_parsed(env, "GEMINI_TEMPERATURE", &mut self.gemini_temperature)?;
        set_parsed(env, "GEMINI_MAX_TOKENS", &mut self.gemini_max_tokens)?;
        set_parsed(env, "HEALTH_CHECK_INTERVAL", &mut self.health_check_interval)?;
        set_parsed(env, "MAX_CONCURRENT_TASKS", &mut self.max_concurrent_tasks)?;
        set_parsed(env, "TASK_TIMEOUT", &mut self.task_timeout)?;

        self.programs.apply_env(env);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.gemini_temperature) {
            return Err(Error::Config(format!(
                "gemini_temperature must be between 0 and 2, got {}",
                self.gemini_temperature
            )));
        }
        if self.gemini_max_tokens == 0 {
            return Err(Error::Config("gemini_max_tokens must be positive".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(Error::Config("max_concurrent_tasks must be positive".into()));
        }
        if self.health_check_interval == 0 {
            return Err(Error::Config("health_check_interval must be positive".into()));
        }
        Ok(())
    }
}

fn set_parsed<T: FromStr>(env: &Environment, var: &str, slot: &mut T) -> Result<()> {
    if let Some(raw) = env.non_empty(var) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{var} has an invalid value: {raw:?}")))?;
    }
    Ok(())
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
