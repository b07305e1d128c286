//! Layered environment: process variables overlaid by an optional
//! `KEY=VALUE` override file.
//!
//! The dispatcher never mutates its own process environment. Instead the
//! merged view is passed around explicitly and handed to every child via
//! `Command::envs`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::Result;

/// Variable naming the override file.
pub const ENV_FILE_VAR: &str = "AGENT_ENV_FILE";

/// Override file used when `AGENT_ENV_FILE` is unset.
pub const DEFAULT_ENV_FILE: &str = "/app/config/.env";

/// The required credential.
pub const API_KEY_VAR: &str = "GEMINI_API_KEY";

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: BTreeMap<String, String>,
    overrides: Vec<String>,
    skipped: Vec<String>,
}

impl Environment {
    /// Snapshot the process environment and apply the override file, if any.
    pub fn capture() -> Result<Self> {
        let mut env = Self::from_vars(std::env::vars());
        let path = env.env_file_path();
        env.load_file(&path)?;
        Ok(env)
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            overrides: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn env_file_path(&self) -> PathBuf {
        PathBuf::from(self.get(ENV_FILE_VAR).unwrap_or(DEFAULT_ENV_FILE))
    }

    /// Overlay the variables defined in `path`. A missing file is not an error.
    ///
    /// This runs before logging is set up, so lines that were ignored are
    /// kept in `skipped` for the caller to report.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(path)?;
        let parsed = parse_env_file(&content);
        for (key, value) in parsed.vars {
            self.overrides.push(key.clone());
            self.vars.insert(key, value);
        }
        self.skipped.extend(parsed.skipped);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Like `get`, but treats an empty value as unset.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    /// Keys that came from the override file, in file order.
    pub fn overrides(&self) -> &[String] {
        &self.overrides
    }

    /// Why each ignored override line was ignored.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn api_key(&self) -> Option<&str> {
        self.non_empty(API_KEY_VAR)
    }
}

/// Parse `KEY=VALUE` lines in the format shells accept for `source`.
///
/// Blank lines and `#` comments are skipped, a leading `export ` is allowed
/// and one level of matching quotes around the value is stripped. Lines
/// without `=` or with an invalid key are skipped and described in `skipped`.
pub fn parse_env_file(content: &str) -> EnvFile {
    let mut vars = Vec::new();
    let mut skipped = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

        let Some((key, value)) = line.split_once('=') else {
            skipped.push(format!("Ignoring override line {}: missing '='", idx + 1));
            continue;
        };
        let key = key.trim();
        if !KEY_RE.is_match(key) {
            skipped.push(format!(
                "Ignoring override line {}: invalid key {:?}",
                idx + 1,
                key
            ));
            continue;
        }

        vars.push((key.to_string(), unquote(value.trim()).to_string()));
    }

    EnvFile { vars, skipped }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    pub vars: Vec<(String, String)>,
    pub skipped: Vec<String>,
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    // Unquoted values end at an inline comment.
    match value.find(" #") {
        Some(pos) => value[..pos].trim_end(),
        None => value,
    }
}
