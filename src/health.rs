//! Health checks for the container.
//!
//! `run_checks` backs the `health` subcommand. The worker also calls it on
//! every health interval, together with `disk_usage` for the data root.

use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::config::Config;
use crate::environment::{Environment, API_KEY_VAR};
use crate::workspace::Workspace;

/// Disk usage above this percentage is reported as a warning.
pub const DISK_USAGE_WARN_PERCENT: f64 = 90.0;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: Option<String>,
}

impl HealthCheck {
    fn pass(name: &'static str) -> Self {
        Self {
            name,
            passed: true,
            detail: None,
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &HealthCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.all_passed() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all_passed() {
            return write!(f, "✅ All health checks passed");
        }
        write!(f, "❌ Health checks failed:")?;
        for check in &self.checks {
            let icon = if check.passed { "✅" } else { "❌" };
            write!(f, "\n  {} {}", icon, check.name)?;
            if let Some(detail) = &check.detail {
                write!(f, " ({})", detail)?;
            }
        }
        Ok(())
    }
}

pub fn check_directories(workspace: &Workspace) -> HealthCheck {
    let missing = workspace.missing();
    if missing.is_empty() {
        HealthCheck::pass("directories")
    } else {
        let list: Vec<_> = missing.iter().map(|p| p.display().to_string()).collect();
        HealthCheck::fail("directories", format!("missing: {}", list.join(", ")))
    }
}

pub fn check_environment(env: &Environment) -> HealthCheck {
    match env.api_key() {
        Some(_) => HealthCheck::pass("environment"),
        None => HealthCheck::fail("environment", format!("{API_KEY_VAR} is not set")),
    }
}

/// The backend program must resolve on PATH (or exist, for explicit paths).
pub fn check_backend(config: &Config) -> HealthCheck {
    match config.programs.backend.first() {
        None => HealthCheck::fail("backend", "backend command is empty"),
        Some(program) => match which::which(program) {
            Ok(_) => HealthCheck::pass("backend"),
            Err(_) => HealthCheck::fail("backend", format!("{program} not found")),
        },
    }
}

pub fn run_checks(workspace: &Workspace, env: &Environment, config: &Config) -> HealthReport {
    HealthReport {
        checks: vec![
            check_directories(workspace),
            check_environment(env),
            check_backend(config),
        ],
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsage {
    pub fn percent_used(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 * 100.0 / self.total_bytes as f64
    }

    pub fn is_low(&self) -> bool {
        self.percent_used() > DISK_USAGE_WARN_PERCENT
    }
}

/// Usage of the filesystem holding `path`.
pub fn disk_usage(path: &Path) -> std::io::Result<DiskUsage> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let fragment = stat.f_frsize as u64;
    Ok(DiskUsage {
        total_bytes: stat.f_blocks as u64 * fragment,
        available_bytes: stat.f_bavail as u64 * fragment,
    })
}
