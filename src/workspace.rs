//! Fixed directory layout shared by the dispatcher and the task programs.
//!
//! ```text
//! <data>/input/       task files waiting to be processed
//! <data>/output/      <task-id>_result.json files
//! <data>/temp/        scratch space; results are staged here
//! <data>/processed/   archived task files
//! <logs>/agent.log
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::expand_tilde;
use crate::environment::Environment;
use crate::task::ResultRecord;
use crate::{glog, glog_debug, Result};

pub const DATA_DIR_VAR: &str = "AGENT_DATA_DIR";
pub const LOG_DIR_VAR: &str = "AGENT_LOG_DIR";
pub const DEFAULT_DATA_DIR: &str = "/app/data";
pub const DEFAULT_LOG_DIR: &str = "/app/logs";
pub const LOG_FILE_NAME: &str = "agent.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    data_root: PathBuf,
    logs_root: PathBuf,
}

impl Workspace {
    pub fn new(data_root: impl Into<PathBuf>, logs_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            logs_root: logs_root.into(),
        }
    }

    pub fn from_env(env: &Environment) -> Self {
        Self::new(
            expand_tilde(env.non_empty(DATA_DIR_VAR).unwrap_or(DEFAULT_DATA_DIR)),
            expand_tilde(env.non_empty(LOG_DIR_VAR).unwrap_or(DEFAULT_LOG_DIR)),
        )
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn logs_root(&self) -> &Path {
        &self.logs_root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.data_root.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_root.join("output")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.data_root.join("temp")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.data_root.join("processed")
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs_root.join(LOG_FILE_NAME)
    }

    pub fn result_path(&self, task_id: &str) -> PathBuf {
        self.output_dir().join(format!("{task_id}_result.json"))
    }

    fn data_dirs(&self) -> [PathBuf; 4] {
        [
            self.input_dir(),
            self.output_dir(),
            self.temp_dir(),
            self.processed_dir(),
        ]
    }

    /// Create every directory of the layout. Existing ones are left alone.
    pub fn ensure(&self) -> Result<()> {
        for dir in self.data_dirs().iter().chain([&self.logs_root]) {
            if !dir.exists() {
                glog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// Directories the task programs need that are absent.
    pub fn missing(&self) -> Vec<PathBuf> {
        [
            self.input_dir(),
            self.output_dir(),
            self.processed_dir(),
            self.logs_root.clone(),
        ]
        .into_iter()
        .filter(|d| !d.is_dir())
        .collect()
    }

    /// Write `record` to `output/<id>_result.json`.
    ///
    /// The file is staged in `temp/` and renamed into place, so readers of
    /// `output/` never observe a partially written result.
    pub async fn write_result(&self, record: &ResultRecord) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(record)?;
        let staged = self.temp_dir().join(format!("{}.partial", record.file_name()));
        let target = self.result_path(&record.task_id);
        tokio::fs::write(&staged, json).await?;
        tokio::fs::rename(&staged, &target).await?;
        glog!("Task result saved: {}", target.display());
        Ok(target)
    }

    /// Move a handled task file into `processed/`, keeping its file name.
    pub async fn archive(&self, task_file: &Path) -> Result<PathBuf> {
        let name = task_file.file_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a file path: {}", task_file.display()),
            )
        })?;
        let destination = self.processed_dir().join(name);
        tokio::fs::rename(task_file, &destination).await?;
        glog_debug!(
            "Archived {} -> {}",
            task_file.display(),
            destination.display()
        );
        Ok(destination)
    }
}
