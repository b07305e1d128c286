//! Task execution: builds the prompt for a task's type and runs it through
//! the backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::backend::{generate_with_retry, Context, ModelBackend, RetryPolicy};
use crate::task::{ResultRecord, TaskKind, TaskOutcome, TaskRecord};
use crate::workspace::Workspace;
use crate::{glog, glog_error, Result};

/// Characters of a file included in a `file_analysis` prompt.
pub const FILE_EXCERPT_CHARS: usize = 2000;

#[derive(Clone)]
pub struct TaskProcessor {
    backend: Arc<dyn ModelBackend>,
    workspace: Workspace,
    retry: RetryPolicy,
}

impl TaskProcessor {
    pub fn new(backend: Arc<dyn ModelBackend>, workspace: Workspace) -> Self {
        Self {
            backend,
            workspace,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Execute a task. Never fails: problems become a failed outcome.
    pub async fn execute(&self, task: &TaskRecord) -> TaskOutcome {
        glog!("Executing task id={} type={}", task.id, task.kind);

        let outcome = match task.task_kind() {
            TaskKind::Analysis => self.analysis(task).await,
            TaskKind::DataProcessing => self.data_processing(task).await,
            TaskKind::FileAnalysis => self.file_analysis(task).await,
            TaskKind::General => self.generate(&task.task, None).await,
        };

        if outcome.success {
            glog!("Task execution completed id={}", task.id);
        } else {
            glog_error!(
                "Task execution failed id={}: {}",
                task.id,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
        outcome
    }

    /// Execute a task and write its result record to `output/`.
    pub async fn execute_and_save(&self, task: TaskRecord) -> Result<ResultRecord> {
        let outcome = self.execute(&task).await;
        let record = ResultRecord::new(task, outcome);
        self.workspace.write_result(&record).await?;
        Ok(record)
    }

    async fn generate(&self, prompt: &str, context: Option<&Context>) -> TaskOutcome {
        generate_with_retry(self.backend.as_ref(), self.retry, prompt, context).await
    }

    async fn analysis(&self, task: &TaskRecord) -> TaskOutcome {
        let prompt = format!("Analysis Task: {}", task.task);
        let context = context_of([
            ("task_type", json!("analysis")),
            ("priority", json!(task.priority.to_string())),
            ("deadline", json!(task.deadline)),
        ]);
        self.generate(&prompt, Some(&context)).await
    }

    async fn data_processing(&self, task: &TaskRecord) -> TaskOutcome {
        let files = match self.input_files().await {
            Ok(files) => files,
            Err(e) => return TaskOutcome::failure(format!("Failed to list input files: {e}")),
        };
        let listing = files.join(", ");

        let prompt = format!(
            "Data Processing Task: {}\n\n\
             Available data files: {}\n\n\
             Please provide:\n\
             1. Analysis approach\n\
             2. Expected insights\n\
             3. Processing steps\n\
             4. Output format recommendations",
            task.task, listing
        );
        let context = context_of([
            ("task_type", json!("data_processing")),
            ("available_files", json!(listing)),
            ("file_count", json!(files.len())),
        ]);
        self.generate(&prompt, Some(&context)).await
    }

    async fn file_analysis(&self, task: &TaskRecord) -> TaskOutcome {
        let Some(file_path) = task.file_path.as_ref() else {
            return TaskOutcome::failure("No file path specified for file analysis task");
        };
        let path = self.resolve(file_path);
        let analysis_type = task.analysis_type.as_deref().unwrap_or("general");

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => return TaskOutcome::failure(format!("Failed to analyze file: {e}")),
        };
        let excerpt: String = content.chars().take(FILE_EXCERPT_CHARS).collect();

        let prompt = format!(
            "File Analysis Task ({analysis_type}):\n\n\
             File: {}\n\
             Content:\n{excerpt}\n\n\
             Please provide a comprehensive analysis including:\n\
             1. Content summary\n\
             2. Key insights\n\
             3. Data patterns\n\
             4. Recommendations",
            path.display()
        );
        let context = context_of([
            ("task_type", json!("file_analysis")),
            ("analysis_type", json!(analysis_type)),
            ("file_path", json!(path.display().to_string())),
            ("content_length", json!(content.chars().count())),
        ]);
        self.generate(&prompt, Some(&context)).await
    }

    /// Relative paths are taken from the data root.
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.data_root().join(path)
        }
    }

    /// Names of the regular files in `input/`, sorted.
    async fn input_files(&self) -> std::io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(self.workspace.input_dir()).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn context_of<const N: usize>(pairs: [(&str, Value); N]) -> Context {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
