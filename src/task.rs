//! Task and result records exchanged through the data directories.
//!
//! A task file is a JSON object submitted into `input/`; the result for it
//! lands in `output/<id>_result.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use uuid::Uuid;

use crate::{glog_warn, Error, Result};

/// Fields every task file must carry.
pub const REQUIRED_FIELDS: [&str; 3] = ["id", "task", "type"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Case-insensitive; `normal` is another name for `medium`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" | "normal" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

/// Any priority value is accepted. Unrecognized ones rank as medium.
fn lenient_priority<'de, D>(deserializer: D) -> std::result::Result<Priority, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::String(s) => Priority::parse(s),
        Value::Null => Some(Priority::default()),
        _ => None,
    };
    Ok(parsed.unwrap_or_else(|| {
        glog_warn!("Unrecognized priority {}, using medium", value);
        Priority::default()
    }))
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Category of work; selects the prompt the processor builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Analysis,
    DataProcessing,
    FileAnalysis,
    General,
}

impl TaskKind {
    /// Unknown categories are handled as general tasks.
    pub fn from_type(kind: &str) -> Self {
        match kind {
            "analysis" => TaskKind::Analysis,
            "data_processing" => TaskKind::DataProcessing,
            "file_analysis" => TaskKind::FileAnalysis,
            _ => TaskKind::General,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub task: String,
    #[serde(default, deserialize_with = "lenient_priority")]
    pub priority: Priority,
    /// Passed to the model as given; no date format is imposed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_type: Option<String>,
    /// Fields this crate does not interpret, echoed back in the result.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// The JSON the record was read from, when it came from a file.
    #[serde(skip)]
    pub source: Option<Value>,
}

impl TaskRecord {
    /// A general task with a generated `task-xxxxxxxx` id.
    pub fn general(description: &str) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("task-{}", &id[..8]),
            kind: "general".to_string(),
            task: description.to_string(),
            priority: Priority::default(),
            deadline: None,
            file_path: None,
            analysis_type: None,
            extra: Map::new(),
            source: None,
        }
    }

    pub fn task_kind(&self) -> TaskKind {
        TaskKind::from_type(&self.kind)
    }

    /// Validate raw JSON and convert it into a record.
    pub fn from_value(value: Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidTask("task file is not a JSON object".into()))?;
        let missing: Vec<_> = REQUIRED_FIELDS
            .iter()
            .filter(|f| !obj.contains_key(**f))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidTask(format!(
                "missing required field(s): {}",
                missing.join(", ")
            )));
        }

        let mut record: TaskRecord = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidTask(e.to_string()))?;
        record.source = Some(value);
        if record.id.trim().is_empty() {
            return Err(Error::InvalidTask("id must not be empty".into()));
        }
        if record.id.contains('/') || record.id.contains('\0') {
            return Err(Error::InvalidTask(format!(
                "id {:?} cannot be used as a file name",
                record.id
            )));
        }
        Ok(record)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(s)?)
    }
}

/// What the backend produced for a task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl TaskOutcome {
    pub fn success(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: String,
    /// The submitted task exactly as read, or the generated one.
    pub original_task: Value,
    pub result: TaskOutcome,
    pub timestamp: DateTime<Utc>,
    pub status: ResultStatus,
}

impl ResultRecord {
    pub fn new(task: TaskRecord, result: TaskOutcome) -> Self {
        let status = if result.success {
            ResultStatus::Completed
        } else {
            ResultStatus::Failed
        };
        let original_task = match task.source {
            Some(ref source) => source.clone(),
            None => serde_json::to_value(&task).unwrap_or_default(),
        };
        Self {
            task_id: task.id,
            original_task,
            result,
            timestamp: Utc::now(),
            status,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}_result.json", self.task_id)
    }
}
