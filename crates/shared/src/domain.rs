use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier the processing service assigns to one extraction job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum TaskStatus {
    Starting,
    Processing,
    Done,
    Error,
    /// Any status this client does not know about is treated as still running.
    Unknown,
}

impl From<String> for TaskStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "starting" => TaskStatus::Starting,
            "processing" => TaskStatus::Processing,
            "done" => TaskStatus::Done,
            "error" => TaskStatus::Error,
            _ => TaskStatus::Unknown,
        }
    }
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Starting => "starting",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
            TaskStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum Plan {
    Free,
    Pro,
    Other,
}

impl From<String> for Plan {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "free" => Plan::Free,
            "pro" => Plan::Pro,
            _ => Plan::Other,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Other => "other",
        };
        f.write_str(name)
    }
}
