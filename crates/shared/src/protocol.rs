use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{Plan, TaskId, TaskStatus};

/// Submissions a free account may make before new uploads are refused.
pub const FREE_PLAN_USAGE_LIMIT: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("upload response reported status `{status}` without a task_id")]
    MissingTaskId { status: TaskStatus },
    #[error("upload response task_id must be a non-empty string")]
    InvalidTaskId,
}

/// Final payload of a task, passed through verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Done(Value),
    Failed(Value),
}

impl TaskOutcome {
    pub fn payload(&self) -> &Value {
        match self {
            TaskOutcome::Done(payload) | TaskOutcome::Failed(payload) => payload,
        }
    }

    pub fn into_payload(self) -> Value {
        match self {
            TaskOutcome::Done(payload) | TaskOutcome::Failed(payload) => payload,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Done(_) => TaskStatus::Done,
            TaskOutcome::Failed(_) => TaskStatus::Error,
        }
    }
}

/// What `POST /upload` handed back: either the finished result or a task to poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Deferred { task_id: TaskId, status: TaskStatus },
    Terminal(TaskOutcome),
}

impl Submission {
    /// Classifies an upload response body.
    ///
    /// A body carrying a non-terminal `status` must also carry a `task_id`.
    /// Terminal bodies unwrap their `result` field when one is present and are
    /// otherwise kept whole. Bodies without a recognised status are results.
    pub fn from_upload_body(body: Value) -> Result<Self, ProtocolError> {
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .map(|status| TaskStatus::from(status.to_string()));

        match status {
            Some(status @ (TaskStatus::Starting | TaskStatus::Processing)) => {
                let task_id = match body.get("task_id") {
                    None | Some(Value::Null) => {
                        return Err(ProtocolError::MissingTaskId { status });
                    }
                    Some(Value::String(task_id)) if !task_id.trim().is_empty() => {
                        TaskId::new(task_id.clone())
                    }
                    Some(_) => return Err(ProtocolError::InvalidTaskId),
                };
                Ok(Submission::Deferred { task_id, status })
            }
            Some(TaskStatus::Done) => Ok(Submission::Terminal(TaskOutcome::Done(
                unwrap_result(body),
            ))),
            Some(TaskStatus::Error) => Ok(Submission::Terminal(TaskOutcome::Failed(
                unwrap_result(body),
            ))),
            Some(TaskStatus::Unknown) | None => {
                if let Some(Value::String(task_id)) = body.get("task_id") {
                    if !task_id.trim().is_empty() {
                        return Ok(Submission::Deferred {
                            task_id: TaskId::new(task_id.clone()),
                            status: TaskStatus::Unknown,
                        });
                    }
                }
                Ok(Submission::Terminal(TaskOutcome::Done(body)))
            }
        }
    }
}

fn unwrap_result(mut body: Value) -> Value {
    match body.get_mut("result") {
        Some(result) => result.take(),
        None => body,
    }
}

/// Body of `GET /result/{task_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultResponse {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl TaskResultResponse {
    pub fn into_outcome(self) -> Option<TaskOutcome> {
        match self.status {
            TaskStatus::Done => Some(TaskOutcome::Done(self.result.unwrap_or(Value::Null))),
            TaskStatus::Error => Some(TaskOutcome::Failed(self.result.unwrap_or(Value::Null))),
            TaskStatus::Starting | TaskStatus::Processing | TaskStatus::Unknown => None,
        }
    }
}

/// Body of `GET /me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub email: String,
    pub plan: Plan,
    #[serde(default)]
    pub usage_count: u32,
}

impl Profile {
    pub fn offers_upgrade(&self) -> bool {
        self.plan == Plan::Free
    }

    pub fn quota_exhausted(&self) -> bool {
        self.plan == Plan::Free && self.usage_count >= FREE_PLAN_USAGE_LIMIT
    }
}

/// Body of `POST /create-checkout-session`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl CheckoutSession {
    /// Where the user should be sent to pay: the hosted URL, else the session id.
    pub fn redirect_target(&self) -> Option<&str> {
        self.url
            .as_deref()
            .filter(|url| !url.is_empty())
            .or_else(|| self.session_id.as_deref().filter(|id| !id.is_empty()))
    }
}
