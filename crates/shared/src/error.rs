use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Body the processing service attaches to non-2xx responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorBody {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
        }
    }

    /// The `detail` message, ignoring blank values.
    pub fn message(&self) -> Option<&str> {
        self.detail
            .as_deref()
            .map(str::trim)
            .filter(|detail| !detail.is_empty())
    }
}

#[derive(Debug, Error)]
#[error("service rejected request ({status}): {detail}")]
pub struct ServiceRejection {
    pub status: u16,
    pub detail: String,
}

impl ServiceRejection {
    pub fn new(status: u16, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}
