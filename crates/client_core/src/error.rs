use serde_json::Value;
use shared::{error::ServiceRejection, protocol::ProtocolError};
use thiserror::Error;

pub const UPLOAD_FAILED_MESSAGE: &str = "File upload failed.";
pub const RESULT_FAILED_MESSAGE: &str = "Failed to fetch the task result.";
pub const PROFILE_FAILED_MESSAGE: &str = "Failed to fetch the profile.";
pub const CHECKOUT_FAILED_MESSAGE: &str = "Failed to create a checkout session.";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("user is not signed in")]
    Unauthenticated,
    /// Network failure or a non-2xx answer without a usable `detail`.
    #[error("{message}")]
    TransportFailure {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },
    #[error("{}", .0.detail)]
    ServiceRejected(ServiceRejection),
    #[error("document processing failed")]
    ProcessingFailed(Value),
    #[error("unexpected response from service: {0}")]
    InvalidResponse(#[from] ProtocolError),
    #[error("selected file is empty")]
    EmptyFile,
    #[error("no file selected")]
    NoFileSelected,
    #[error("no submission in progress")]
    NoActiveTask,
    #[error("poll interval must be greater than zero")]
    InvalidPollInterval,
}

impl ClientError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn transport_with(message: impl Into<String>, source: reqwest::Error) -> Self {
        Self::TransportFailure {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn rejected(status: u16, detail: impl Into<String>) -> Self {
        Self::ServiceRejected(ServiceRejection::new(status, detail))
    }

    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, ClientError::Unauthenticated)
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
