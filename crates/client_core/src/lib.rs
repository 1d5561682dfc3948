use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, Response,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::TaskId,
    error::ErrorBody,
    protocol::{CheckoutSession, Profile, Submission, TaskResultResponse},
};
use tracing::{debug, warn};

pub mod auth;
pub mod controller;
pub mod error;
pub mod export;
pub mod settings;

pub use auth::{AuthSession, SignInState, TokenProvider};
pub use controller::{ControllerEvent, ControllerSnapshot, Phase, UploadController};
pub use error::{ClientError, ClientResult};
pub use settings::ClientSettings;

use error::{
    CHECKOUT_FAILED_MESSAGE, PROFILE_FAILED_MESSAGE, RESULT_FAILED_MESSAGE, UPLOAD_FAILED_MESSAGE,
};

const PDF_MIME_TYPE: &str = "application/pdf";

/// A file picked by the user, held in memory until it is uploaded.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: None,
            bytes,
        }
    }

    pub fn pdf(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: Some(PDF_MIME_TYPE.to_string()),
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn mime_type(&self) -> &str {
        self.mime_type.as_deref().unwrap_or(PDF_MIME_TYPE)
    }
}

#[async_trait]
pub trait ProcessingService: Send + Sync {
    async fn upload(&self, file: &UploadFile) -> ClientResult<Submission>;
    async fn task_result(&self, task_id: &TaskId) -> ClientResult<TaskResultResponse>;
}

#[async_trait]
pub trait ProfileService: Send + Sync {
    async fn profile(&self) -> ClientResult<Profile>;
}

#[async_trait]
pub trait BillingService: Send + Sync {
    async fn create_checkout_session(&self) -> ClientResult<CheckoutSession>;
}

/// HTTP client for the processing, profile and billing endpoints.
pub struct ServiceClient {
    http: Client,
    api_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl ServiceClient {
    pub fn new(api_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_http(Client::new(), api_url, tokens)
    }

    pub fn with_http(
        http: Client,
        api_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let api_url = api_url.into();
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    pub fn from_settings(
        settings: &ClientSettings,
        tokens: Arc<dyn TokenProvider>,
    ) -> ClientResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|err| ClientError::transport_with("failed to build http client", err))?;
        Ok(Self::with_http(http, settings.api_url.clone(), tokens))
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    async fn bearer(&self) -> ClientResult<String> {
        self.tokens
            .bearer_token()
            .await
            .filter(|token| !token.is_empty())
            .ok_or(ClientError::Unauthenticated)
    }

    async fn decode<T: DeserializeOwned>(response: Response, context: &str) -> ClientResult<T> {
        response
            .json()
            .await
            .map_err(|err| ClientError::transport_with(context, err))
    }
}

/// Non-2xx on endpoints whose errors carry no contract: always the generic message.
fn generic_failure(response: &Response, endpoint: &str, context: &str) -> ClientError {
    warn!(
        endpoint,
        status = response.status().as_u16(),
        "service call failed"
    );
    ClientError::transport(context)
}

/// Non-2xx from `/upload`: prefer the service's `detail`, else the generic message.
async fn upload_failure(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let body = response.json::<ErrorBody>().await.unwrap_or_default();
    match body.message() {
        Some(detail) => {
            warn!(status, detail, "upload rejected by service");
            ClientError::rejected(status, detail)
        }
        None => {
            warn!(status, "upload failed without detail");
            ClientError::transport(UPLOAD_FAILED_MESSAGE)
        }
    }
}

#[async_trait]
impl ProcessingService for ServiceClient {
    async fn upload(&self, file: &UploadFile) -> ClientResult<Submission> {
        let token = self.bearer().await?;
        let part = Part::bytes(file.bytes.clone())
            .file_name(file.filename.clone())
            .mime_str(file.mime_type())
            .map_err(|err| ClientError::transport_with(UPLOAD_FAILED_MESSAGE, err))?;
        let form = Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{}/upload", self.api_url))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .map_err(|err| ClientError::transport_with(UPLOAD_FAILED_MESSAGE, err))?;
        if !response.status().is_success() {
            return Err(upload_failure(response).await);
        }

        let body: Value = Self::decode(response, UPLOAD_FAILED_MESSAGE).await?;
        let submission = Submission::from_upload_body(body)?;
        debug!(filename = %file.filename, ?submission, "upload accepted");
        Ok(submission)
    }

    async fn task_result(&self, task_id: &TaskId) -> ClientResult<TaskResultResponse> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/result/{}", self.api_url, task_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| ClientError::transport_with(RESULT_FAILED_MESSAGE, err))?;
        if !response.status().is_success() {
            return Err(generic_failure(&response, "result", RESULT_FAILED_MESSAGE));
        }
        Self::decode(response, RESULT_FAILED_MESSAGE).await
    }
}

#[async_trait]
impl ProfileService for ServiceClient {
    async fn profile(&self) -> ClientResult<Profile> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/me", self.api_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| ClientError::transport_with(PROFILE_FAILED_MESSAGE, err))?;
        if !response.status().is_success() {
            return Err(generic_failure(&response, "me", PROFILE_FAILED_MESSAGE));
        }
        Self::decode(response, PROFILE_FAILED_MESSAGE).await
    }
}

#[async_trait]
impl BillingService for ServiceClient {
    async fn create_checkout_session(&self) -> ClientResult<CheckoutSession> {
        let token = self.bearer().await?;
        let response = self
            .http
            .post(format!("{}/create-checkout-session", self.api_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| ClientError::transport_with(CHECKOUT_FAILED_MESSAGE, err))?;
        if !response.status().is_success() {
            return Err(generic_failure(
                &response,
                "create-checkout-session",
                CHECKOUT_FAILED_MESSAGE,
            ));
        }
        Self::decode(response, CHECKOUT_FAILED_MESSAGE).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
