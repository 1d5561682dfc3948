use super::*;
use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response as AxumResponse},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::domain::{Plan, TaskStatus};
use shared::protocol::TaskOutcome;
use std::sync::Mutex;
use tokio::net::TcpListener;

struct FixedToken(Option<&'static str>);

#[async_trait]
impl TokenProvider for FixedToken {
    async fn bearer_token(&self) -> Option<String> {
        self.0.map(str::to_string)
    }
}

#[derive(Debug, Clone)]
struct ReceivedUpload {
    authorization: Option<String>,
    field_name: String,
    filename: Option<String>,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

#[derive(Clone)]
struct ServerState {
    upload_status: StatusCode,
    upload_body: Value,
    result_polls: Arc<Mutex<u32>>,
    uploads: Arc<Mutex<Vec<ReceivedUpload>>>,
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn handle_upload(
    State(state): State<ServerState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AxumResponse {
    while let Ok(Some(field)) = multipart.next_field().await {
        let field_name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        state.uploads.lock().unwrap().push(ReceivedUpload {
            authorization: bearer(&headers),
            field_name,
            filename,
            content_type,
            bytes,
        });
    }
    (state.upload_status, Json(state.upload_body.clone())).into_response()
}

async fn handle_result(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> AxumResponse {
    if bearer(&headers).as_deref() != Some("Bearer id-token") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if task_id == "missing" {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "no such task"}))).into_response();
    }
    let polls = {
        let mut polls = state.result_polls.lock().unwrap();
        *polls += 1;
        *polls
    };
    if polls < 3 {
        Json(json!({"status": "processing"})).into_response()
    } else {
        Json(json!({"status": "done", "result": {"task": task_id, "total": 42}})).into_response()
    }
}

async fn handle_me(headers: HeaderMap) -> AxumResponse {
    if bearer(&headers).as_deref() != Some("Bearer id-token") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"email": "ann@example.com", "plan": "free", "usage_count": 2})).into_response()
}

async fn handle_checkout() -> Json<Value> {
    Json(json!({"url": "https://checkout.example.com/session/1"}))
}

async fn spawn_service(upload_status: StatusCode, upload_body: Value) -> (String, ServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = ServerState {
        upload_status,
        upload_body,
        result_polls: Arc::new(Mutex::new(0)),
        uploads: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/upload", post(handle_upload))
        .route("/result/:task_id", get(handle_result))
        .route("/me", get(handle_me))
        .route("/create-checkout-session", post(handle_checkout))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn signed_in_client(server_url: &str) -> ServiceClient {
    ServiceClient::new(server_url, Arc::new(FixedToken(Some("id-token"))))
}

#[tokio::test]
async fn upload_sends_multipart_file_with_bearer_token() {
    let (server_url, state) = spawn_service(
        StatusCode::OK,
        json!({"status": "processing", "task_id": "abc"}),
    )
    .await;
    let client = signed_in_client(&server_url);

    let submission = client
        .upload(&UploadFile::pdf("statement.pdf", b"%PDF-1.7".to_vec()))
        .await
        .expect("upload");

    assert_eq!(
        submission,
        Submission::Deferred {
            task_id: TaskId::new("abc"),
            status: TaskStatus::Processing,
        }
    );
    let uploads = state.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].authorization.as_deref(), Some("Bearer id-token"));
    assert_eq!(uploads[0].field_name, "file");
    assert_eq!(uploads[0].filename.as_deref(), Some("statement.pdf"));
    assert_eq!(uploads[0].content_type.as_deref(), Some("application/pdf"));
    assert_eq!(uploads[0].bytes, b"%PDF-1.7");
}

#[tokio::test]
async fn upload_returning_result_directly_is_terminal() {
    let (server_url, _) = spawn_service(StatusCode::OK, json!({"transactions": [1, 2]})).await;
    let client = signed_in_client(&server_url);

    let submission = client
        .upload(&UploadFile::pdf("statement.pdf", b"%PDF".to_vec()))
        .await
        .expect("upload");

    assert_eq!(
        submission,
        Submission::Terminal(TaskOutcome::Done(json!({"transactions": [1, 2]})))
    );
}

#[tokio::test]
async fn upload_rejection_surfaces_service_detail() {
    let (server_url, _) = spawn_service(
        StatusCode::FORBIDDEN,
        json!({"detail": "quota exceeded"}),
    )
    .await;
    let client = signed_in_client(&server_url);

    let err = client
        .upload(&UploadFile::pdf("statement.pdf", b"%PDF".to_vec()))
        .await
        .expect_err("rejected");

    assert_eq!(err.to_string(), "quota exceeded");
    match err {
        ClientError::ServiceRejected(rejection) => assert_eq!(rejection.status, 403),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn upload_failure_without_detail_uses_generic_message() {
    let (server_url, _) =
        spawn_service(StatusCode::INTERNAL_SERVER_ERROR, json!({"oops": true})).await;
    let client = signed_in_client(&server_url);

    let err = client
        .upload(&UploadFile::pdf("statement.pdf", b"%PDF".to_vec()))
        .await
        .expect_err("failed");

    assert!(matches!(err, ClientError::TransportFailure { .. }));
    assert_eq!(err.to_string(), UPLOAD_FAILED_MESSAGE);
}

#[tokio::test]
async fn processing_without_task_id_is_invalid() {
    let (server_url, _) = spawn_service(StatusCode::OK, json!({"status": "processing"})).await;
    let client = signed_in_client(&server_url);

    let err = client
        .upload(&UploadFile::pdf("statement.pdf", b"%PDF".to_vec()))
        .await
        .expect_err("invalid");

    assert!(matches!(err, ClientError::InvalidResponse(_)));
}

#[tokio::test]
async fn missing_token_fails_before_any_request() {
    let (server_url, state) = spawn_service(StatusCode::OK, json!({"total": 1})).await;
    let client = ServiceClient::new(server_url, Arc::new(FixedToken(None)));

    let err = client
        .upload(&UploadFile::pdf("statement.pdf", b"%PDF".to_vec()))
        .await
        .expect_err("unauthenticated");
    assert!(err.is_unauthenticated());
    assert!(client.profile().await.expect_err("profile").is_unauthenticated());
    assert!(state.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn result_endpoint_reports_status_and_generic_failure() {
    let (server_url, _) = spawn_service(StatusCode::OK, json!({})).await;
    let client = signed_in_client(&server_url);

    let first = client
        .task_result(&TaskId::new("abc"))
        .await
        .expect("result");
    assert_eq!(first.status, TaskStatus::Processing);
    assert!(first.result.is_none());

    let err = client
        .task_result(&TaskId::new("missing"))
        .await
        .expect_err("not found");
    assert_eq!(err.to_string(), RESULT_FAILED_MESSAGE);
}

#[tokio::test]
async fn profile_and_checkout_decode() {
    let (server_url, _) = spawn_service(StatusCode::OK, json!({})).await;
    let client = signed_in_client(&format!("{server_url}/"));

    let profile = client.profile().await.expect("profile");
    assert_eq!(profile.email, "ann@example.com");
    assert_eq!(profile.plan, Plan::Free);
    assert_eq!(profile.usage_count, 2);

    let session = client.create_checkout_session().await.expect("checkout");
    assert_eq!(
        session.redirect_target(),
        Some("https://checkout.example.com/session/1")
    );
}

#[tokio::test]
async fn controller_follows_task_over_http() {
    let (server_url, state) = spawn_service(
        StatusCode::OK,
        json!({"status": "processing", "task_id": "abc"}),
    )
    .await;
    let client = Arc::new(signed_in_client(&server_url));
    let controller = UploadController::with_poll_interval(
        client.clone(),
        client,
        Duration::from_millis(20),
    )
    .expect("controller");

    let snapshot = controller
        .submit(UploadFile::pdf("statement.pdf", b"%PDF".to_vec()))
        .await
        .expect("submit");
    assert_eq!(snapshot.phase, Phase::Polling);
    assert_eq!(snapshot.task_id, Some(TaskId::new("abc")));

    let result = tokio::time::timeout(Duration::from_secs(5), controller.wait_for_completion())
        .await
        .expect("completes in time")
        .expect("task done");

    assert_eq!(result, json!({"task": "abc", "total": 42}));
    assert_eq!(*state.result_polls.lock().unwrap(), 3);
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.phase, Phase::Succeeded);
    assert_eq!(
        snapshot.profile.map(|profile| profile.usage_count),
        Some(2)
    );
}
