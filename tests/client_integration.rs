use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    Router,
};
use courier_http::{
    CancelToken, ClientOptions, CourierClient, CourierError, ErrorBody, MultipartForm, Payload,
    Progress, RequestOptions, ReqwestTransport, ResponseData, ResponseType, ThrottlePolicy,
};
use serde_json::{json, Value as JsonValue};

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    content_type: &'static str,
    body: String,
    delay: Duration,
}

impl MockResponse {
    fn json(status: StatusCode, body: JsonValue) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
            delay: Duration::from_millis(0),
        }
    }

    fn text(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.to_owned(),
            delay: Duration::from_millis(0),
        }
    }

    fn with_content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = content_type;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct RecordedRequest {
    method: Method,
    uri: String,
    content_type: Option<String>,
    body: Bytes,
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    hits: Arc<AtomicUsize>,
}

async fn mock_handler(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state
        .requests
        .lock()
        .expect("request log mutex must not be poisoned")
        .push(RecordedRequest {
            method,
            uri: uri.to_string(),
            content_type: headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned),
            body,
        });

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| {
            MockResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "no mock response available"}),
            )
        })
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    (
        response.status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn client(&self) -> CourierClient {
        CourierClient::new(&self.base_url)
            .expect("mock base url must be valid")
            .with_options(ClientOptions {
                throttle: ThrottlePolicy::disabled(),
                ..ClientOptions::default()
            })
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        requests: Arc::new(Mutex::new(Vec::new())),
        hits: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .fallback(mock_handler)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        requests: state.requests,
        task,
    }
}

#[tokio::test]
async fn get_sends_query_params_and_decodes_json() -> anyhow::Result<()> {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::OK,
        json!([{"id": 1, "name": "Kit"}]),
    )])
    .await;

    let data = server
        .client()
        .get(
            "/users",
            RequestOptions::new().param("page", 1).param("limit", 10),
        )
        .await?;

    assert_eq!(data, ResponseData::Json(json!([{"id": 1, "name": "Kit"}])));
    let requests = server.requests();
    assert_eq!(requests[0].method, Method::GET);
    assert_eq!(requests[0].uri, "/users?page=1&limit=10");
    Ok(())
}

#[tokio::test]
async fn post_json_payload_declares_content_type() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::CREATED,
        json!({"id": 42}),
    )])
    .await;

    #[derive(serde::Deserialize)]
    struct Created {
        id: u64,
    }

    let created: Created = server
        .client()
        .post(
            "/users",
            Payload::json(&json!({"name": "Kit"})).unwrap(),
            RequestOptions::new(),
        )
        .await
        .and_then(ResponseData::into_json)
        .expect("post must succeed");

    assert_eq!(created.id, 42);
    let request = &server.requests()[0];
    assert_eq!(request.content_type.as_deref(), Some("application/json"));
    assert_eq!(
        serde_json::from_slice::<JsonValue>(&request.body).unwrap(),
        json!({"name": "Kit"})
    );
}

#[tokio::test]
async fn post_url_encoded_serializes_form_fields() {
    let server = spawn_server(vec![MockResponse::json(StatusCode::OK, json!({}))]).await;

    server
        .client()
        .post_url_encoded(
            "/login",
            &[("user", "kit"), ("note", "a b")],
            RequestOptions::new(),
        )
        .await
        .expect("post must succeed");

    let request = &server.requests()[0];
    assert_eq!(
        request.content_type.as_deref(),
        Some("application/x-www-form-urlencoded")
    );
    assert_eq!(&request.body[..], b"user=kit&note=a+b");
}

#[tokio::test]
async fn post_form_sends_multipart_body() {
    let server = spawn_server(vec![MockResponse::json(StatusCode::OK, json!({}))]).await;
    let form = MultipartForm::new().text("title", "avatar").file(
        "file",
        "a.txt",
        Some("text/plain"),
        "file-contents",
    );

    server
        .client()
        .post_form("/upload", form, RequestOptions::new())
        .await
        .expect("upload must succeed");

    let request = &server.requests()[0];
    assert!(request
        .content_type
        .as_deref()
        .is_some_and(|value| value.starts_with("multipart/form-data; boundary=")));
    let body = String::from_utf8_lossy(&request.body);
    assert!(body.contains("name=\"title\""));
    assert!(body.contains("filename=\"a.txt\""));
    assert!(body.contains("file-contents"));
}

#[tokio::test]
async fn retries_on_retryable_http_status() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "boom"})),
        MockResponse::json(StatusCode::OK, json!({"ok": true})),
    ])
    .await;

    let client = server.client().with_options(ClientOptions {
        timeout_ms: Some(1_000),
        max_retries: 1,
        retry_backoff_ms: 1,
        throttle: ThrottlePolicy::disabled(),
        ..ClientOptions::default()
    });

    let data = client
        .put("/items/1", None, RequestOptions::new())
        .await
        .expect("request must succeed after retry");

    assert_eq!(data, ResponseData::Json(json!({"ok": true})));
    assert_eq!(server.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rejected_status_carries_decoded_error_body() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::UNPROCESSABLE_ENTITY,
        json!({"error": "name is required"}),
    )])
    .await;

    let err = server
        .client()
        .post("/users", None, RequestOptions::new().retries(2))
        .await
        .expect_err("request must fail");

    match err {
        CourierError::Http { status, body } => {
            assert_eq!(status, 422);
            assert_eq!(body, ErrorBody::Json(json!({"error": "name is required"})));
        }
        other => panic!("expected http error, got {other:?}"),
    }
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_timeout_surfaces_timeout_error() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::OK, json!({})).with_delay(Duration::from_millis(150))
    ])
    .await;

    let err = server
        .client()
        .get(
            "/slow",
            RequestOptions::new().timeout(Duration::from_millis(20)),
        )
        .await
        .expect_err("request must time out");

    assert!(err.is_timeout(), "expected timeout, got {err:?}");
}

#[tokio::test]
async fn cancel_aborts_in_flight_request() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::OK, json!({})).with_delay(Duration::from_secs(2))
    ])
    .await;
    let token = CancelToken::new();
    let client = server.client();

    let started = Instant::now();
    let task = tokio::spawn({
        let options = RequestOptions::new().cancel_token(&token);
        async move { client.get("/slow", options).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel_with("user navigated away");

    let err = task.await.unwrap().expect_err("request must be cancelled");
    assert!(matches!(err, CourierError::Cancelled { ref reason } if reason == "user navigated away"));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn connection_failure_is_a_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let err = CourierClient::new(format!("http://{address}"))
        .unwrap()
        .with_transport(ReqwestTransport::from_client(http))
        .get(
            "/",
            RequestOptions::new()
                .retries(1)
                .retry_delay(Duration::from_millis(1)),
        )
        .await
        .expect_err("connection must fail");

    assert!(matches!(err, CourierError::Network { .. }), "got {err:?}");
}

#[tokio::test]
async fn text_and_blob_response_types() {
    let server = spawn_server(vec![
        MockResponse::text(StatusCode::OK, "hello"),
        MockResponse::text(StatusCode::OK, "PNG").with_content_type("image/png"),
    ])
    .await;
    let client = server.client();

    let text = client
        .get("/greeting", RequestOptions::new().response_type(ResponseType::Text))
        .await
        .unwrap();
    assert_eq!(text.as_text(), Some("hello"));

    match client
        .get("/logo", RequestOptions::new().response_type(ResponseType::Blob))
        .await
        .unwrap()
    {
        ResponseData::Blob(blob) => {
            assert_eq!(blob.content_type.as_deref(), Some("image/png"));
            assert_eq!(&blob.bytes[..], b"PNG");
        }
        other => panic!("expected blob, got {other:?}"),
    }
}

#[tokio::test]
async fn form_data_response_is_decoded() {
    let server = spawn_server(vec![MockResponse::text(StatusCode::OK, "token=abc&scope=read+write")
        .with_content_type("application/x-www-form-urlencoded")])
    .await;

    let data = server
        .client()
        .post(
            "/oauth/token",
            None,
            RequestOptions::new().response_type(ResponseType::FormData),
        )
        .await
        .unwrap();

    assert_eq!(
        data,
        ResponseData::FormData(vec![
            ("token".to_owned(), "abc".to_owned()),
            ("scope".to_owned(), "read write".to_owned()),
        ])
    );
}

#[tokio::test]
async fn upload_and_download_progress_complete() {
    let server = spawn_server(vec![MockResponse::text(StatusCode::OK, &"x".repeat(4096))]).await;
    let uploads = Arc::new(Mutex::new(Vec::<Progress>::new()));
    let downloads = Arc::new(Mutex::new(Vec::<Progress>::new()));
    let upload_sink = uploads.clone();
    let download_sink = downloads.clone();

    server
        .client()
        .post(
            "/blob",
            Payload::bytes(vec![7u8; 40 * 1024]),
            RequestOptions::new()
                .response_type(ResponseType::ArrayBuffer)
                .on_upload_progress(move |p| upload_sink.lock().unwrap().push(p))
                .on_download_progress(move |p| download_sink.lock().unwrap().push(p)),
        )
        .await
        .expect("upload must succeed");

    let uploads = uploads.lock().unwrap().clone();
    assert!(uploads.windows(2).all(|pair| pair[0].loaded <= pair[1].loaded));
    assert_eq!(
        uploads.last(),
        Some(&Progress {
            loaded: 40 * 1024,
            total: Some(40 * 1024)
        })
    );
    assert_eq!(server.requests()[0].body.len(), 40 * 1024);

    let downloads = downloads.lock().unwrap().clone();
    assert_eq!(
        downloads.last(),
        Some(&Progress {
            loaded: 4096,
            total: Some(4096)
        })
    );
}

#[tokio::test]
async fn all_aggregates_multiple_failures() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::OK, json!(1)),
        MockResponse::json(StatusCode::NOT_FOUND, json!({"error": "a"})),
        MockResponse::json(StatusCode::BAD_REQUEST, json!({"error": "b"})),
    ])
    .await;
    let client = server.client();

    let err = courier_http::all(vec![
        client.post("/one", None, RequestOptions::new()),
        client.post("/two", None, RequestOptions::new()),
        client.post("/three", None, RequestOptions::new()),
    ])
    .await
    .expect_err("two members fail");

    match err {
        CourierError::Aggregate { failures } => assert_eq!(failures.len(), 2),
        other => panic!("expected aggregate error, got {other:?}"),
    }
    assert_eq!(server.hits.load(Ordering::SeqCst), 3);
}
