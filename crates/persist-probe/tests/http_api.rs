use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{StreamExt, stream};
use persist_probe::{
    AgentApi, AuthToken, Credentials, HttpAgentApi, OutgoingMessage, ProbeConfig, ProbeError,
    ProbeRunner, ProbeState, ProbeStatus, SessionHandle, SessionOptions, StreamTermination,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;

const EMAIL: &str = "probe@example.com";
const PASSWORD: &str = "hunter2";
const TOKEN: &str = "token-abc";
const AGENT_FILE: &str = "Team of agents.yaml";

#[derive(Clone, Default)]
struct AppState {
    inner: Arc<Mutex<ServerState>>,
}

#[derive(Default)]
struct ServerState {
    /// When false, prompts are recorded but no assistant reply ever lands.
    agent_works: bool,
    logins: usize,
    session_creates: usize,
    session_bodies: Vec<Value>,
    sessions: HashMap<String, Vec<Value>>,
    stream_opens: Vec<StreamOpen>,
}

#[derive(Clone, Debug)]
struct StreamOpen {
    session_id: String,
    agent_file: String,
    accept: Option<String>,
    authorization: Option<String>,
    messages: Vec<Value>,
}

impl AppState {
    fn new(agent_works: bool) -> Self {
        let state = Self::default();
        state.lock().agent_works = agent_works;
        state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.inner.lock().expect("server state lock")
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TOKEN}"))
}

async fn login(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    state.lock().logins += 1;
    if body["email"] == EMAIL && body["password"] == PASSWORD {
        Json(json!({ "token": TOKEN })).into_response()
    } else {
        (StatusCode::UNAUTHORIZED, "invalid credentials").into_response()
    }
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut state = state.lock();
    state.session_creates += 1;
    state.session_bodies.push(body);
    let id = format!("sess-{}", state.session_creates);
    state.sessions.insert(id.clone(), Vec::new());
    (StatusCode::CREATED, Json(json!({ "id": id }))).into_response()
}

async fn agent_stream(
    State(state): State<AppState>,
    Path((session_id, agent_file)): Path<(String, String)>,
    headers: HeaderMap,
    Json(messages): Json<Vec<Value>>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut state = state.lock();
    let agent_works = state.agent_works;
    let Some(history) = state.sessions.get_mut(&session_id) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    let mut chunks = Vec::new();
    if messages.is_empty() {
        chunks.push("data: {\"type\":\"agent_choice\"}\n\n".to_string());
        chunks.push(": keep-alive\n\n".to_string());
        chunks.push("data: {\"type\":\"tool_call\"}\n\n".to_string());
    } else {
        for message in &messages {
            history.push(json!({ "message": message, "createdAt": "2026-10-18T10:00:00Z" }));
        }
        if agent_works {
            history.push(json!({
                "message": { "role": "assistant", "content": "Looking up releases" },
                "createdAt": "2026-10-18T10:00:01Z"
            }));
        }
        chunks.push("data: {\"type\":\"session_start\"}\n\n".to_string());
        chunks.push("data: not json\n\n".to_string());
        chunks.push("data: {\"type\":\"agent_choice\"}\n\n".to_string());
    }

    let open = StreamOpen {
        session_id,
        agent_file,
        accept: headers
            .get(header::ACCEPT)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string),
        messages,
    };
    state.stream_opens.push(open);

    let body = stream::iter(chunks.into_iter().map(Ok::<_, Infallible>)).chain(stream::pending());
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(body),
    )
        .into_response()
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let state = state.lock();
    match state.sessions.get(&session_id) {
        Some(messages) => Json(json!({ "id": session_id, "messages": messages })).into_response(),
        None => (StatusCode::NOT_FOUND, "session not found").into_response(),
    }
}

async fn spawn_server(state: AppState) -> String {
    let router = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:session_id", get(get_session))
        .route("/api/sessions/:session_id/agent/:agent_file", post(agent_stream))
        .with_state(state);
    spawn_router(router).await
}

/// Answers 200 with bodies the client cannot use: `/empty` returns `{}`,
/// `/blank` returns an empty token, and snapshots are not JSON.
async fn spawn_unusable_server() -> String {
    let router = Router::new()
        .route("/empty/auth/login", post(|| async { Json(json!({})) }))
        .route("/blank/auth/login", post(|| async { Json(json!({ "token": "" })) }))
        .route("/empty/sessions", post(|| async { Json(json!({})) }))
        .route(
            "/empty/sessions/:session_id",
            get(|| async { "<html>maintenance</html>" }),
        );
    spawn_router(router).await
}

async fn spawn_router(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}

fn fast_config(base_url: &str, password: &str) -> ProbeConfig {
    let mut config = ProbeConfig::new(base_url, Credentials::new(EMAIL, password), AGENT_FILE);
    config.timing.disconnect_after = Duration::from_millis(300);
    config.timing.progress_wait = Duration::from_millis(100);
    config.timing.poll_interval = Duration::from_millis(50);
    config.timing.resume_window = Duration::from_millis(300);
    config.timing.request_timeout = Duration::from_secs(5);
    config
}

#[tokio::test(flavor = "current_thread")]
async fn probe_over_http_expected_pass_and_wire_shapes() {
    let state = AppState::new(true);
    let base_url = spawn_server(state.clone()).await;
    let config = fast_config(&base_url, PASSWORD);

    let result = ProbeRunner::new(HttpAgentApi::from_config(&config), config.clone())
        .run()
        .await;

    assert_eq!(result.status, ProbeStatus::Pass, "failure: {:?}", result.failure);
    let initial = result.initial_stream.expect("initial stream report");
    assert_eq!(initial.event_count, 2);
    assert_eq!(initial.malformed_lines, 1);
    assert_eq!(initial.termination, StreamTermination::DeadlineReached);
    let resume = result.resume.expect("resume report");
    assert_eq!(resume.event_types, vec!["agent_choice", "tool_call"]);

    let server = state.lock();
    assert_eq!(
        server.session_bodies,
        vec![json!({ "maxIterations": 50, "toolsApproved": true, "workingDir": "/work" })]
    );
    assert_eq!(server.stream_opens.len(), 2);
    for open in &server.stream_opens {
        assert_eq!(open.session_id, "sess-1");
        assert_eq!(open.agent_file, AGENT_FILE);
        assert_eq!(open.accept.as_deref(), Some("text/event-stream"));
        assert_eq!(open.authorization.as_deref(), Some("Bearer token-abc"));
    }
    assert_eq!(
        server.stream_opens[0].messages,
        vec![json!({ "role": "user", "content": config.prompt })]
    );
    assert!(server.stream_opens[1].messages.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn stalled_agent_over_http_expected_fail_at_progress_verified() {
    let state = AppState::new(false);
    let base_url = spawn_server(state.clone()).await;
    let config = fast_config(&base_url, PASSWORD);

    let result = ProbeRunner::new(HttpAgentApi::from_config(&config), config)
        .run()
        .await;

    assert_eq!(result.failed_at, Some(ProbeState::ProgressVerified));
    assert!(matches!(
        result.failure,
        Some(ProbeError::ProgressNotConfirmed {
            total_messages: 1,
            assistant_messages: 0,
            tool_messages: 0,
        })
    ));
    assert_eq!(state.lock().stream_opens.len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn wrong_password_expected_401_and_no_session() {
    let state = AppState::new(true);
    let base_url = spawn_server(state.clone()).await;
    let config = fast_config(&base_url, "wrong");

    let result = ProbeRunner::new(HttpAgentApi::from_config(&config), config)
        .run()
        .await;

    assert_eq!(result.failed_at, Some(ProbeState::Login));
    match result.failure {
        Some(ProbeError::Authentication { status, detail }) => {
            assert_eq!(status, Some(401));
            assert!(detail.contains("invalid credentials"), "detail: {detail}");
        }
        other => panic!("expected authentication failure, got {other:?}"),
    }
    let server = state.lock();
    assert_eq!(server.logins, 1);
    assert_eq!(server.session_creates, 0);
}

#[tokio::test(flavor = "current_thread")]
async fn consecutive_sessions_get_distinct_ids() {
    let base_url = spawn_server(AppState::new(true)).await;
    let api = HttpAgentApi::new(&base_url, "/api", Duration::from_secs(5));
    let token = api
        .login(&Credentials::new(EMAIL, PASSWORD))
        .await
        .expect("login should succeed");
    let options = SessionOptions::default();

    let first = api
        .create_session(&token, &options)
        .await
        .expect("first session");
    let second = api
        .create_session(&token, &options)
        .await
        .expect("second session");

    assert_ne!(first, second);
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_session_expected_snapshot_and_stream_errors() {
    let base_url = spawn_server(AppState::new(true)).await;
    let api = HttpAgentApi::new(&base_url, "/api", Duration::from_secs(5));
    let token = AuthToken::new(TOKEN);
    let missing = SessionHandle::new("nope");

    let snapshot = api.get_session(&token, &missing).await;
    assert!(matches!(
        snapshot,
        Err(ProbeError::SnapshotRead {
            status: Some(404),
            ..
        })
    ));

    let stream = api
        .open_stream(&token, &missing, AGENT_FILE, &[OutgoingMessage::user("hi")])
        .await;
    match stream {
        Err(ProbeError::StreamOpen { status, detail }) => {
            assert_eq!(status, Some(404));
            assert!(detail.contains("session not found"), "detail: {detail}");
        }
        Err(other) => panic!("expected stream open failure, got {other:?}"),
        Ok(_) => panic!("expected stream open failure, got an open stream"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn unreachable_server_expected_transport_error_without_status() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("listener addr");
    drop(listener);

    let api = HttpAgentApi::new(format!("http://{addr}"), "/api", Duration::from_secs(2));
    let error = api
        .login(&Credentials::new(EMAIL, PASSWORD))
        .await
        .expect_err("login should fail");

    assert!(matches!(
        error,
        ProbeError::Authentication { status: None, .. }
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn stalled_stream_headers_expected_open_error_within_timeout() {
    let router = Router::new().route(
        "/api/sessions/:session_id/agent/:agent_file",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            StatusCode::OK
        }),
    );
    let base_url = spawn_router(router).await;
    let api = HttpAgentApi::new(&base_url, "/api", Duration::from_millis(300));

    let started = Instant::now();
    let opened = tokio::time::timeout(
        Duration::from_secs(3),
        api.open_stream(
            &AuthToken::new(TOKEN),
            &SessionHandle::new("sess-1"),
            AGENT_FILE,
            &[OutgoingMessage::user("hi")],
        ),
    )
    .await
    .expect("open_stream should give up on its own");

    assert!(started.elapsed() < Duration::from_secs(2));
    match opened {
        Err(ProbeError::StreamOpen { status, detail }) => {
            assert_eq!(status, None);
            assert!(detail.contains("300 ms"), "detail: {detail}");
        }
        Err(other) => panic!("expected stream open failure, got {other:?}"),
        Ok(_) => panic!("expected stream open failure, got an open stream"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn login_without_token_expected_authentication_error() {
    let base_url = spawn_unusable_server().await;
    let credentials = Credentials::new(EMAIL, PASSWORD);

    for prefix in ["/empty", "/blank"] {
        let api = HttpAgentApi::new(&base_url, prefix, Duration::from_secs(5));
        let error = api
            .login(&credentials)
            .await
            .expect_err("login without a token should fail");
        assert!(
            matches!(
                &error,
                ProbeError::Authentication {
                    status: Some(200),
                    detail,
                } if detail.contains("token")
            ),
            "{prefix}: {error:?}"
        );
    }
}

#[tokio::test(flavor = "current_thread")]
async fn session_without_id_expected_session_creation_error() {
    let base_url = spawn_unusable_server().await;
    let api = HttpAgentApi::new(&base_url, "/empty", Duration::from_secs(5));

    let error = api
        .create_session(&AuthToken::new(TOKEN), &SessionOptions::default())
        .await
        .expect_err("session without an id should fail");

    assert!(matches!(
        error,
        ProbeError::SessionCreation {
            status: Some(200),
            ..
        }
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn undecodable_snapshot_expected_snapshot_read_error() {
    let base_url = spawn_unusable_server().await;
    let api = HttpAgentApi::new(&base_url, "/empty", Duration::from_secs(5));

    let error = api
        .get_session(&AuthToken::new(TOKEN), &SessionHandle::new("sess-1"))
        .await
        .expect_err("non-JSON snapshot should fail");

    match error {
        ProbeError::SnapshotRead { status, detail } => {
            assert_eq!(status, Some(200));
            assert!(detail.contains("json decode"), "detail: {detail}");
        }
        other => panic!("expected snapshot read failure, got {other:?}"),
    }
}
