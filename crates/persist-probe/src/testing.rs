//! In-memory [`AgentApi`] with scripted responses, for tests.

use crate::{
    AgentApi, AuthToken, ByteStream, Credentials, MessageBody, OutgoingMessage, ProbeError, Role,
    SessionHandle, SessionOptions, SessionSnapshot, SnapshotMessage, StreamReadError,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
enum StreamStep {
    Chunk(String),
    Delay(Duration),
    Error(String),
    HoldOpen,
}

/// Script for one connection to the agent stream endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamScript {
    reject_status: Option<u16>,
    steps: Vec<StreamStep>,
}

impl StreamScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// The open request fails with `status`.
    pub fn rejected(status: u16) -> Self {
        Self {
            reject_status: Some(status),
            steps: Vec::new(),
        }
    }

    /// One `data:` line carrying `{"type": event_type}`, then a blank line.
    pub fn event(self, event_type: &str) -> Self {
        let payload = json!({ "type": event_type });
        self.chunk(format!("data: {payload}\n\n"))
    }

    /// Raw bytes exactly as given.
    pub fn chunk(mut self, chunk: impl Into<String>) -> Self {
        self.steps.push(StreamStep::Chunk(chunk.into()));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.steps.push(StreamStep::Delay(delay));
        self
    }

    /// Fails the transport mid-body.
    pub fn error(mut self, detail: impl Into<String>) -> Self {
        self.steps.push(StreamStep::Error(detail.into()));
        self
    }

    /// Keeps the connection open without sending anything else.
    pub fn hold_open(mut self) -> Self {
        self.steps.push(StreamStep::HoldOpen);
        self
    }

    /// Builds the byte stream plus a flag that turns true when the client
    /// drops the stream before the script finished on its own.
    pub fn into_tracked_stream(self) -> (ByteStream, Arc<AtomicBool>) {
        let closed_by_client = Arc::new(AtomicBool::new(false));
        let state = ScriptState {
            steps: self.steps.into(),
            guard: CloseGuard {
                closed_by_client: closed_by_client.clone(),
                finished: false,
            },
        };
        (
            Box::pin(futures::stream::unfold(state, next_chunk)),
            closed_by_client,
        )
    }
}

struct CloseGuard {
    closed_by_client: Arc<AtomicBool>,
    finished: bool,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.closed_by_client.store(true, Ordering::SeqCst);
        }
    }
}

struct ScriptState {
    steps: VecDeque<StreamStep>,
    guard: CloseGuard,
}

async fn next_chunk(
    mut state: ScriptState,
) -> Option<(Result<Bytes, StreamReadError>, ScriptState)> {
    loop {
        match state.steps.pop_front() {
            Some(StreamStep::Chunk(chunk)) => return Some((Ok(Bytes::from(chunk)), state)),
            Some(StreamStep::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(StreamStep::Error(detail)) => {
                state.guard.finished = true;
                state.steps.clear();
                return Some((Err(StreamReadError(detail)), state));
            }
            Some(StreamStep::HoldOpen) => std::future::pending::<()>().await,
            None => {
                state.guard.finished = true;
                return None;
            }
        }
    }
}

/// Snapshot whose messages carry the given roles, in order.
pub fn snapshot_with_roles(roles: &[&str]) -> SessionSnapshot {
    SessionSnapshot {
        messages: roles
            .iter()
            .enumerate()
            .map(|(index, role)| SnapshotMessage {
                message: MessageBody {
                    role: Role::from(*role),
                    content: Value::String(format!("{role} message {index}")),
                },
                created_at: Some(format!("2026-10-18T10:00:{index:02}Z")),
            })
            .collect(),
    }
}

/// Number of calls made to each [`AgentApi`] operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub login: usize,
    pub create_session: usize,
    pub open_stream: usize,
    pub get_session: usize,
}

/// One accepted stream open, as the mock saw it.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub session: SessionHandle,
    pub agent_file: String,
    pub messages: Vec<OutgoingMessage>,
    closed_by_client: Arc<AtomicBool>,
}

impl StreamRequest {
    pub fn closed_by_client(&self) -> bool {
        self.closed_by_client.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockAgentApi {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    login_status: Option<u16>,
    expected_credentials: Option<Credentials>,
    session_ids: VecDeque<String>,
    next_session_id: u64,
    sessions: Vec<SessionOptions>,
    streams: VecDeque<StreamScript>,
    stream_requests: Vec<StreamRequest>,
    snapshot: SessionSnapshot,
    snapshot_status: Option<u16>,
    calls: MockCalls,
}

impl MockAgentApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Login answers with `status` instead of a token.
    pub fn reject_login(self, status: u16) -> Self {
        self.state().login_status = Some(status);
        self
    }

    /// Only these credentials log in; anything else gets a 401.
    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.state().expected_credentials = Some(credentials);
        self
    }

    /// Ids handed out by session creation, in order. Once exhausted, ids are
    /// generated as `session-N`.
    pub fn with_session_ids<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state()
            .session_ids
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Queues the script for the next stream connection.
    pub fn with_stream(self, script: StreamScript) -> Self {
        self.state().streams.push_back(script);
        self
    }

    pub fn with_snapshot(self, snapshot: SessionSnapshot) -> Self {
        self.state().snapshot = snapshot;
        self
    }

    pub fn reject_snapshot(self, status: u16) -> Self {
        self.state().snapshot_status = Some(status);
        self
    }

    pub fn calls(&self) -> MockCalls {
        self.state().calls.clone()
    }

    pub fn stream_requests(&self) -> Vec<StreamRequest> {
        self.state().stream_requests.clone()
    }

    /// Options of every session created so far.
    pub fn created_sessions(&self) -> Vec<SessionOptions> {
        self.state().sessions.clone()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AgentApi for MockAgentApi {
    async fn login(&self, credentials: &Credentials) -> Result<AuthToken, ProbeError> {
        let mut state = self.state();
        state.calls.login += 1;
        if let Some(status) = state.login_status {
            return Err(ProbeError::Authentication {
                status: Some(status),
                detail: "login rejected".to_string(),
            });
        }
        if let Some(expected) = state.expected_credentials.as_ref() {
            if expected != credentials {
                return Err(ProbeError::Authentication {
                    status: Some(401),
                    detail: "invalid credentials".to_string(),
                });
            }
        }
        Ok(AuthToken::new(format!("mock-token-{}", state.calls.login)))
    }

    async fn create_session(
        &self,
        _token: &AuthToken,
        options: &SessionOptions,
    ) -> Result<SessionHandle, ProbeError> {
        let mut state = self.state();
        state.calls.create_session += 1;
        state.sessions.push(options.clone());
        let id = match state.session_ids.pop_front() {
            Some(id) => id,
            None => {
                state.next_session_id += 1;
                format!("session-{}", state.next_session_id)
            }
        };
        Ok(SessionHandle::new(id))
    }

    async fn open_stream(
        &self,
        _token: &AuthToken,
        session: &SessionHandle,
        agent_file: &str,
        messages: &[OutgoingMessage],
    ) -> Result<ByteStream, ProbeError> {
        let mut state = self.state();
        state.calls.open_stream += 1;
        let Some(script) = state.streams.pop_front() else {
            return Err(ProbeError::StreamOpen {
                status: Some(404),
                detail: "no stream scripted".to_string(),
            });
        };
        if let Some(status) = script.reject_status {
            return Err(ProbeError::StreamOpen {
                status: Some(status),
                detail: "stream rejected".to_string(),
            });
        }

        let (stream, closed_by_client) = script.into_tracked_stream();
        state.stream_requests.push(StreamRequest {
            session: session.clone(),
            agent_file: agent_file.to_string(),
            messages: messages.to_vec(),
            closed_by_client,
        });
        Ok(stream)
    }

    async fn get_session(
        &self,
        _token: &AuthToken,
        _session: &SessionHandle,
    ) -> Result<SessionSnapshot, ProbeError> {
        let mut state = self.state();
        state.calls.get_session += 1;
        if let Some(status) = state.snapshot_status {
            return Err(ProbeError::SnapshotRead {
                status: Some(status),
                detail: "snapshot rejected".to_string(),
            });
        }
        Ok(state.snapshot.clone())
    }
}
