use crate::{
    AuthToken, Credentials, OutgoingMessage, ProbeConfig, ProbeError, SessionHandle,
    SessionOptions, SessionSnapshot, StreamReadError,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// Raw body of an open event stream. Dropping it closes the connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamReadError>> + Send>>;

/// The session API surface the probe exercises.
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<AuthToken, ProbeError>;

    async fn create_session(
        &self,
        token: &AuthToken,
        options: &SessionOptions,
    ) -> Result<SessionHandle, ProbeError>;

    /// Posts `messages` to the session's agent and returns the event stream.
    /// An empty list re-attaches without sending anything new.
    async fn open_stream(
        &self,
        token: &AuthToken,
        session: &SessionHandle,
        agent_file: &str,
        messages: &[OutgoingMessage],
    ) -> Result<ByteStream, ProbeError>;

    async fn get_session(
        &self,
        token: &AuthToken,
        session: &SessionHandle,
    ) -> Result<SessionSnapshot, ProbeError>;
}

#[async_trait]
impl<T> AgentApi for std::sync::Arc<T>
where
    T: AgentApi + ?Sized,
{
    async fn login(&self, credentials: &Credentials) -> Result<AuthToken, ProbeError> {
        (**self).login(credentials).await
    }

    async fn create_session(
        &self,
        token: &AuthToken,
        options: &SessionOptions,
    ) -> Result<SessionHandle, ProbeError> {
        (**self).create_session(token, options).await
    }

    async fn open_stream(
        &self,
        token: &AuthToken,
        session: &SessionHandle,
        agent_file: &str,
        messages: &[OutgoingMessage],
    ) -> Result<ByteStream, ProbeError> {
        (**self)
            .open_stream(token, session, agent_file, messages)
            .await
    }

    async fn get_session(
        &self,
        token: &AuthToken,
        session: &SessionHandle,
    ) -> Result<SessionSnapshot, ProbeError> {
        (**self).get_session(token, session).await
    }
}

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Clone, Copy, Debug)]
enum Step {
    Login,
    CreateSession,
    OpenStream,
    ReadSnapshot,
}

impl Step {
    fn error(self, status: Option<u16>, detail: impl Into<String>) -> ProbeError {
        let detail = detail.into();
        match self {
            Self::Login => ProbeError::Authentication { status, detail },
            Self::CreateSession => ProbeError::SessionCreation { status, detail },
            Self::OpenStream => ProbeError::StreamOpen { status, detail },
            Self::ReadSnapshot => ProbeError::SnapshotRead { status, detail },
        }
    }
}

/// `AgentApi` over HTTP(S) with reqwest.
#[derive(Clone, Debug)]
pub struct HttpAgentApi {
    client: reqwest::Client,
    base_url: String,
    api_prefix: String,
    request_timeout: Duration,
}

impl HttpAgentApi {
    pub fn new(
        base_url: impl Into<String>,
        api_prefix: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into(),
            api_prefix: api_prefix.into(),
            request_timeout,
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(
            config.base_url.clone(),
            config.api_prefix.clone(),
            config.timing.request_timeout,
        )
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let prefix = self.api_prefix.trim_matches('/');
        let path = path.trim_start_matches('/');
        if prefix.is_empty() {
            format!("{base}/{path}")
        } else {
            format!("{base}/{prefix}/{path}")
        }
    }

    fn session_path(session: &SessionHandle) -> String {
        format!("sessions/{}", encode_segment(session.as_str()))
    }

    async fn read_json<T: DeserializeOwned>(
        step: Step,
        response: reqwest::Response,
    ) -> Result<T, ProbeError> {
        let status = response.status();
        let text = response.text().await.map_err(|err| {
            step.error(
                Some(status.as_u16()),
                format!("http read body failed: {err}"),
            )
        })?;
        if !status.is_success() {
            return Err(step.error(Some(status.as_u16()), error_body(&text)));
        }
        serde_json::from_str(&text).map_err(|err| {
            step.error(
                Some(status.as_u16()),
                format!("http json decode failed: {err}"),
            )
        })
    }
}

#[async_trait]
impl AgentApi for HttpAgentApi {
    async fn login(&self, credentials: &Credentials) -> Result<AuthToken, ProbeError> {
        let url = self.endpoint("auth/login");
        debug!(%url, identifier = credentials.identifier(), "logging in");
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&LoginRequest {
                email: credentials.identifier(),
                password: credentials.secret(),
            })
            .send()
            .await
            .map_err(|err| Step::Login.error(None, format!("http post failed: {err}")))?;
        let status = response.status().as_u16();
        let payload: LoginResponse = Self::read_json(Step::Login, response).await?;
        payload
            .token
            .filter(|token| !token.trim().is_empty())
            .map(AuthToken::new)
            .ok_or_else(|| Step::Login.error(Some(status), "response did not contain a token"))
    }

    async fn create_session(
        &self,
        token: &AuthToken,
        options: &SessionOptions,
    ) -> Result<SessionHandle, ProbeError> {
        let url = self.endpoint("sessions");
        debug!(%url, ?options, "creating session");
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .bearer_auth(token.as_str())
            .json(options)
            .send()
            .await
            .map_err(|err| Step::CreateSession.error(None, format!("http post failed: {err}")))?;
        let status = response.status().as_u16();
        let payload: CreateSessionResponse = Self::read_json(Step::CreateSession, response).await?;
        payload
            .id
            .filter(|id| !id.trim().is_empty())
            .map(SessionHandle::new)
            .ok_or_else(|| {
                Step::CreateSession.error(Some(status), "response did not contain a session id")
            })
    }

    async fn open_stream(
        &self,
        token: &AuthToken,
        session: &SessionHandle,
        agent_file: &str,
        messages: &[OutgoingMessage],
    ) -> Result<ByteStream, ProbeError> {
        let url = self.endpoint(&format!(
            "{}/agent/{}",
            Self::session_path(session),
            encode_segment(agent_file)
        ));
        debug!(%url, messages = messages.len(), "opening event stream");
        // Only the wait for response headers is bounded; the body is read
        // under the consumer's own window.
        let request = self
            .client
            .post(&url)
            .bearer_auth(token.as_str())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(messages)
            .send();
        let response = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| {
                Step::OpenStream.error(
                    None,
                    format!(
                        "no response headers within {} ms",
                        self.request_timeout.as_millis()
                    ),
                )
            })?
            .map_err(|err| Step::OpenStream.error(None, format!("http post failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(Step::OpenStream.error(Some(status.as_u16()), error_body(&text)));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| StreamReadError(err.to_string())));
        Ok(Box::pin(stream))
    }

    async fn get_session(
        &self,
        token: &AuthToken,
        session: &SessionHandle,
    ) -> Result<SessionSnapshot, ProbeError> {
        let url = self.endpoint(&Self::session_path(session));
        debug!(%url, "reading session snapshot");
        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|err| Step::ReadSnapshot.error(None, format!("http get failed: {err}")))?;
        Self::read_json(Step::ReadSnapshot, response).await
    }
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

fn error_body(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    let mut body: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
    if trimmed.chars().count() > MAX_ERROR_BODY_CHARS {
        body.push_str("...");
    }
    body
}
