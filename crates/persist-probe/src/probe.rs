use crate::{
    AgentApi, AuthToken, OutgoingMessage, ProbeConfig, ProbeError, ProbeEventKind, ProbeEventSink,
    ProgressPoller, ProgressReport, SessionHandle, StreamConsumer, StreamPhase, StreamReport,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Milestones of a run, in order. A state is reached when the step that
/// produces it succeeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeState {
    Login,
    SessionCreated,
    StreamedAndDisconnected,
    ProgressVerified,
    Resumed,
    Done,
}

impl ProbeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "LOGIN",
            Self::SessionCreated => "SESSION_CREATED",
            Self::StreamedAndDisconnected => "STREAMED_AND_DISCONNECTED",
            Self::ProgressVerified => "PROGRESS_VERIFIED",
            Self::Resumed => "RESUMED",
            Self::Done => "DONE",
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Login => Some(Self::SessionCreated),
            Self::SessionCreated => Some(Self::StreamedAndDisconnected),
            Self::StreamedAndDisconnected => Some(Self::ProgressVerified),
            Self::ProgressVerified => Some(Self::Resumed),
            Self::Resumed => Some(Self::Done),
            Self::Done => None,
        }
    }
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Pass,
    Fail,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProbeRunResult {
    pub status: ProbeStatus,
    /// Last state reached, `None` if login never succeeded.
    pub reached: Option<ProbeState>,
    /// State the run could not reach.
    pub failed_at: Option<ProbeState>,
    pub failure: Option<ProbeError>,
    pub session_id: Option<SessionHandle>,
    pub initial_stream: Option<StreamReport>,
    pub progress: Option<ProgressReport>,
    pub resume: Option<StreamReport>,
}

impl ProbeRunResult {
    pub fn is_pass(&self) -> bool {
        self.status == ProbeStatus::Pass
    }
}

#[derive(Debug, Default)]
struct RunRecord {
    reached: Option<ProbeState>,
    session_id: Option<SessionHandle>,
    initial_stream: Option<StreamReport>,
    progress: Option<ProgressReport>,
    resume: Option<StreamReport>,
}

/// Drives one disconnect/resume probe against an [`AgentApi`].
pub struct ProbeRunner<A> {
    api: A,
    config: ProbeConfig,
    events: ProbeEventSink,
}

impl<A: AgentApi> ProbeRunner<A> {
    pub fn new(api: A, config: ProbeConfig) -> Self {
        Self {
            api,
            config,
            events: ProbeEventSink::default(),
        }
    }

    pub fn with_events(mut self, events: ProbeEventSink) -> Self {
        self.events = events;
        self
    }

    /// Runs every step once. Any failure stops the run; nothing is retried.
    pub async fn run(mut self) -> ProbeRunResult {
        let mut record = RunRecord::default();
        let outcome = self.execute(&mut record).await;

        let (status, failed_at, failure) = match outcome {
            Ok(()) => {
                let session_id = record
                    .session_id
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                let resumed_events = record
                    .resume
                    .as_ref()
                    .map_or(0, |report| report.event_count);
                info!(
                    %session_id,
                    resumed_events,
                    "probe passed: session kept running after disconnect"
                );
                self.emit(ProbeEventKind::RunPassed {
                    session_id,
                    resumed_events,
                });
                (ProbeStatus::Pass, None, None)
            }
            Err(failure) => {
                let failed_at = record
                    .reached
                    .map_or(Some(ProbeState::Login), |state| state.next())
                    .unwrap_or(ProbeState::Done);
                error!(failed_at = failed_at.as_str(), error = %failure, "probe failed");
                self.emit(ProbeEventKind::RunFailed {
                    failed_at,
                    reason: failure.to_string(),
                });
                (ProbeStatus::Fail, Some(failed_at), Some(failure))
            }
        };

        ProbeRunResult {
            status,
            reached: record.reached,
            failed_at,
            failure,
            session_id: record.session_id,
            initial_stream: record.initial_stream,
            progress: record.progress,
            resume: record.resume,
        }
    }

    async fn execute(&mut self, record: &mut RunRecord) -> Result<(), ProbeError> {
        self.config.validate()?;

        info!(
            base_url = %self.config.base_url,
            identifier = self.config.credentials.identifier(),
            "logging in"
        );
        let token = self.api.login(&self.config.credentials).await?;
        self.reach(record, ProbeState::Login);

        let session = self
            .api
            .create_session(&token, &self.config.session)
            .await?;
        info!(session_id = %session, "session created");
        record.session_id = Some(session.clone());
        self.reach(record, ProbeState::SessionCreated);

        let prompt = vec![OutgoingMessage::user(self.config.prompt.clone())];
        let disconnect_after = self.config.timing.disconnect_after;
        let initial = self
            .stream(&token, &session, StreamPhase::Initial, &prompt, disconnect_after)
            .await?;
        record.initial_stream = Some(initial);
        self.reach(record, ProbeState::StreamedAndDisconnected);

        let poller =
            ProgressPoller::new(self.config.timing.progress_wait, self.config.timing.poll_interval);
        let progress = poller.poll(&self.api, &token, &session).await?;
        self.emit(ProbeEventKind::ProgressChecked {
            total_messages: progress.verdict.total_messages,
            assistant_messages: progress.verdict.assistant_messages,
            tool_messages: progress.verdict.tool_messages,
            roles: progress.roles.clone(),
        });
        let verdict = progress.verdict.clone();
        record.progress = Some(progress);
        if !verdict.is_confirmed() {
            return Err(verdict.to_error());
        }
        self.reach(record, ProbeState::ProgressVerified);

        info!(session_id = %session, "re-attaching to session stream");
        let resume_window = self.config.timing.resume_window;
        let resume = self
            .stream(&token, &session, StreamPhase::Resume, &[], resume_window)
            .await?;
        if resume.event_count == 0 {
            warn!(
                session_id = %session,
                "re-attached but saw no events in the resume window; the session may have finished"
            );
        } else {
            info!(
                session_id = %session,
                events = resume.event_count,
                "re-attached to ongoing session"
            );
        }
        record.resume = Some(resume);
        self.reach(record, ProbeState::Resumed);
        self.reach(record, ProbeState::Done);
        Ok(())
    }

    async fn stream(
        &mut self,
        token: &AuthToken,
        session: &SessionHandle,
        phase: StreamPhase,
        messages: &[OutgoingMessage],
        window: Duration,
    ) -> Result<StreamReport, ProbeError> {
        let stream = self
            .api
            .open_stream(token, session, &self.config.agent_file, messages)
            .await?;
        info!(
            phase = phase.as_str(),
            window_ms = window.as_millis() as u64,
            "stream open; reading until the window elapses"
        );
        self.emit(ProbeEventKind::StreamOpened {
            phase,
            session_id: session.to_string(),
            messages_sent: messages.len(),
        });

        let report = StreamConsumer::new(window)
            .consume(stream, phase, |index, event| {
                self.emit(ProbeEventKind::StreamEvent {
                    phase,
                    index,
                    event_type: event.event_type.clone(),
                });
            })
            .await;

        self.emit(ProbeEventKind::StreamClosed {
            phase,
            event_count: report.event_count,
            termination: report.termination.clone(),
        });
        Ok(report)
    }

    fn reach(&mut self, record: &mut RunRecord, state: ProbeState) {
        record.reached = Some(state);
        self.emit(ProbeEventKind::StateReached { state });
    }

    fn emit(&mut self, kind: ProbeEventKind) {
        self.events.emit(kind);
    }
}
