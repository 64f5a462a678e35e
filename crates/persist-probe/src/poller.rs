use crate::{AgentApi, AuthToken, ProbeError, Role, SessionHandle, SessionSnapshot};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Messages shown from the tail of the snapshot.
pub const PREVIEW_MESSAGES: usize = 3;
/// Characters of content shown per previewed message.
pub const PREVIEW_CHARS: usize = 100;

/// Role counts behind the progress verdict.
///
/// Progress is confirmed iff the snapshot holds at least one assistant or tool
/// message. A session that only ever echoes user or system messages reads as
/// "no progress"; that approximation is the property under test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressVerdict {
    pub total_messages: usize,
    pub assistant_messages: usize,
    pub tool_messages: usize,
}

impl ProgressVerdict {
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        Self {
            total_messages: snapshot.messages.len(),
            assistant_messages: snapshot.count_role(&Role::Assistant),
            tool_messages: snapshot.count_role(&Role::Tool),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.assistant_messages + self.tool_messages > 0
    }

    pub fn to_error(&self) -> ProbeError {
        ProbeError::ProgressNotConfirmed {
            total_messages: self.total_messages,
            assistant_messages: self.assistant_messages,
            tool_messages: self.tool_messages,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub role: String,
    pub created_at: Option<String>,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub verdict: ProgressVerdict,
    pub roles: Vec<String>,
    pub recent: Vec<MessagePreview>,
    pub waited_ms: u64,
    pub poll_interval_ms: u64,
}

impl ProgressReport {
    pub fn from_snapshot(snapshot: &SessionSnapshot, waited: Duration, interval: Duration) -> Self {
        let skip = snapshot.messages.len().saturating_sub(PREVIEW_MESSAGES);
        let recent = snapshot
            .messages
            .iter()
            .skip(skip)
            .map(|message| MessagePreview {
                role: message.role().to_string(),
                created_at: message.created_at.clone(),
                content: message.content_preview(PREVIEW_CHARS),
            })
            .collect();

        Self {
            verdict: ProgressVerdict::from_snapshot(snapshot),
            roles: snapshot
                .roles()
                .iter()
                .map(|role| role.to_string())
                .collect(),
            recent,
            waited_ms: waited.as_millis() as u64,
            poll_interval_ms: interval.as_millis() as u64,
        }
    }
}

/// Waits out the delay, then reads the session once.
///
/// `interval` is the cadence an incremental variant would poll at; this one
/// never reads more than once.
#[derive(Clone, Copy, Debug)]
pub struct ProgressPoller {
    delay: Duration,
    interval: Duration,
}

impl ProgressPoller {
    pub fn new(delay: Duration, interval: Duration) -> Self {
        Self { delay, interval }
    }

    pub async fn poll<A>(
        &self,
        api: &A,
        token: &AuthToken,
        session: &SessionHandle,
    ) -> Result<ProgressReport, ProbeError>
    where
        A: AgentApi + ?Sized,
    {
        info!(
            session_id = %session,
            wait_ms = self.delay.as_millis() as u64,
            poll_interval_ms = self.interval.as_millis() as u64,
            "waiting before checking session progress"
        );
        tokio::time::sleep(self.delay).await;

        let snapshot = api.get_session(token, session).await?;
        let report = ProgressReport::from_snapshot(&snapshot, self.delay, self.interval);

        info!(
            session_id = %session,
            messages = report.verdict.total_messages,
            assistant = report.verdict.assistant_messages,
            tool = report.verdict.tool_messages,
            roles = ?report.roles,
            "session snapshot read"
        );
        for preview in &report.recent {
            info!(
                role = %preview.role,
                created_at = preview.created_at.as_deref().unwrap_or("unknown"),
                content = %preview.content,
                "recent message"
            );
        }

        Ok(report)
    }
}
