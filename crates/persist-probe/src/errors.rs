use thiserror::Error;

/// Failures that end a probe run.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("authentication failed ({}): {detail}", status_label(.status))]
    Authentication { status: Option<u16>, detail: String },
    #[error("session creation failed ({}): {detail}", status_label(.status))]
    SessionCreation { status: Option<u16>, detail: String },
    #[error("stream open failed ({}): {detail}", status_label(.status))]
    StreamOpen { status: Option<u16>, detail: String },
    #[error("session snapshot read failed ({}): {detail}", status_label(.status))]
    SnapshotRead { status: Option<u16>, detail: String },
    #[error(
        "progress not confirmed: {total_messages} message(s), none from assistant or tool; \
         the session appears to have stopped when the client disconnected"
    )]
    ProgressNotConfirmed {
        total_messages: usize,
        assistant_messages: usize,
        tool_messages: usize,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl ProbeError {
    /// HTTP status reported by the server, if the failure got that far.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Authentication { status, .. }
            | Self::SessionCreation { status, .. }
            | Self::StreamOpen { status, .. }
            | Self::SnapshotRead { status, .. } => *status,
            Self::ProgressNotConfirmed { .. } | Self::InvalidConfiguration(_) => None,
        }
    }
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("status {code}"),
        None => "no response".to_string(),
    }
}

/// Transport error raised while reading an already-open event stream.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("stream read failed: {0}")]
pub struct StreamReadError(pub String);
