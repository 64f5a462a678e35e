use crate::{Credentials, ProbeError, SessionOptions};
use std::time::Duration;

pub const DEFAULT_API_PREFIX: &str = "/api";

/// Multi-step task that keeps an agent busy well past the first stream window.
pub const DEFAULT_PROMPT: &str = "Research the three most recent stable Rust releases on the web. \
For each one, note the release date and its headline feature. Then write a short summary of \
your findings to notes/rust-releases.md and reply with the file contents.";

/// Timing of the disconnect/resume scenario.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimingConfig {
    /// How long the first stream is read before the client severs it.
    pub disconnect_after: Duration,
    /// Wait between the disconnect and the snapshot read.
    pub progress_wait: Duration,
    /// Cadence for incremental progress checks. Only reported today.
    pub poll_interval: Duration,
    /// How long the re-attached stream is read.
    pub resume_window: Duration,
    /// Timeout for the non-streaming calls.
    pub request_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            disconnect_after: Duration::from_secs(3),
            progress_wait: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            resume_window: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything a probe run needs, handed to the runner at construction.
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeConfig {
    pub base_url: String,
    pub api_prefix: String,
    pub credentials: Credentials,
    pub agent_file: String,
    pub prompt: String,
    pub session: SessionOptions,
    pub timing: TimingConfig,
}

impl ProbeConfig {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Credentials,
        agent_file: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            credentials,
            agent_file: agent_file.into(),
            prompt: DEFAULT_PROMPT.to_string(),
            session: SessionOptions::default(),
            timing: TimingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.base_url.trim().is_empty() {
            return Err(invalid("base_url must not be empty"));
        }
        if self.agent_file.trim().is_empty() {
            return Err(invalid("agent_file must not be empty"));
        }
        if self.prompt.trim().is_empty() {
            return Err(invalid("prompt must not be empty"));
        }
        if self.credentials.identifier().trim().is_empty() {
            return Err(invalid("credentials identifier must not be empty"));
        }
        if self.timing.disconnect_after.is_zero() {
            return Err(invalid("disconnect_after must be greater than zero"));
        }
        if self.timing.resume_window.is_zero() {
            return Err(invalid("resume_window must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ProbeError {
    ProbeError::InvalidConfiguration(message.to_string())
}
