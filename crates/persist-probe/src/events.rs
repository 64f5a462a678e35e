use crate::{ProbeState, StreamPhase, StreamTermination};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: ProbeEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProbeEventKind {
    StateReached {
        state: ProbeState,
    },
    StreamOpened {
        phase: StreamPhase,
        session_id: String,
        messages_sent: usize,
    },
    StreamEvent {
        phase: StreamPhase,
        index: usize,
        event_type: String,
    },
    StreamClosed {
        phase: StreamPhase,
        event_count: usize,
        termination: StreamTermination,
    },
    ProgressChecked {
        total_messages: usize,
        assistant_messages: usize,
        tool_messages: usize,
        roles: Vec<String>,
    },
    RunFailed {
        failed_at: ProbeState,
        reason: String,
    },
    RunPassed {
        session_id: String,
        resumed_events: usize,
    },
}

pub type ProbeEventSender = mpsc::UnboundedSender<ProbeEvent>;
pub type ProbeEventReceiver = mpsc::UnboundedReceiver<ProbeEvent>;

/// Numbers, stamps and forwards the events of one run.
///
/// A default sink is disabled: it drops every event without consuming a
/// sequence number.
#[derive(Debug, Default)]
pub struct ProbeEventSink {
    sender: Option<ProbeEventSender>,
    sequence_no: u64,
}

impl ProbeEventSink {
    pub fn with_sender(sender: ProbeEventSender) -> Self {
        Self {
            sender: Some(sender),
            sequence_no: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.sequence_no
    }

    pub fn emit(&mut self, kind: ProbeEventKind) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        self.sequence_no += 1;
        let event = ProbeEvent {
            sequence_no: self.sequence_no,
            timestamp: timestamp_now(),
            kind,
        };
        if sender.send(event).is_err() {
            // Receiver is gone; keep the run going without events.
            self.sender = None;
        }
    }
}

pub fn probe_event_channel() -> (ProbeEventSender, ProbeEventReceiver) {
    mpsc::unbounded_channel()
}

fn timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03}Z",
        since_epoch.as_secs(),
        since_epoch.subsec_millis()
    )
}
