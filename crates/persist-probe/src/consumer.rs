use crate::{ByteStream, LineDecoder, LineKind, StreamEvent, decode_line};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info};

/// Which of the two connections a report belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    Initial,
    Resume,
}

impl StreamPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Resume => "resume",
        }
    }
}

/// How a stream read ended. None of these is a failure: a transport error
/// while we are about to sever the connection ourselves is indistinguishable
/// from the server closing it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamTermination {
    /// The window elapsed and the client dropped the connection.
    DeadlineReached,
    /// The server ended the body before the window elapsed.
    ServerClosed,
    /// The transport failed mid-body.
    MidStreamDisconnect { detail: String },
}

impl StreamTermination {
    pub fn label(&self) -> &'static str {
        match self {
            Self::DeadlineReached => "deadline_reached",
            Self::ServerClosed => "server_closed",
            Self::MidStreamDisconnect { .. } => "mid_stream_disconnect",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamReport {
    pub phase: StreamPhase,
    pub event_count: usize,
    pub event_types: Vec<String>,
    pub malformed_lines: usize,
    pub elapsed_ms: u64,
    pub termination: StreamTermination,
}

/// Reads an event stream for a fixed window, then severs it.
#[derive(Clone, Copy, Debug)]
pub struct StreamConsumer {
    window: Duration,
}

impl StreamConsumer {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Consumes `stream` until the window elapses or the stream ends.
    ///
    /// Waiting for the next chunk is bounded by the deadline, so this returns
    /// within the window plus the time to process one chunk even when the
    /// server goes quiet. `on_event` sees each parsed event with its 1-based
    /// index. The stream is dropped before returning; when the deadline fired
    /// that drop is the abrupt client-side disconnect.
    pub async fn consume<F>(
        &self,
        mut stream: ByteStream,
        phase: StreamPhase,
        mut on_event: F,
    ) -> StreamReport
    where
        F: FnMut(usize, &StreamEvent),
    {
        let started = Instant::now();
        let deadline = started + self.window;
        let mut decoder = LineDecoder::new();
        let mut tally = Tally::default();

        let termination = 'read: loop {
            let next = match timeout_at(deadline, stream.next()).await {
                Ok(next) => next,
                Err(_) => break 'read StreamTermination::DeadlineReached,
            };

            match next {
                Some(Ok(chunk)) => {
                    for line in decoder.push(&chunk) {
                        if Instant::now() >= deadline {
                            break 'read StreamTermination::DeadlineReached;
                        }
                        tally.observe(phase, &line, &mut on_event);
                    }
                }
                Some(Err(error)) => {
                    info!(
                        phase = phase.as_str(),
                        %error,
                        "stream interrupted mid-read; treating as disconnect"
                    );
                    break 'read StreamTermination::MidStreamDisconnect {
                        detail: error.0,
                    };
                }
                None => {
                    if let Some(line) = std::mem::take(&mut decoder).finish() {
                        tally.observe(phase, &line, &mut on_event);
                    }
                    break 'read StreamTermination::ServerClosed;
                }
            }
        };

        drop(stream);

        let elapsed = started.elapsed();
        info!(
            phase = phase.as_str(),
            events = tally.event_count,
            elapsed_ms = elapsed.as_millis() as u64,
            termination = termination.label(),
            "stream closed"
        );

        StreamReport {
            phase,
            event_count: tally.event_count,
            event_types: tally.event_types,
            malformed_lines: tally.malformed_lines,
            elapsed_ms: elapsed.as_millis() as u64,
            termination,
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    event_count: usize,
    event_types: Vec<String>,
    malformed_lines: usize,
}

impl Tally {
    fn observe<F>(&mut self, phase: StreamPhase, line: &str, on_event: &mut F)
    where
        F: FnMut(usize, &StreamEvent),
    {
        match decode_line(line) {
            LineKind::Blank | LineKind::Ignored => {}
            LineKind::Malformed { raw, reason } => {
                self.malformed_lines += 1;
                debug!(phase = phase.as_str(), %raw, %reason, "skipping malformed data line");
            }
            LineKind::Event(event) => {
                self.event_count += 1;
                info!(
                    phase = phase.as_str(),
                    index = self.event_count,
                    event_type = %event.event_type,
                    "stream event"
                );
                on_event(self.event_count, &event);
                self.event_types.push(event.event_type);
            }
        }
    }
}
