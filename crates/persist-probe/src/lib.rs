//! Black-box probe for "work survives client disconnection".
//!
//! A run logs in, creates an agent session, starts streaming the agent's
//! events and severs the connection early, waits, reads the session back to
//! look for assistant or tool output produced in the meantime, and finally
//! re-attaches to the stream. See [`ProbeRunner`] for the state machine and
//! [`AgentApi`] for the HTTP surface it drives.

pub mod api;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod events;
pub mod poller;
pub mod probe;
pub mod sse;
pub mod testing;
pub mod types;

pub use api::*;
pub use config::*;
pub use consumer::*;
pub use errors::*;
pub use events::{
    ProbeEvent, ProbeEventKind, ProbeEventReceiver, ProbeEventSender, ProbeEventSink,
    probe_event_channel,
};
pub use poller::*;
pub use probe::*;
pub use sse::*;
pub use testing::{MockAgentApi, StreamScript};
pub use types::*;
