//! Events flowing out of execution contexts and out of the supervisor.
//!
//! ```text
//! context ──ContextEvent{generation, run, kind}──► supervisor ──RunEvent──► UI
//! ```
//!
//! Every context event carries the generation of the context that produced it
//! and, for run output, the run id it belongs to. The supervisor drops events
//! whose tags do not match its current generation and run.

use serde::{Deserialize, Serialize};

/// Completion code reported when a context is forcibly terminated.
pub const TERMINATED_EXIT_CODE: i32 = -1;

/// Error text of the single synthetic event emitted on termination.
pub const TERMINATED_MESSAGE: &str = "Execution terminated";

/// Lifecycle of an execution session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Context is starting; no run may be dispatched
    Loading,
    Ready,
    Running,
    /// A run just finished; transient on the way back to `Ready`
    Completed,
    /// The context was destroyed; transient on the way to a new `Loading`
    Terminated,
}

/// What a context reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEventKind {
    /// Context finished loading and accepts runs
    Loaded,
    /// A stdout fragment
    Output(String),
    /// A stderr fragment, or a load failure when `run` is `None`
    Error(String),
    /// The run ended on its own
    Completed { exit_code: i32 },
    /// The run stopped after its cancellation token fired
    Cancelled,
}

/// A tagged event from an execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEvent {
    pub generation: u64,
    /// Run the event belongs to; `None` for context-level events
    pub run: Option<u64>,
    pub kind: ContextEventKind,
}

impl ContextEvent {
    pub fn loaded(generation: u64) -> Self {
        Self {
            generation,
            run: None,
            kind: ContextEventKind::Loaded,
        }
    }

    pub fn load_failed(generation: u64, message: impl Into<String>) -> Self {
        Self {
            generation,
            run: None,
            kind: ContextEventKind::Error(message.into()),
        }
    }

    pub fn output(generation: u64, run: u64, text: impl Into<String>) -> Self {
        Self::for_run(generation, run, ContextEventKind::Output(text.into()))
    }

    pub fn error(generation: u64, run: u64, text: impl Into<String>) -> Self {
        Self::for_run(generation, run, ContextEventKind::Error(text.into()))
    }

    pub fn completed(generation: u64, run: u64, exit_code: i32) -> Self {
        Self::for_run(generation, run, ContextEventKind::Completed { exit_code })
    }

    pub fn cancelled(generation: u64, run: u64) -> Self {
        Self::for_run(generation, run, ContextEventKind::Cancelled)
    }

    fn for_run(generation: u64, run: u64, kind: ContextEventKind) -> Self {
        Self {
            generation,
            run: Some(run),
            kind,
        }
    }
}

/// The UI-facing stream, in the order the supervisor accepted events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StateChanged { generation: u64, state: SessionState },
    Started { run: u64 },
    Output { run: u64, text: String },
    /// `run` is `None` for context load failures
    Error { run: Option<u64>, text: String },
    Finished { run: u64, exit_code: i32 },
    Cancelled { run: u64 },
    /// The one synthetic error emitted by a forced termination
    Terminated {
        generation: u64,
        run: Option<u64>,
        message: String,
        exit_code: i32,
    },
}

impl RunEvent {
    /// Whether this event is an error shown to the user.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Terminated { .. })
    }
}
