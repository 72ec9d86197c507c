//! # pairpad-exec: Supervised code execution for pairpad
//!
//! Runs the shared buffer's code in an isolated execution context and streams
//! its output back. A context belongs to one *generation*; terminating it
//! bumps the generation, so anything the old context still says is ignored.
//!
//! ```text
//! ┌──────────────────┐ start/cancel/terminate ┌──────────────────────┐
//! │ SupervisorHandle │ ─────────────────────► │ ExecutionSupervisor  │──► RunEvent stream
//! └──────────────────┘                        └──────────┬───────────┘
//!                                     Dispatch{run,code} │ ▲ ContextEvent{generation,run}
//!                                                        ▼ │
//!                                             ┌──────────────────────┐
//!                                             │ ExecutionRuntime     │
//!                                             │ (ProcessRuntime)     │
//!                                             └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Context events, UI events and session states
//! - [`runtime`]: Context handles and the sandboxed subprocess runtime
//! - [`supervisor`]: The generation-tracking state machine

pub mod event;
pub mod runtime;
pub mod supervisor;

pub use event::{
    ContextEvent, ContextEventKind, RunEvent, SessionState, TERMINATED_EXIT_CODE,
    TERMINATED_MESSAGE,
};
pub use runtime::{
    ContextHandle, ContextPort, Dispatch, EventSender, ExecutionRuntime, ProcessRuntime,
    RuntimeConfig,
};
pub use supervisor::{
    ExecError, ExecutionSupervisor, SessionSnapshot, SupervisorConfig, SupervisorHandle,
};
