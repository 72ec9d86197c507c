//! The execution supervisor.
//!
//! One actor task owns the session state machine, the current context, and the
//! output/error buffers. Commands arrive from [`SupervisorHandle`]s; context
//! events arrive on a channel whose sender is handed to every context the
//! supervisor launches. Everything the UI should see goes out on the
//! [`RunEvent`] stream in the order the actor accepted it.
//!
//! ```text
//!   Loading ──loaded──► Ready ──start──► Running ──completed──► Completed ─► Ready
//!      ▲                  │                 │  └──cancelled──────────────────► Ready
//!      │                  └──terminate──────┴──► Terminated ─► (generation + 1) Loading
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::event::{ContextEvent, ContextEventKind, RunEvent, SessionState, TERMINATED_EXIT_CODE, TERMINATED_MESSAGE};
use crate::runtime::{ContextHandle, Dispatch, ExecutionRuntime};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("cannot start a run while {0:?}")]
    NotReady(SessionState),
    #[error("no run in progress")]
    NotRunning,
    #[error("cannot terminate while {0:?}")]
    CannotTerminate(SessionState),
    #[error("execution context generation {0} is gone")]
    ContextGone(u64),
    #[error("failed to start interpreter: {0}")]
    Spawn(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("supervisor stopped")]
    SupervisorStopped,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Error text recorded when a context is terminated
    pub terminated_message: String,
    /// Runs longer than this are cancelled; `None` for no limit
    pub run_time_limit: Option<Duration>,
    pub command_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            terminated_message: TERMINATED_MESSAGE.to_string(),
            run_time_limit: None,
            command_capacity: 64,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub generation: u64,
    pub state: SessionState,
    /// Run currently in progress
    pub run: Option<u64>,
    pub output: String,
    pub errors: String,
    pub last_exit_code: Option<i32>,
}

enum SupervisorCommand {
    Start {
        code: String,
        reply: oneshot::Sender<Result<u64, ExecError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<u64, ExecError>>,
    },
    Terminate {
        reply: oneshot::Sender<Result<u64, ExecError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Cloneable handle to a supervisor actor. The actor stops, destroying its
/// context, once every handle is dropped.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<SupervisorCommand>,
    state: watch::Receiver<SessionState>,
}

impl SupervisorHandle {
    /// Dispatch `code` as a new run. Only valid while `Ready`.
    pub async fn start(&self, code: impl Into<String>) -> Result<u64, ExecError> {
        let code = code.into();
        self.request(|reply| SupervisorCommand::Start { code, reply }).await?
    }

    /// Ask the running code to stop. Returns the run id being cancelled.
    pub async fn cancel(&self) -> Result<u64, ExecError> {
        self.request(|reply| SupervisorCommand::Cancel { reply }).await?
    }

    /// Destroy the context and start a fresh one. Returns the new generation.
    ///
    /// Rejected while the context is still loading. That includes a context
    /// whose load failed: it stays in `Loading`, and only a new supervisor
    /// can recover the session.
    pub async fn terminate(&self) -> Result<u64, ExecError> {
        self.request(|reply| SupervisorCommand::Terminate { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, ExecError> {
        self.request(|reply| SupervisorCommand::Snapshot { reply }).await
    }

    /// Wait until the session accepts runs.
    ///
    /// Never resolves after a failed load; watch for the load error event
    /// or put a timeout around it.
    pub async fn wait_ready(&self) -> Result<(), ExecError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == SessionState::Ready)
            .await
            .map_err(|_| ExecError::SupervisorStopped)?;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, ExecError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ExecError::SupervisorStopped)?;
        rx.await.map_err(|_| ExecError::SupervisorStopped)
    }
}

struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
    failed: bool,
}

pub struct ExecutionSupervisor {
    runtime: Arc<dyn ExecutionRuntime>,
    config: SupervisorConfig,
    generation: u64,
    state: SessionState,
    context: Option<ContextHandle>,
    current: Option<ActiveRun>,
    next_run: u64,
    output: String,
    errors: String,
    last_exit_code: Option<i32>,
    context_tx: mpsc::UnboundedSender<ContextEvent>,
    context_rx: mpsc::UnboundedReceiver<ContextEvent>,
    ui: mpsc::UnboundedSender<RunEvent>,
    state_tx: watch::Sender<SessionState>,
}

impl ExecutionSupervisor {
    /// Launch the first context and start the actor.
    pub fn spawn(
        runtime: Arc<dyn ExecutionRuntime>,
        config: SupervisorConfig,
    ) -> (SupervisorHandle, mpsc::UnboundedReceiver<RunEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity.max(1));
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (context_tx, context_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Loading);

        let mut supervisor = Self {
            runtime,
            config,
            generation: 0,
            state: SessionState::Loading,
            context: None,
            current: None,
            next_run: 1,
            output: String::new(),
            errors: String::new(),
            last_exit_code: None,
            context_tx,
            context_rx,
            ui: ui_tx,
            state_tx,
        };
        supervisor.launch_context();
        tokio::spawn(supervisor.run(cmd_rx));

        let handle = SupervisorHandle {
            commands: cmd_tx,
            state: state_rx,
        };
        (handle, ui_rx)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SupervisorCommand>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(event) = self.context_rx.recv() => self.handle_context_event(event),
            }
        }

        if let Some(run) = self.current.take() {
            run.cancel.cancel();
        }
        self.context = None;
        log::debug!("Supervisor stopped at generation {}", self.generation);
    }

    fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::Start { code, reply } => {
                let _ = reply.send(self.start(code));
            }
            SupervisorCommand::Cancel { reply } => {
                let _ = reply.send(self.cancel());
            }
            SupervisorCommand::Terminate { reply } => {
                let _ = reply.send(self.terminate());
            }
            SupervisorCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn start(&mut self, code: String) -> Result<u64, ExecError> {
        if self.state != SessionState::Ready {
            return Err(ExecError::NotReady(self.state));
        }
        let context = self.context.as_ref().ok_or(ExecError::ContextGone(self.generation))?;

        let run = self.next_run;
        let cancel = CancellationToken::new();
        context.dispatch(Dispatch {
            run,
            code,
            cancel: cancel.clone(),
        })?;
        self.next_run += 1;

        self.output.clear();
        self.errors.clear();
        self.current = Some(ActiveRun {
            id: run,
            cancel: cancel.clone(),
            failed: false,
        });
        self.set_state(SessionState::Running);
        self.emit(RunEvent::Started { run });
        log::info!("Run {run} started (generation {})", self.generation);

        if let Some(limit) = self.config.run_time_limit {
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        log::warn!("Run {run} exceeded {limit:?}, cancelling");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        }
        Ok(run)
    }

    fn cancel(&mut self) -> Result<u64, ExecError> {
        match (&self.state, &self.current) {
            (SessionState::Running, Some(run)) => {
                log::info!("Cancelling run {}", run.id);
                run.cancel.cancel();
                Ok(run.id)
            }
            _ => Err(ExecError::NotRunning),
        }
    }

    fn terminate(&mut self) -> Result<u64, ExecError> {
        if !matches!(self.state, SessionState::Running | SessionState::Ready) {
            return Err(ExecError::CannotTerminate(self.state));
        }

        let run = self.current.take().map(|run| {
            run.cancel.cancel();
            run.id
        });
        if let Some(context) = self.context.take() {
            context.destroy();
        }
        log::warn!("Terminated context generation {} (run {run:?})", self.generation);

        self.set_state(SessionState::Terminated);
        let message = self.config.terminated_message.clone();
        self.errors.push_str(&message);
        self.last_exit_code = Some(TERMINATED_EXIT_CODE);
        self.emit(RunEvent::Terminated {
            generation: self.generation,
            run,
            message,
            exit_code: TERMINATED_EXIT_CODE,
        });

        self.launch_context();
        Ok(self.generation)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            generation: self.generation,
            state: self.state,
            run: self.current.as_ref().map(|run| run.id),
            output: self.output.clone(),
            errors: self.errors.clone(),
            last_exit_code: self.last_exit_code,
        }
    }

    fn launch_context(&mut self) {
        self.generation += 1;
        self.context = Some(self.runtime.launch(self.generation, self.context_tx.clone()));
        self.set_state(SessionState::Loading);
        log::debug!("Launched context generation {}", self.generation);
    }

    fn handle_context_event(&mut self, event: ContextEvent) {
        if event.generation != self.generation {
            log::trace!(
                "Dropping event from stale generation {} (current {})",
                event.generation,
                self.generation
            );
            return;
        }

        let Some(run) = event.run else {
            match event.kind {
                ContextEventKind::Loaded if self.state == SessionState::Loading => {
                    log::info!("Context generation {} ready", self.generation);
                    self.set_state(SessionState::Ready);
                }
                ContextEventKind::Error(text) => {
                    // Load failure: stay out of Ready
                    log::error!("Context generation {} failed: {text}", self.generation);
                    self.errors.push_str(&text);
                    self.emit(RunEvent::Error { run: None, text });
                }
                _ => {}
            }
            return;
        };

        if self.current.as_ref().map(|r| r.id) != Some(run) {
            log::trace!("Dropping event for finished run {run}");
            return;
        }

        match event.kind {
            ContextEventKind::Output(text) => {
                self.output.push_str(&text);
                self.emit(RunEvent::Output { run, text });
            }
            ContextEventKind::Error(text) => {
                if let Some(active) = self.current.as_mut() {
                    active.failed = true;
                }
                self.errors.push_str(&text);
                self.emit(RunEvent::Error { run: Some(run), text });
            }
            ContextEventKind::Completed { exit_code } => {
                let failed = self.finish_run();
                let exit_code = if failed && exit_code == 0 { 1 } else { exit_code };
                self.last_exit_code = Some(exit_code);
                self.emit(RunEvent::Finished { run, exit_code });
                log::info!("Run {run} finished with {exit_code}");
                self.set_state(SessionState::Completed);
                self.set_state(SessionState::Ready);
            }
            ContextEventKind::Cancelled => {
                self.finish_run();
                self.emit(RunEvent::Cancelled { run });
                log::info!("Run {run} cancelled");
                self.set_state(SessionState::Ready);
            }
            ContextEventKind::Loaded => {}
        }
    }

    /// Clear the active run, returning whether it had failed.
    fn finish_run(&mut self) -> bool {
        match self.current.take() {
            Some(run) => {
                // Also stops the time-limit watcher
                run.cancel.cancel();
                run.failed
            }
            None => false,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(RunEvent::StateChanged {
            generation: self.generation,
            state,
        });
    }

    fn emit(&self, event: RunEvent) {
        if self.ui.send(event).is_err() {
            log::trace!("Run event receiver dropped");
        }
    }
}
