//! Execution contexts.
//!
//! A runtime launches one context per generation. The supervisor talks to a
//! context through its [`ContextHandle`]: it dispatches runs (source text plus
//! a cancellation token) and destroys the context on termination. The context
//! talks back only through tagged [`ContextEvent`]s.
//!
//! [`ProcessRuntime`] runs each dispatch in an interpreter subprocess with a
//! cleared environment inside a private temporary directory. Destroying the
//! context kills whatever it is running.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::ContextEvent;
use crate::ExecError;

/// Sender half of the context → supervisor event stream.
pub type EventSender = mpsc::UnboundedSender<ContextEvent>;

/// One run handed to a context.
#[derive(Debug)]
pub struct Dispatch {
    pub run: u64,
    pub code: String,
    /// Cooperative cancellation for this run only
    pub cancel: CancellationToken,
}

/// Supervisor-side handle to a live context.
///
/// Dropping the handle destroys the context.
#[derive(Debug)]
pub struct ContextHandle {
    generation: u64,
    dispatches: mpsc::UnboundedSender<Dispatch>,
    shutdown: CancellationToken,
}

/// Runtime-side end of a context: where dispatches arrive and events go.
#[derive(Debug)]
pub struct ContextPort {
    pub generation: u64,
    pub dispatches: mpsc::UnboundedReceiver<Dispatch>,
    /// Fires when the context is destroyed
    pub shutdown: CancellationToken,
    pub events: EventSender,
}

impl ContextHandle {
    /// Create a connected handle / port pair for `generation`.
    pub fn pair(generation: u64, events: EventSender) -> (Self, ContextPort) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = Self {
            generation,
            dispatches: tx,
            shutdown: shutdown.clone(),
        };
        let port = ContextPort {
            generation,
            dispatches: rx,
            shutdown,
            events,
        };
        (handle, port)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dispatch(&self, dispatch: Dispatch) -> Result<(), ExecError> {
        self.dispatches
            .send(dispatch)
            .map_err(|_| ExecError::ContextGone(self.generation))
    }

    /// Destroy the context. Its events are stale from here on.
    pub fn destroy(self) {
        // Drop does the work
    }

    pub fn is_destroyed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl ContextPort {
    /// Send an event; a gone supervisor is not an error for the context.
    pub fn emit(&self, event: ContextEvent) {
        let _ = self.events.send(event);
    }
}

/// Launches execution contexts.
pub trait ExecutionRuntime: Send + Sync {
    /// Start a context for `generation`. The context must eventually emit
    /// `Loaded`, or a load failure, on `events`.
    fn launch(&self, generation: u64, events: EventSender) -> ContextHandle;
}

/// Interpreter subprocess configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Interpreter binary
    pub program: String,
    /// Arguments placed before the script path
    pub args: Vec<String>,
    /// Arguments for the load probe, which must exit 0
    pub probe_args: Vec<String>,
    /// Script file name inside the sandbox directory
    pub script_name: String,
    /// The only environment variables the interpreter sees
    pub env: Vec<(String, String)>,
    /// Parent directory for sandbox directories (system temp dir if `None`)
    pub sandbox_root: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-u".to_string(), "-I".to_string()],
            probe_args: vec!["--version".to_string()],
            script_name: "main.py".to_string(),
            env: vec![("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string())],
            sandbox_root: None,
        }
    }
}

impl RuntimeConfig {
    /// POSIX shell instead of Python; handy where no Python is installed.
    pub fn shell() -> Self {
        Self {
            program: "sh".to_string(),
            args: Vec::new(),
            probe_args: vec!["-c".to_string(), "exit 0".to_string()],
            script_name: "main.sh".to_string(),
            ..Self::default()
        }
    }
}

/// Runs code in sandboxed interpreter subprocesses.
#[derive(Debug, Clone, Default)]
pub struct ProcessRuntime {
    config: RuntimeConfig,
}

impl ProcessRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl ExecutionRuntime for ProcessRuntime {
    fn launch(&self, generation: u64, events: EventSender) -> ContextHandle {
        let (handle, port) = ContextHandle::pair(generation, events);
        tokio::spawn(ProcessContext::new(self.config.clone(), port).run());
        handle
    }
}

/// One generation's worth of subprocess execution.
struct ProcessContext {
    config: RuntimeConfig,
    port: ContextPort,
}

enum RunOutcome {
    Exited(i32),
    Cancelled,
    Destroyed,
}

impl ProcessContext {
    fn new(config: RuntimeConfig, port: ContextPort) -> Self {
        Self { config, port }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.env_clear()
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(mut self) {
        let generation = self.port.generation;

        let sandbox = match self.sandbox() {
            Ok(dir) => dir,
            Err(e) => {
                self.port
                    .emit(ContextEvent::load_failed(generation, format!("Failed to load runtime: {e}")));
                return;
            }
        };

        if let Err(e) = self.probe(&sandbox).await {
            log::error!("Runtime probe failed for generation {generation}: {e}");
            self.port
                .emit(ContextEvent::load_failed(generation, format!("Failed to load runtime: {e}")));
            return;
        }
        log::debug!("Context generation {generation} loaded in {}", sandbox.path().display());
        self.port.emit(ContextEvent::loaded(generation));

        loop {
            let dispatch = tokio::select! {
                d = self.port.dispatches.recv() => match d {
                    Some(d) => d,
                    None => break,
                },
                _ = self.port.shutdown.cancelled() => break,
            };

            let run = dispatch.run;
            match self.execute(&sandbox, dispatch).await {
                Ok(RunOutcome::Exited(code)) => self.port.emit(ContextEvent::completed(generation, run, code)),
                Ok(RunOutcome::Cancelled) => self.port.emit(ContextEvent::cancelled(generation, run)),
                Ok(RunOutcome::Destroyed) => break,
                Err(e) => {
                    // Runtime error: the run fails, the context survives
                    self.port.emit(ContextEvent::error(generation, run, e.to_string()));
                    self.port.emit(ContextEvent::completed(generation, run, 1));
                }
            }
        }

        log::debug!("Context generation {generation} shut down");
    }

    fn sandbox(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("pairpad-run-");
        match &self.config.sandbox_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
    }

    async fn probe(&self, sandbox: &tempfile::TempDir) -> Result<(), ExecError> {
        let status = self
            .command()
            .args(&self.config.probe_args)
            .current_dir(sandbox.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ExecError::Spawn(format!("{}: {e}", self.config.program)))?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Spawn(format!("{} probe exited with {status}", self.config.program)))
        }
    }

    async fn execute(&self, sandbox: &tempfile::TempDir, dispatch: Dispatch) -> Result<RunOutcome, ExecError> {
        let generation = self.port.generation;
        let Dispatch { run, code, cancel } = dispatch;

        let script = sandbox.path().join(&self.config.script_name);
        tokio::fs::write(&script, code.as_bytes())
            .await
            .map_err(|e| ExecError::Io(e.to_string()))?;

        let mut child = self
            .command()
            .args(&self.config.args)
            .arg(&script)
            .current_dir(sandbox.path())
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{}: {e}", self.config.program)))?;
        log::debug!("Run {run} (generation {generation}) started, pid {:?}", child.id());

        let stdout = child.stdout.take().ok_or(ExecError::Io("stdout not piped".into()))?;
        let stderr = child.stderr.take().ok_or(ExecError::Io("stderr not piped".into()))?;
        let mut out = BufReader::new(stdout);
        let mut err = BufReader::new(stderr);
        // Bytes of a line cut short by another branch stay here for the next read
        let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
        let (mut out_open, mut err_open) = (true, true);

        while out_open || err_open {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Self::stop(&mut child, RunOutcome::Cancelled).await),
                _ = self.port.shutdown.cancelled() => return Ok(Self::stop(&mut child, RunOutcome::Destroyed).await),
                read = out.read_until(b'\n', &mut out_buf), if out_open => {
                    out_open = self.relay(read, &mut out_buf, |text| ContextEvent::output(generation, run, text));
                }
                read = err.read_until(b'\n', &mut err_buf), if err_open => {
                    err_open = self.relay(read, &mut err_buf, |text| ContextEvent::error(generation, run, text));
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => Ok(Self::stop(&mut child, RunOutcome::Cancelled).await),
            _ = self.port.shutdown.cancelled() => Ok(Self::stop(&mut child, RunOutcome::Destroyed).await),
            status = child.wait() => {
                let status = status.map_err(|e| ExecError::Io(e.to_string()))?;
                // Killed by a signal: no code
                Ok(RunOutcome::Exited(status.code().unwrap_or(1)))
            }
        }
    }

    /// Forward one line (or the unterminated tail) as a fragment, decoding
    /// invalid UTF-8 lossily. Returns whether the stream is still open.
    fn relay(
        &self,
        read: std::io::Result<usize>,
        buf: &mut Vec<u8>,
        event: impl FnOnce(String) -> ContextEvent,
    ) -> bool {
        match read {
            Ok(0) => false,
            Ok(_) => {
                let text = String::from_utf8_lossy(buf).into_owned();
                buf.clear();
                self.port.emit(event(text));
                true
            }
            Err(e) => {
                log::warn!("Run output stream failed: {e}");
                false
            }
        }
    }

    async fn stop(child: &mut Child, outcome: RunOutcome) -> RunOutcome {
        if let Err(e) = child.kill().await {
            log::warn!("Failed to kill run process: {e}");
        }
        outcome
    }
}
