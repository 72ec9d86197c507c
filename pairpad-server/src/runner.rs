//! `pairpad run`: one script, one supervised session.

use std::sync::Arc;

use pairpad_exec::{
    ExecError, ExecutionRuntime, ExecutionSupervisor, RunEvent, SessionState, SupervisorConfig,
    TERMINATED_EXIT_CODE,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Exit code reported when the time limit cancelled the run.
pub const CANCELLED_EXIT_CODE: i32 = 124;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Execution context failed to load: {0}")]
    Load(String),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),
}

/// Run `code` to completion, copying its stdout and stderr fragments to the
/// given writers. Returns the run's exit code.
///
/// `interrupt` resolving terminates the context; the result is then the
/// termination sentinel.
pub async fn run_script<O, E>(
    runtime: Arc<dyn ExecutionRuntime>,
    config: SupervisorConfig,
    code: String,
    stdout: &mut O,
    stderr: &mut E,
    interrupt: impl std::future::Future<Output = ()>,
) -> Result<i32, RunError>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let (sup, mut events) = ExecutionSupervisor::spawn(runtime, config);

    loop {
        match events.recv().await {
            Some(RunEvent::StateChanged {
                state: SessionState::Ready,
                ..
            }) => break,
            Some(RunEvent::Error { run: None, text }) => return Err(RunError::Load(text)),
            Some(_) => {}
            None => return Err(ExecError::SupervisorStopped.into()),
        }
    }

    let run = sup.start(code).await?;
    log::debug!("Started run {run}");

    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RunEvent::Output { text, .. }) => {
                    stdout.write_all(text.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Some(RunEvent::Error { text, .. }) => {
                    stderr.write_all(text.as_bytes()).await?;
                    stderr.flush().await?;
                }
                Some(RunEvent::Finished { exit_code, .. }) => return Ok(exit_code),
                Some(RunEvent::Cancelled { .. }) => {
                    log::warn!("Run {run} hit its time limit");
                    return Ok(CANCELLED_EXIT_CODE);
                }
                Some(_) => {}
                None => return Err(ExecError::SupervisorStopped.into()),
            },
            _ = &mut interrupt => {
                sup.terminate().await?;
                log::warn!("Run {run} terminated");
                return Ok(TERMINATED_EXIT_CODE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairpad_exec::{ProcessRuntime, RuntimeConfig};
    use std::future::pending;
    use std::time::Duration;

    fn shell() -> Arc<dyn ExecutionRuntime> {
        Arc::new(ProcessRuntime::new(RuntimeConfig::shell()))
    }

    #[tokio::test]
    async fn test_streams_output_and_exit_code() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = run_script(
            shell(),
            SupervisorConfig::default(),
            "echo one\necho two 1>&2\nexit 4\n".into(),
            &mut out,
            &mut err,
            pending(),
        )
        .await
        .unwrap();

        assert_eq!(code, 4);
        assert_eq!(String::from_utf8(out).unwrap(), "one\n");
        assert_eq!(String::from_utf8(err).unwrap(), "two\n");
    }

    #[tokio::test]
    async fn test_interrupt_terminates() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = run_script(
            shell(),
            SupervisorConfig::default(),
            "exec sleep 30\n".into(),
            &mut out,
            &mut err,
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert_eq!(code, TERMINATED_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_time_limit() {
        let config = SupervisorConfig {
            run_time_limit: Some(Duration::from_millis(200)),
            ..SupervisorConfig::default()
        };
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = run_script(shell(), config, "exec sleep 30\n".into(), &mut out, &mut err, pending())
            .await
            .unwrap();
        assert_eq!(code, CANCELLED_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let runtime = Arc::new(ProcessRuntime::new(RuntimeConfig {
            program: "pairpad-no-such-interpreter".into(),
            ..RuntimeConfig::default()
        }));
        let mut out = Vec::new();
        let mut err = Vec::new();
        let result = run_script(runtime, SupervisorConfig::default(), String::new(), &mut out, &mut err, pending()).await;
        assert!(matches!(result, Err(RunError::Load(_))));
    }
}
