//! Supervisor driving real interpreter subprocesses (POSIX `sh`).

use pairpad_exec::{
    ExecutionSupervisor, ProcessRuntime, RunEvent, RuntimeConfig, SessionState,
    SupervisorConfig, SupervisorHandle, TERMINATED_EXIT_CODE,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};

async fn shell_session(config: SupervisorConfig) -> (SupervisorHandle, UnboundedReceiver<RunEvent>) {
    let runtime = Arc::new(ProcessRuntime::new(RuntimeConfig::shell()));
    let (sup, rx) = ExecutionSupervisor::spawn(runtime, config);
    timeout(Duration::from_secs(10), sup.wait_ready())
        .await
        .expect("shell context did not load")
        .unwrap();
    (sup, rx)
}

/// Collect events up to and including the run's terminal event.
async fn collect_run(rx: &mut UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.unwrap();
            let done = matches!(event, RunEvent::Finished { .. } | RunEvent::Cancelled { .. });
            events.push(event);
            if done {
                return;
            }
        }
    })
    .await
    .expect("run did not end");
    events
}

fn outputs(events: &[RunEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Output { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_stdout_stderr_and_exit_code() {
    let (sup, mut rx) = shell_session(SupervisorConfig::default()).await;

    let run = sup.start("echo hello\necho oops 1>&2\nexit 3\n").await.unwrap();
    let events = collect_run(&mut rx).await;

    assert_eq!(outputs(&events), "hello\n");
    assert!(events.contains(&RunEvent::Error {
        run: Some(run),
        text: "oops\n".into()
    }));
    assert_eq!(events.last(), Some(&RunEvent::Finished { run, exit_code: 3 }));

    sup.wait_ready().await.unwrap();
    let snap = sup.snapshot().await.unwrap();
    assert_eq!(snap.output, "hello\n");
    assert_eq!(snap.errors, "oops\n");
}

#[tokio::test]
async fn test_clean_run_exits_zero() {
    let (sup, mut rx) = shell_session(SupervisorConfig::default()).await;

    let run = sup.start("i=0\nwhile [ $i -lt 3 ]; do echo $i; i=$((i+1)); done\n").await.unwrap();
    let events = collect_run(&mut rx).await;

    assert_eq!(outputs(&events), "0\n1\n2\n");
    assert_eq!(events.last(), Some(&RunEvent::Finished { run, exit_code: 0 }));
}

#[tokio::test]
async fn test_stderr_alone_fails_the_run() {
    let (sup, mut rx) = shell_session(SupervisorConfig::default()).await;

    let run = sup.start("echo warning 1>&2\n").await.unwrap();
    let events = collect_run(&mut rx).await;
    assert_eq!(events.last(), Some(&RunEvent::Finished { run, exit_code: 1 }));
}

#[tokio::test]
async fn test_runs_in_cleared_sandbox() {
    let (sup, mut rx) = shell_session(SupervisorConfig::default()).await;

    sup.start("echo \"home=${HOME:-unset}\"\npwd\n").await.unwrap();
    let text = outputs(&collect_run(&mut rx).await);

    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("home=unset"));
    assert!(lines.next().unwrap().contains("pairpad-run-"));
}

#[tokio::test]
async fn test_cancel_stops_process() {
    let (sup, mut rx) = shell_session(SupervisorConfig::default()).await;

    let run = sup.start("echo started\nexec sleep 30\n").await.unwrap();
    timeout(Duration::from_secs(10), async {
        while !matches!(rx.recv().await, Some(RunEvent::Output { .. })) {}
    })
    .await
    .unwrap();

    assert_eq!(sup.cancel().await, Ok(run));
    let events = collect_run(&mut rx).await;
    assert_eq!(events.last(), Some(&RunEvent::Cancelled { run }));

    sup.wait_ready().await.unwrap();
    assert_eq!(sup.snapshot().await.unwrap().generation, 1);
}

#[tokio::test]
async fn test_terminate_relaunches_context() {
    let (sup, mut rx) = shell_session(SupervisorConfig::default()).await;

    let run = sup.start("exec sleep 30\n").await.unwrap();
    assert_eq!(sup.terminate().await, Ok(2));

    let mut sentinels = 0;
    timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await.unwrap() {
                RunEvent::Terminated {
                    generation,
                    run: terminated,
                    exit_code,
                    ..
                } => {
                    assert_eq!((generation, terminated, exit_code), (1, Some(run), TERMINATED_EXIT_CODE));
                    sentinels += 1;
                }
                RunEvent::StateChanged {
                    generation: 2,
                    state: SessionState::Ready,
                } => return,
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(sentinels, 1);

    sup.start("echo again\n").await.unwrap();
    assert_eq!(outputs(&collect_run(&mut rx).await), "again\n");
}

#[tokio::test]
async fn test_time_limit_cancels_process() {
    let config = SupervisorConfig {
        run_time_limit: Some(Duration::from_millis(300)),
        ..SupervisorConfig::default()
    };
    let (sup, mut rx) = shell_session(config).await;

    let run = sup.start("exec sleep 30\n").await.unwrap();
    let events = collect_run(&mut rx).await;
    assert_eq!(events.last(), Some(&RunEvent::Cancelled { run }));
}

#[tokio::test]
async fn test_invalid_utf8_does_not_stall_output() {
    let (sup, mut rx) = shell_session(SupervisorConfig::default()).await;

    // Enough lines after the bad byte to fill the pipe if nobody reads it
    let script = "printf 'a\\377b\\n'\n\
                  i=0\n\
                  while [ $i -lt 20000 ]; do echo line; i=$((i+1)); done\n\
                  echo AFTER\n";
    let run = sup.start(script).await.unwrap();
    let events = collect_run(&mut rx).await;

    let fragments: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Output { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(fragments.len(), 20002);
    assert_eq!(fragments[0], "a\u{FFFD}b\n");
    assert_eq!(fragments.last(), Some(&"AFTER\n"));
    assert_eq!(events.last(), Some(&RunEvent::Finished { run, exit_code: 0 }));
}

#[tokio::test]
async fn test_unterminated_output_is_relayed_as_is() {
    let (sup, mut rx) = shell_session(SupervisorConfig::default()).await;

    sup.start("printf abc\nprintf def 1>&2\nexit 0\n").await.unwrap();
    let events = collect_run(&mut rx).await;

    assert_eq!(outputs(&events), "abc");
    let errors: String = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Error { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(errors, "def");
}
