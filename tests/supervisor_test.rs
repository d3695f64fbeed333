#![cfg(unix)]

use airband_relay::process::{
    Lifecycle, ProcessEvent, ProcessEventKind, ProcessEvents, ProcessSupervisor,
    RegexReadinessDetector,
};
use std::time::Duration;

const READY_PATTERN: &str = "Allocating [0-9]+ zero-copy buffers";

fn supervisor(timeout: Option<Duration>) -> (ProcessSupervisor, ProcessEvents) {
    let detector = RegexReadinessDetector::new(&[READY_PATTERN]).unwrap();
    let (supervisor, events) = ProcessSupervisor::new("channelizer", detector);
    (supervisor.with_ready_timeout(timeout), events)
}

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

async fn next(events: &mut ProcessEvents) -> ProcessEvent {
    tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("no event within 5s")
        .expect("event queue closed")
}

#[tokio::test]
async fn ready_fires_once_for_first_matching_line() {
    let (supervisor, mut events) = supervisor(None);
    let lifecycle = supervisor
        .run(
            "sh",
            &sh("echo starting; echo 'Allocating 10 zero-copy buffers'; \
                 echo 'Allocating 12 zero-copy buffers'; sleep 0.1"),
        )
        .await
        .unwrap();
    assert_eq!(lifecycle, Lifecycle::Ready);

    let ready = next(&mut events).await;
    assert_eq!(ready.kind, ProcessEventKind::Ready);
    assert_eq!(
        ready.message.as_deref(),
        Some("Allocating 10 zero-copy buffers")
    );

    let exit = next(&mut events).await;
    assert_eq!(exit.kind, ProcessEventKind::Exit);
    assert_eq!(exit.return_code(), Some(0));
    assert!(events.try_next().is_none());
    assert!(supervisor.is_ready());
}

#[tokio::test]
async fn ready_timeout_does_not_kill_the_process() {
    let (supervisor, mut events) = supervisor(Some(Duration::from_millis(100)));
    supervisor
        .spawn(
            "sh",
            &sh("sleep 0.4; echo 'Allocating 4 zero-copy buffers'; sleep 0.1; exit 3"),
        )
        .unwrap();

    assert_eq!(next(&mut events).await.kind, ProcessEventKind::ReadyTimeout);
    assert_eq!(supervisor.lifecycle(), Lifecycle::Starting);

    // Still running: it reports ready later, then exits on its own.
    assert_eq!(next(&mut events).await.kind, ProcessEventKind::Ready);
    let exit = next(&mut events).await;
    assert_eq!(exit.kind, ProcessEventKind::Exit);
    assert_eq!(exit.return_code(), Some(3));
}

#[tokio::test]
async fn exit_before_ready_reports_exit_only() {
    let (supervisor, mut events) = supervisor(Some(Duration::from_secs(5)));
    let lifecycle = supervisor
        .run("sh", &sh("echo 'fatal: no device'; exit 1"))
        .await
        .unwrap();
    assert_eq!(lifecycle, Lifecycle::Exited);

    let exit = next(&mut events).await;
    assert_eq!(exit.kind, ProcessEventKind::Exit);
    assert_eq!(exit.return_code(), Some(1));
    assert!(!supervisor.is_ready());
}

#[tokio::test]
async fn stop_kills_and_reports_exit_once() {
    let (supervisor, mut events) = supervisor(None);
    supervisor
        .run(
            "sh",
            &sh("echo 'Allocating 1 zero-copy buffers'; sleep 30"),
        )
        .await
        .unwrap();
    assert_eq!(next(&mut events).await.kind, ProcessEventKind::Ready);

    supervisor.stop();
    supervisor.stop();
    tokio::time::timeout(Duration::from_secs(5), supervisor.wait_exit())
        .await
        .unwrap();

    let exit = next(&mut events).await;
    assert_eq!(exit.kind, ProcessEventKind::Exit);
    assert_eq!(exit.return_code(), None);
    assert!(events.try_next().is_none());
    assert_eq!(supervisor.lifecycle(), Lifecycle::Exited);

    // Stopping an exited process is a no-op.
    supervisor.stop();
}

#[tokio::test]
async fn missing_program_fails_to_spawn() {
    let (supervisor, _events) = supervisor(None);
    let result = supervisor
        .run("/nonexistent/airband-channelizer", &[])
        .await;
    assert!(result.is_err());
}
