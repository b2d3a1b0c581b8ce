//! End-to-end runs through real `gatehouse-runner exec` child processes.

use gatehouse_protocol::{
    EventKind, FaultStage, PipelineDescriptor, RunnerEvent, RunnerState, RunnerTask, SinkSpec,
    SourceSpec,
};
use gatehouse_runner::{RunnerError, RunnerOptions, Session, SessionConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn runner_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_gatehouse-runner"))
}

fn session_with(executable: PathBuf, log_dir: &Path, max_runners: usize) -> Session {
    Session::new(
        "test",
        SessionConfig {
            max_runners,
            runner: RunnerOptions {
                executable,
                log_dir: log_dir.to_path_buf(),
                cancel_grace: Duration::from_secs(2),
            },
        },
    )
}

fn session(tmp: &TempDir) -> Session {
    session_with(runner_binary(), &tmp.path().join("logs"), 4)
}

fn fake(rows: u64, delay_ms: Option<u64>, fail_after: Option<u64>) -> SourceSpec {
    SourceSpec::Fake {
        rows,
        delay_ms,
        fail_after,
    }
}

fn pipeline(source: SourceSpec, sinks: Vec<SinkSpec>) -> RunnerTask {
    RunnerTask::Pipeline(PipelineDescriptor::new(source, sinks))
}

async fn drain(session: &Session, id: &gatehouse_protocol::RunnerId) -> Vec<RunnerEvent> {
    let mut sub = session.subscribe(id).await.unwrap();
    let mut events = Vec::new();
    let collect = async {
        while let Some(event) = sub.recv().await {
            events.push(event);
        }
    };
    tokio::time::timeout(Duration::from_secs(60), collect)
        .await
        .expect("runner did not finish");
    events
}

fn assert_well_formed(events: &[RunnerEvent]) {
    assert!(matches!(events[0].kind, EventKind::Started { .. }));
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64, "gap in event sequence");
    }
    assert_eq!(events.iter().filter(|e| e.kind.is_terminal()).count(), 1);
    assert!(events.last().unwrap().kind.is_terminal());
}

#[tokio::test]
async fn fake_rows_land_in_a_json_lines_file() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("rows.jsonl");
    let session = session(&tmp);

    let id = session
        .create_runner(pipeline(
            fake(50, None, None),
            vec![SinkSpec::JsonLines {
                path: out.clone(),
                header: false,
            }],
        ))
        .await
        .unwrap();
    let events = drain(&session, &id).await;

    assert_well_formed(&events);
    let schema_at = events
        .iter()
        .position(|e| matches!(e.kind, EventKind::Schema { .. }))
        .unwrap();
    assert_eq!(schema_at, 1);
    match &events.last().unwrap().kind {
        EventKind::Finished(summary) => assert_eq!(summary.rows, 50),
        other => panic!("unexpected terminal event {:?}", other),
    }
    assert_eq!(session.state(&id).await.unwrap(), RunnerState::Completed);

    let text = std::fs::read_to_string(&out).unwrap();
    assert_eq!(text.lines().count(), 50);
    assert!(text.lines().next().unwrap().contains("\"id\":1"));
}

#[tokio::test]
async fn cancel_stops_a_long_run_and_publishes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("never.jsonl");
    let session = session(&tmp);

    let id = session
        .create_runner(pipeline(
            fake(1_000_000, Some(1), None),
            vec![SinkSpec::JsonLines {
                path: out.clone(),
                header: false,
            }],
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    // held across the end of the run so the handle stays tracked
    let mut held = session.subscribe(&id).await.unwrap();
    session.cancel_runner(&id).await.unwrap();
    session.cancel_runner(&id).await.unwrap();

    let events = drain(&session, &id).await;
    assert_well_formed(&events);
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::Cancelled { .. }
    ));
    assert_eq!(session.wait(&id).await.unwrap(), RunnerState::Cancelled);

    // cancelling a finished runner is a no-op
    session.cancel_runner(&id).await.unwrap();
    let mut seen = 0;
    while let Some(event) = held.recv().await {
        assert_eq!(event.seq, seen);
        seen += 1;
    }
    assert_eq!(seen as usize, events.len());
    assert!(!out.exists());
}

async fn wait_until_released(session: &Session) {
    let released = async {
        while session.tracked_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), released)
        .await
        .expect("finished runner was never released");
}

#[tokio::test]
async fn drained_runners_are_released_to_history() {
    let tmp = tempfile::tempdir().unwrap();
    let session = session(&tmp);

    let id = session
        .create_runner(pipeline(
            fake(5, None, None),
            vec![SinkSpec::Collector {
                name: "small".into(),
            }],
        ))
        .await
        .unwrap();
    assert_eq!(session.tracked_count().await, 1);
    let events = drain(&session, &id).await;
    assert_well_formed(&events);

    wait_until_released(&session).await;
    assert_eq!(session.state(&id).await.unwrap(), RunnerState::Completed);
    assert_eq!(session.wait(&id).await.unwrap(), RunnerState::Completed);
    assert!(matches!(
        session.subscribe(&id).await,
        Err(RunnerError::Released(_))
    ));
    session.cancel_runner(&id).await.unwrap();

    let history = session.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].runner_id, id);
    assert_eq!(history[0].rows, 5);
    assert!(history[0].finished_at.is_some());
}

#[cfg(unix)]
#[tokio::test]
async fn runner_ignoring_cancel_is_killed_after_the_grace_period() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().unwrap();
    // never reads its control channel
    let stubborn = tmp.path().join("stubborn.sh");
    std::fs::write(&stubborn, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&stubborn, std::fs::Permissions::from_mode(0o755)).unwrap();
    let session = Session::new(
        "test",
        SessionConfig {
            max_runners: 1,
            runner: RunnerOptions {
                executable: stubborn,
                log_dir: tmp.path().join("logs"),
                cancel_grace: Duration::from_millis(200),
            },
        },
    );

    let id = session
        .create_runner(pipeline(fake(1, None, None), vec![SinkSpec::Console {}]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled_at = std::time::Instant::now();
    session.cancel_runner(&id).await.unwrap();

    let events = drain(&session, &id).await;
    assert_well_formed(&events);
    let cancelled = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Cancelled { .. }))
        .count();
    assert_eq!(cancelled, 1);
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::Cancelled { .. }
    ));
    assert!(cancelled_at.elapsed() < Duration::from_secs(10));
    assert_eq!(session.wait(&id).await.unwrap(), RunnerState::Cancelled);
}

#[tokio::test]
async fn concurrent_runners_finish_independently() {
    let tmp = tempfile::tempdir().unwrap();
    let session = session(&tmp);

    let good = session
        .create_runner(pipeline(
            fake(200, None, None),
            vec![SinkSpec::Collector {
                name: "ok".into(),
            }],
        ))
        .await
        .unwrap();
    let bad = session
        .create_runner(pipeline(
            fake(200, None, Some(10)),
            vec![SinkSpec::Collector {
                name: "broken".into(),
            }],
        ))
        .await
        .unwrap();

    let (good_events, bad_events) = tokio::join!(drain(&session, &good), drain(&session, &bad));
    assert_well_formed(&good_events);
    assert_well_formed(&bad_events);

    assert!(matches!(
        good_events.last().unwrap().kind,
        EventKind::Finished(_)
    ));
    match &bad_events.last().unwrap().kind {
        EventKind::Failed(failure) => {
            assert_eq!(failure.stage, FaultStage::Source);
            assert!(failure.message.contains("failed after 10 rows"));
        }
        other => panic!("unexpected terminal event {:?}", other),
    }

    let history = session.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].state, RunnerState::Completed);
    assert_eq!(history[0].rows, 200);
    assert_eq!(history[1].state, RunnerState::Failed);
    assert!(history.iter().all(|r| r.finished_at.is_some()));
}

#[tokio::test]
async fn collected_rows_come_back_with_the_summary() {
    let tmp = tempfile::tempdir().unwrap();
    let session = session(&tmp);

    let id = session
        .create_runner(pipeline(
            fake(3, None, None),
            vec![SinkSpec::Collector {
                name: "preview".into(),
            }],
        ))
        .await
        .unwrap();
    let events = drain(&session, &id).await;

    let EventKind::Finished(summary) = &events.last().unwrap().kind else {
        panic!("run did not finish");
    };
    assert_eq!(summary.collected.len(), 1);
    let preview = &summary.collected[0];
    assert_eq!(preview.name, "preview");
    assert_eq!(preview.rows.len(), 3);
    assert!(!preview.truncated);
    assert_eq!(preview.schema.columns.len(), 2);
}

#[tokio::test]
async fn capacity_and_close_are_enforced() {
    let tmp = tempfile::tempdir().unwrap();
    let session = session_with(runner_binary(), &tmp.path().join("logs"), 1);
    let slow = || {
        pipeline(
            fake(1_000_000, Some(1), None),
            vec![SinkSpec::Collector {
                name: "slow".into(),
            }],
        )
    };

    let first = session.create_runner(slow()).await.unwrap();
    assert!(matches!(
        session.create_runner(slow()).await,
        Err(RunnerError::AtCapacity(1))
    ));

    tokio::time::timeout(Duration::from_secs(30), session.close())
        .await
        .expect("close did not finish");
    assert_eq!(session.state(&first).await.unwrap(), RunnerState::Cancelled);
    assert_eq!(session.active_count().await, 0);
    assert!(matches!(
        session.create_runner(slow()).await,
        Err(RunnerError::SessionClosed)
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn runner_dying_without_a_terminal_event_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let session = session_with(PathBuf::from("false"), &tmp.path().join("logs"), 1);

    let id = session
        .create_runner(pipeline(fake(1, None, None), vec![SinkSpec::Console {}]))
        .await
        .unwrap();
    let events = drain(&session, &id).await;

    assert_well_formed(&events);
    match &events.last().unwrap().kind {
        EventKind::Failed(failure) => {
            assert_eq!(failure.stage, FaultStage::Runner);
            assert!(failure.message.contains("exited abnormally"));
        }
        other => panic!("unexpected terminal event {:?}", other),
    }
}

#[tokio::test]
async fn invalid_task_is_rejected_before_spawning() {
    let tmp = tempfile::tempdir().unwrap();
    let session = session(&tmp);
    let task = pipeline(fake(1, None, None), Vec::new());
    assert!(matches!(
        session.create_runner(task).await,
        Err(RunnerError::InvalidTask(_))
    ));
    assert!(session.history().await.is_empty());
}
