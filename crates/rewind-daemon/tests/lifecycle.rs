use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rewind_common::ErrorKind;
use rewind_daemon::test_support::MockBrowser;
use rewind_daemon::test_support::MockLauncher;
use rewind_daemon::test_support::MockReplay;
use rewind_daemon::ActionHandler;
use rewind_daemon::Lifecycle;
use rewind_daemon::LifecycleError;
use rewind_daemon::LifecycleState;
use rewind_daemon::Marker;
use rewind_daemon::RecorderConfig;
use rewind_daemon::ReplayArtifact;
use rewind_daemon::RunInfo;
use rewind_daemon::RunRecord;
use rewind_daemon::SessionRouter;
use rewind_daemon::StartParams;
use rewind_daemon::StepOutcome;
use rewind_daemon::StopOutcome;
use rewind_daemon::Viewport;
use rewind_ipc::command::ReplayArgs;
use rewind_ipc::command::ReplayOutput;
use rewind_ipc::command::ResizeArgs;
use rewind_ipc::command::ResolveArgs;
use rewind_ipc::command::SelectorArgs;
use rewind_ipc::process::mock::MockProcessController;
use rewind_ipc::Command;
use rewind_ipc::ProcessStatus;
use rewind_ipc::Signal;
use rewind_log::Locator;
use rewind_log::RecorderStats;
use rewind_log::TabId;
use serde_json::json;
use tempfile::TempDir;

const TEARDOWN_ORDER: [&str; 8] = [
    "stop_accepting",
    "drain_requests",
    "close_browser",
    "terminate_children",
    "close_ingest",
    "persist_run",
    "remove_endpoint",
    "clear_marker",
];

fn config(dir: &Path) -> RecorderConfig {
    RecorderConfig::from_env()
        .with_state_dir(dir.join("state"))
        .with_socket_path(dir.join("rewind.sock"))
        .with_sync_policy(rewind_log::SyncPolicy::Flush)
        .with_kill_grace(Duration::from_millis(50))
        .with_release_attempts(2)
        .with_restart_settle(Duration::ZERO)
        .with_persist_interval(Duration::from_millis(50))
}

fn lifecycle(dir: &Path, launcher: Arc<MockLauncher>, processes: Arc<MockProcessController>) -> Arc<Lifecycle> {
    Arc::new(Lifecycle::new(config(dir), launcher, processes))
}

fn params(url: Option<&str>) -> StartParams {
    StartParams {
        url: url.map(str::to_string),
        viewport: Viewport::default(),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_start_stop_writes_and_clears_state() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let lc = lifecycle(dir.path(), launcher.clone(), Arc::new(MockProcessController::new()));

    let session = lc.start(params(Some("https://example.test/"))).await.unwrap();
    assert_eq!(lc.state(), LifecycleState::Active);

    let marker = lc.store().load_marker().unwrap();
    assert_eq!(marker.run_id, session.run_id());
    assert_eq!(marker.recorder_pid, std::process::id());
    assert!(RunRecord::load(session.dir()).unwrap().run.active);

    let browser = launcher.last_browser().unwrap();
    assert_eq!(browser.calls(), vec!["navigate https://example.test/"]);
    let recorder = Arc::clone(session.recorder());
    wait_until(|| recorder.stats().frames == 1).await;

    let report = match lc.stop().await {
        StopOutcome::Stopped(report) => report,
        other => panic!("expected a teardown, got {:?}", other),
    };
    let names: Vec<&str> = report.steps.iter().map(|s| s.name).collect();
    assert_eq!(names, TEARDOWN_ORDER);
    assert!(report.is_clean());
    assert!(matches!(report.outcome("stop_accepting"), Some(StepOutcome::Skipped(_))));
    assert!(matches!(report.outcome("terminate_children"), Some(StepOutcome::Skipped(_))));
    assert_eq!(report.outcome("close_browser"), Some(&StepOutcome::Done));

    assert_eq!(lc.state(), LifecycleState::Inactive);
    assert!(browser.is_closed());
    assert!(lc.store().load_marker().is_none());
    let record = RunRecord::load(session.dir()).unwrap();
    assert!(!record.run.active);
    assert_eq!(record.stats.records, 1);
    assert_eq!(record.tabs.len(), 1);
    assert_eq!(record.tabs[0].url.as_deref(), Some("https://example.test/"));

    assert!(matches!(lc.stop().await, StopOutcome::NoOp(LifecycleState::Inactive)));
}

#[tokio::test]
async fn test_second_start_is_already_in_progress() {
    let dir = TempDir::new().unwrap();
    let lc = lifecycle(
        dir.path(),
        Arc::new(MockLauncher::new()),
        Arc::new(MockProcessController::new()),
    );
    lc.start(params(None)).await.unwrap();

    let err = lc.start(params(None)).await.err().unwrap();
    assert!(matches!(
        err,
        LifecycleError::AlreadyInProgress {
            state: LifecycleState::Active
        }
    ));
    assert_eq!(err.kind(), ErrorKind::AlreadyInProgress);
    lc.stop().await;
}

#[tokio::test]
async fn test_concurrent_stops_tear_down_once() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::with_browser(|| {
        MockBrowser::new().with_delay(Duration::from_millis(100))
    }));
    let lc = lifecycle(dir.path(), launcher.clone(), Arc::new(MockProcessController::new()));
    lc.start(params(None)).await.unwrap();

    let (a, b) = tokio::join!(lc.stop(), lc.stop());
    let stopped = [&a, &b]
        .iter()
        .filter(|o| matches!(o, StopOutcome::Stopped(_)))
        .count();
    assert_eq!(stopped, 1);
    assert!([&a, &b]
        .iter()
        .any(|o| matches!(o, StopOutcome::NoOp(LifecycleState::Stopping))));
    assert_eq!(launcher.last_browser().unwrap().call_count("close"), 1);
}

#[tokio::test]
async fn test_start_recovers_stale_session() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    let stale_socket = dir.path().join("old.sock");
    std::fs::write(&stale_socket, "").unwrap();

    let stale_dir = cfg.run_dir("20240101-000000-deadbeef");
    let mut stale_run = RunInfo::new(None, Viewport::default());
    stale_run.run_id = "20240101-000000-deadbeef".to_string();
    stale_run.active = true;
    RunRecord {
        run: stale_run,
        tabs: Vec::new(),
        stats: RecorderStats::default(),
        ingest: Default::default(),
        updated_at: Utc::now(),
    }
    .save(&stale_dir)
    .unwrap();

    let processes = Arc::new(
        MockProcessController::new()
            .with_process(4242, ProcessStatus::Running)
            .with_process(4243, ProcessStatus::Running)
            .ignoring_term(4243),
    );
    let lc = Arc::new(Lifecycle::new(cfg, Arc::new(MockLauncher::new()), processes.clone()));
    lc.store()
        .save_marker(&Marker {
            run_id: "20240101-000000-deadbeef".to_string(),
            run_dir: stale_dir.clone(),
            recorder_pid: 4242,
            child_pids: vec![4243, std::process::id()],
            socket_path: stale_socket.clone(),
        })
        .unwrap();

    let session = lc.start(params(None)).await.unwrap();

    assert_eq!(
        processes.signals_sent(),
        vec![(4242, Signal::Term), (4243, Signal::Term), (4243, Signal::Kill)]
    );
    assert!(!stale_socket.exists());
    assert!(!RunRecord::load(&stale_dir).unwrap().run.active);
    assert_eq!(lc.store().load_marker().unwrap().run_id, session.run_id());
    assert_ne!(session.run_id(), "20240101-000000-deadbeef");
    lc.stop().await;
}

#[tokio::test]
async fn test_teardown_retries_once_and_continues_past_failures() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::with_browser(|| {
        MockBrowser::new().failing_times("close", 1, "busy")
    }));
    let lc = lifecycle(dir.path(), launcher, Arc::new(MockProcessController::new()));
    lc.start(params(None)).await.unwrap();
    let StopOutcome::Stopped(report) = lc.stop().await else {
        panic!("expected a teardown");
    };
    assert!(matches!(report.outcome("close_browser"), Some(StepOutcome::Retried(m)) if m.contains("busy")));
    assert!(report.is_clean());

    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::with_browser(|| MockBrowser::new().failing("close", "wedged")));
    let lc = lifecycle(dir.path(), launcher.clone(), Arc::new(MockProcessController::new()));
    lc.start(params(None)).await.unwrap();
    let StopOutcome::Stopped(report) = lc.stop().await else {
        panic!("expected a teardown");
    };
    assert!(matches!(report.outcome("close_browser"), Some(StepOutcome::Failed(_))));
    assert_eq!(report.failures().count(), 1);
    assert_eq!(report.outcome("clear_marker"), Some(&StepOutcome::Done));
    assert_eq!(launcher.last_browser().unwrap().call_count("close"), 2);
    assert_eq!(lc.state(), LifecycleState::Inactive);
    assert!(lc.store().load_marker().is_none());
}

#[tokio::test]
async fn test_stop_terminates_tracked_children() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::with_browser(|| {
        MockBrowser::new().with_child_pids(vec![5151])
    }));
    let processes = Arc::new(MockProcessController::new().with_process(5151, ProcessStatus::Running));
    let lc = lifecycle(dir.path(), launcher, processes.clone());

    lc.start(params(None)).await.unwrap();
    assert_eq!(lc.store().load_marker().unwrap().child_pids, vec![5151]);

    let StopOutcome::Stopped(report) = lc.stop().await else {
        panic!("expected a teardown");
    };
    assert_eq!(report.outcome("terminate_children"), Some(&StepOutcome::Done));
    assert_eq!(processes.signals_sent(), vec![(5151, Signal::Term)]);
}

#[tokio::test]
async fn test_restart_starts_fresh_run_with_same_params() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let lc = lifecycle(dir.path(), launcher.clone(), Arc::new(MockProcessController::new()));

    let first = lc.start(params(Some("https://a.test/"))).await.unwrap();
    let (report, second) = lc.restart().await.unwrap();

    assert_ne!(first.run_id(), second.run_id());
    assert_eq!(second.params().url.as_deref(), Some("https://a.test/"));
    assert!(matches!(report.outcome("remove_endpoint"), Some(StepOutcome::Skipped(_))));
    assert_eq!(lc.state(), LifecycleState::Active);

    let launches = launcher.launches();
    assert_eq!(launches.len(), 2);
    assert!(launcher.browsers()[0].is_closed());
    assert!(!launcher.browsers()[1].is_closed());
    assert!(!RunRecord::load(first.dir()).unwrap().run.active);
    lc.stop().await;

    assert!(matches!(lc.restart().await, Err(LifecycleError::NotActive)));
}

#[tokio::test]
async fn test_failed_launch_returns_to_inactive() {
    let dir = TempDir::new().unwrap();
    let lc = lifecycle(
        dir.path(),
        Arc::new(MockLauncher::new().failing_launch("no display")),
        Arc::new(MockProcessController::new()),
    );
    let err = lc.start(params(None)).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::ActionFailed);
    assert_eq!(lc.state(), LifecycleState::Inactive);
    assert!(lc.store().load_marker().is_none());

    let launcher = Arc::new(MockLauncher::with_browser(|| {
        MockBrowser::new().failing("navigate", "dns")
    }));
    let lc = lifecycle(dir.path(), launcher.clone(), Arc::new(MockProcessController::new()));
    assert!(lc.start(params(Some("https://nowhere.test/"))).await.is_err());
    assert_eq!(lc.state(), LifecycleState::Inactive);
    assert!(launcher.last_browser().unwrap().is_closed());
    assert!(lc.store().load_marker().is_none());
}

#[tokio::test]
async fn test_router_resolves_and_replays_recording() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let lc = lifecycle(dir.path(), launcher.clone(), Arc::new(MockProcessController::new()));
    let replay = Arc::new(MockReplay::new());
    let router = SessionRouter::new(Arc::clone(&lc)).with_replay(replay.clone());

    let session = lc.start(params(None)).await.unwrap();
    let browser = launcher.last_browser().unwrap();
    for ts in [1000, 1000, 1500] {
        browser.emit(0, json!({"type": 3, "timestamp": ts})).await.unwrap();
    }
    browser
        .emit(1, json!({"type": 3, "timestamp": 1100}))
        .await
        .unwrap();
    let recorder = Arc::clone(session.recorder());
    wait_until(|| recorder.stats().frames == 4).await;

    let resolved = router
        .handle(Command::Resolve(ResolveArgs {
            locator: Locator::Timestamp(1200),
            tab: Some(TabId(0)),
        }))
        .await
        .unwrap();
    assert_eq!(resolved["locator"], "1000#1");

    let missing = router
        .handle(Command::Resolve(ResolveArgs {
            locator: Locator::Timestamp(900),
            tab: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(missing.kind, ErrorKind::NotFound);

    let replayed = router
        .handle(Command::Replay(ReplayArgs {
            locator: Locator::Timestamp(1500),
            tab: Some(TabId(0)),
            output: ReplayOutput::Html,
            path: None,
        }))
        .await
        .unwrap();
    assert_eq!(replayed["locator"], "1500#0");
    let artifact: ReplayArtifact = serde_json::from_value(replayed["artifact"].clone()).unwrap();
    assert_eq!(
        artifact,
        ReplayArtifact::Html {
            html: "<replay events=\"3\"></replay>".into()
        }
    );
    let jobs = replay.jobs();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].events.iter().all(|e| e.tab_id.as_u32() == 0));

    let status = router.handle(Command::Status).await.unwrap();
    assert_eq!(status["state"], "active");
    assert_eq!(status["stats"]["frames"], 4);
    assert_eq!(status["tabs"], 2);

    let tabs = router.handle(Command::Tabs).await.unwrap();
    assert_eq!(tabs["tabs"].as_array().unwrap().len(), 2);
    lc.stop().await;
}

#[tokio::test]
async fn test_router_replay_bounds() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let lc = lifecycle(dir.path(), launcher.clone(), Arc::new(MockProcessController::new()));
    lc.start(params(None)).await.unwrap();
    launcher
        .last_browser()
        .unwrap()
        .emit(0, json!({"type": 2, "timestamp": 1000}))
        .await
        .unwrap();
    let recorder = Arc::clone(lc.current().unwrap().recorder());
    wait_until(|| recorder.stats().frames == 1).await;

    let args = ReplayArgs {
        locator: Locator::Index(0),
        tab: None,
        output: ReplayOutput::Image,
        path: None,
    };

    let no_replay = SessionRouter::new(Arc::clone(&lc));
    let err = no_replay.handle(Command::Replay(args.clone())).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unhandled);

    let slow = SessionRouter::new(Arc::clone(&lc))
        .with_replay(Arc::new(MockReplay::new().with_delay(Duration::from_secs(5))))
        .with_replay_timeout(Duration::from_millis(50));
    let err = slow.handle(Command::Replay(args.clone())).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    let failing = SessionRouter::new(Arc::clone(&lc)).with_replay(Arc::new(MockReplay::new().failing("gpu")));
    let err = failing.handle(Command::Replay(args)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ActionFailed);
    lc.stop().await;
}

#[tokio::test]
async fn test_router_browser_actions() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::with_browser(|| {
        MockBrowser::new().timing_out("click").with_html("<p>page</p>")
    }));
    let lc = lifecycle(dir.path(), launcher.clone(), Arc::new(MockProcessController::new()));
    let router = SessionRouter::new(Arc::clone(&lc));

    let err = router.handle(Command::SnapshotHtml).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unhandled);

    let session = lc.start(params(None)).await.unwrap();
    let html = router.handle(Command::SnapshotHtml).await.unwrap();
    assert_eq!(html["html"], "<p>page</p>");

    let err = router
        .handle(Command::Click(SelectorArgs {
            selector: "#buy".into(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    router
        .handle(Command::Resize(ResizeArgs {
            width: 800,
            height: 600,
        }))
        .await
        .unwrap();
    assert_eq!(
        session.viewport(),
        Viewport {
            width: 800,
            height: 600
        }
    );
    assert_eq!(launcher.last_browser().unwrap().viewport(), session.viewport());
    lc.stop().await;
}
