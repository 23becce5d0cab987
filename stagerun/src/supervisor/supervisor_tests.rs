use super::*;
use crate::events::CollectingEventSink;
use crate::jobmanager::JobMode;
use crate::node::{Modifiers, NodeSpec};
use crate::testing::{linear_graph, Outcome, ScriptedJobManager};
use crate::vdr::VdrPolicy;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    supervisor: Supervisor,
    jm: Arc<ScriptedJobManager>,
    events: Arc<CollectingEventSink>,
}

fn config() -> RuntimeConfig {
    RuntimeConfig::new()
        .with_poll_interval(Duration::from_millis(10))
        .with_retry_wait(Duration::ZERO)
        .with_max_retries(3)
}

fn harness_in(dir: TempDir, graph: &CallGraph, jm: ScriptedJobManager, config: RuntimeConfig) -> Harness {
    let jm = Arc::new(jm);
    let events = Arc::new(CollectingEventSink::new());
    let manager: Arc<dyn JobManager> = jm.clone();
    let sink: Arc<dyn EventSink> = events.clone();
    let supervisor = Supervisor::new(
        graph,
        dir.path(),
        manager,
        config,
        Arc::new(SignalRegistry::default()),
    )
    .unwrap()
    .with_event_sink(sink);
    Harness {
        _dir: dir,
        supervisor,
        jm,
        events,
    }
}

fn harness(graph: &CallGraph, jm: ScriptedJobManager, config: RuntimeConfig) -> Harness {
    harness_in(TempDir::new().unwrap(), graph, jm, config)
}

async fn run(h: &mut Harness) -> RunOutcome {
    tokio::time::timeout(Duration::from_secs(20), h.supervisor.run())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_run_completes_and_records_final_state() {
    let mut h = harness(&linear_graph("p", 3), ScriptedJobManager::new(), config());
    let outcome = run(&mut h).await;

    assert_eq!(outcome.state, JobState::Complete);
    assert_eq!(outcome.retries_used, 0);
    assert_eq!(outcome.exit_reason(), ExitReason::Completed);
    assert_eq!(h.jm.count("p.S2", JobMode::Main), 1);

    let root = h.supervisor.tree().node("p").unwrap().metadata();
    assert!(root.exists(MetadataFile::FinalState));
    assert!(root.exists(MetadataFile::Invocation));
    assert_eq!(root.read_raw(MetadataFile::JobMode).unwrap(), "local");

    let snapshot = h.supervisor.snapshots().latest().unwrap();
    assert_eq!(snapshot.state, ReportedState::new(JobState::Complete));
    assert_eq!(h.events.events_of_type("run.finished").len(), 1);
    assert!(!h.events.events_of_type("node.state_changed").is_empty());
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let jm = ScriptedJobManager::new().with("p.S0", JobMode::Main, Outcome::Fail("signal: killed".into()));
    let mut h = harness(&linear_graph("p", 2), jm, config());
    let outcome = run(&mut h).await;

    assert_eq!(outcome.state, JobState::Complete);
    assert_eq!(outcome.retries_used, 1);
    assert_eq!(h.jm.count("p.S0", JobMode::Main), 2);
    let retrying = h.events.events_of_type("node.retrying");
    assert_eq!(
        retrying,
        vec![RunEvent::Retrying {
            fqname: "p.S0".into(),
            remaining: 2,
            excerpt: "signal: killed".into(),
        }]
    );
}

#[tokio::test]
async fn test_retry_budget_exhaustion() {
    let jm = ScriptedJobManager::new();
    for _ in 0..3 {
        jm.script("p.S0", JobMode::Main, Outcome::Fail("signal: killed".into()));
    }
    let mut h = harness(&linear_graph("p", 2), jm, config().with_max_retries(2));
    let outcome = run(&mut h).await;

    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.retries_used, 2);
    assert_eq!(outcome.exit_reason(), ExitReason::Fault);
    assert_eq!(h.jm.count("p.S0", JobMode::Main), 3);
    assert_eq!(h.jm.count("p.S1", JobMode::Main), 0);
    assert_eq!(h.events.events_of_type("node.retrying").len(), 2);
    assert_eq!(h.events.events_of_type("node.failed").len(), 1);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].fqname, "p.S0");
}

#[tokio::test]
async fn test_assertion_is_never_retried() {
    let jm = ScriptedJobManager::new().with("p.S0", JobMode::Main, Outcome::Assert("bad input".into()));
    let mut h = harness(&linear_graph("p", 1), jm, config());
    let outcome = run(&mut h).await;

    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.retries_used, 0);
    assert_eq!(h.jm.count("p.S0", JobMode::Main), 1);
    let failed = h.events.events_of_type("node.failed");
    let RunEvent::Failed {
        excerpt,
        error_path,
        ..
    } = &failed[0]
    else {
        panic!("expected a failure event");
    };
    assert_eq!(excerpt, "bad input");
    assert!(error_path.ends_with("_assert"));
}

#[tokio::test]
async fn test_burst_of_failures_uses_one_token() {
    let cmd = || vec!["/bin/true".to_string()];
    let graph = CallGraph::new("p")
        .with_node(NodeSpec::stage("p.A", cmd()))
        .with_node(NodeSpec::stage("p.B", cmd()))
        .with_node(NodeSpec::pipeline("p", vec!["p.A".into(), "p.B".into()]));
    let jm = ScriptedJobManager::new()
        .with("p.A", JobMode::Main, Outcome::Fail("signal: killed".into()))
        .with("p.B", JobMode::Main, Outcome::Fail("Job was not found in the queue".into()));
    let mut h = harness(&graph, jm, config().with_max_retries(1));
    let outcome = run(&mut h).await;

    assert_eq!(outcome.state, JobState::Complete);
    assert_eq!(outcome.retries_used, 1);
    assert_eq!(h.jm.count("p.A", JobMode::Main), 2);
    assert_eq!(h.jm.count("p.B", JobMode::Main), 2);
}

#[tokio::test]
async fn test_lost_heartbeat_is_detected() {
    let jm = ScriptedJobManager::new().with("p.S0", JobMode::Main, Outcome::Hang);
    let config = config()
        .with_max_retries(0)
        .with_heartbeat_timeout(Duration::ZERO);
    let mut h = harness(&linear_graph("p", 1), jm, config);
    let outcome = run(&mut h).await;

    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.failures.len(), 1);
    assert!(outcome.failures[0].message.starts_with("No heartbeat detected"));
}

#[tokio::test]
async fn test_permanent_failure_lets_independent_work_finish() {
    let cmd = || vec!["/bin/true".to_string()];
    let graph = CallGraph::new("p")
        .with_node(NodeSpec::stage("p.A", cmd()).with_output("out", false))
        .with_node(NodeSpec::stage("p.B", cmd()).with_binding("p.A", "out"))
        .with_node(NodeSpec::stage("p.C", cmd()))
        .with_node(NodeSpec::pipeline("p", vec!["p.A".into(), "p.B".into(), "p.C".into()]));
    let jm = ScriptedJobManager::new().with("p.A", JobMode::Main, Outcome::Fail("disk full".into()));
    let mut h = harness(&graph, jm, config());
    let outcome = run(&mut h).await;

    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.retries_used, 0);
    assert_eq!(h.supervisor.tree().node("p.C").unwrap().state(), JobState::Complete);
    assert_eq!(h.supervisor.tree().node("p.B").unwrap().state(), JobState::Waiting);
    assert_eq!(h.jm.count("p.B", JobMode::Main), 0);
}

#[tokio::test]
async fn test_rolling_vdr_reclaims_consumed_output() {
    let dir = TempDir::new().unwrap();
    let files = dir.path().join("p/A/chnk0/files");
    std::fs::create_dir_all(&files).unwrap();
    let path = files.join("out.txt");
    std::fs::write(&path, b"0123456789").unwrap();

    let cmd = || vec!["/bin/true".to_string()];
    let volatile = Modifiers {
        volatile: true,
        ..Modifiers::default()
    };
    let graph = CallGraph::new("p")
        .with_node(
            NodeSpec::stage("p.A", cmd())
                .with_modifiers(volatile)
                .with_output("out.txt", false),
        )
        .with_node(NodeSpec::stage("p.B", cmd()).with_binding("p.A", "out.txt"))
        .with_node(NodeSpec::stage("p.C", cmd()).with_binding("p.A", "out.txt"))
        .with_node(NodeSpec::pipeline("p", vec!["p.A".into(), "p.B".into(), "p.C".into()]));
    let jm = ScriptedJobManager::new().with(
        "p.A",
        JobMode::Main,
        Outcome::Complete(json!({ "out.txt": path.clone() })),
    );
    let mut h = harness_in(dir, &graph, jm, config().with_vdr(VdrPolicy::Rolling));
    let outcome = run(&mut h).await;

    assert_eq!(outcome.state, JobState::Complete);
    assert!(!path.exists());
    assert_eq!(outcome.vdr.count, 1);
    assert_eq!(outcome.vdr.size, 10);
    assert_eq!(h.events.events_of_type("vdr.removed").len(), 1);
}

#[tokio::test]
async fn test_cycle_publishes_snapshots() {
    let jm = ScriptedJobManager::new().with("p.S0", JobMode::Main, Outcome::Hang);
    let mut h = harness(&linear_graph("p", 2), jm, config());
    assert!(h.supervisor.snapshots().latest().is_none());

    for _ in 0..3 {
        assert!(h.supervisor.cycle().await.is_none());
    }
    let snapshot = h.supervisor.snapshots().latest().unwrap();
    assert_eq!(snapshot.name, "p");
    assert_eq!(snapshot.retries_remaining, 3);
    assert_eq!(snapshot.node("p.S0").unwrap().state, JobState::Running);
    assert_eq!(snapshot.node("p.S1").unwrap().state, JobState::Waiting);
}

#[tokio::test]
async fn test_snapshot_rereads_node_files_on_journal_change() {
    let jm = ScriptedJobManager::new().with("p.S0", JobMode::Main, Outcome::Hang);
    let mut h = harness(&linear_graph("p", 1), jm, config());
    for _ in 0..3 {
        assert!(h.supervisor.cycle().await.is_none());
    }
    let chunk = h.supervisor.tree().node("p.S0").unwrap().metadata().child("chnk0");
    chunk.write_raw(MetadataFile::Progress, "aligned 10%\naligned 50%\n").unwrap();

    assert!(h.supervisor.cycle().await.is_none());
    let snapshot = h.supervisor.snapshots().latest().unwrap();
    assert_eq!(snapshot.node("p.S0").unwrap().progress, None);

    chunk.update_journal(MetadataFile::Progress);
    assert!(h.supervisor.cycle().await.is_none());
    let snapshot = h.supervisor.snapshots().latest().unwrap();
    assert_eq!(snapshot.node("p.S0").unwrap().progress.as_deref(), Some("aligned 50%"));
}

#[tokio::test]
async fn test_shutdown_stops_the_loop() {
    let jm = ScriptedJobManager::new().with("p.S0", JobMode::Main, Outcome::Hang);
    let signals = Arc::new(SignalRegistry::default());
    let dir = TempDir::new().unwrap();
    let mut supervisor = Supervisor::new(
        &linear_graph("p", 1),
        dir.path(),
        Arc::new(jm),
        config(),
        Arc::clone(&signals),
    )
    .unwrap();
    signals.shutdown(ExitReason::Interrupted(libc::SIGTERM)).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .unwrap();
    assert!(outcome.interrupted);
    assert_eq!(outcome.exit_reason(), ExitReason::Fault);
}

#[test]
fn test_local_job_manager_from_config() {
    let signals = Arc::new(SignalRegistry::default());
    let config = RuntimeConfig {
        local: crate::jobmanager::LocalConfig::new().with_max_cores(2).with_max_mem_gb(4),
        ..RuntimeConfig::new()
    };
    let jm = job_manager(&config, &signals);
    assert!(jm.is_local());
    assert_eq!(jm.max_cores(), 2);
    assert_eq!(jm.max_mem_gb(), 4);
}
