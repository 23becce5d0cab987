use super::*;
use crate::core::{JobState, ResourceRequest};
use crate::jobinfo::JobInfo;
use crate::jobmanager::JobMode;
use crate::metadata::MetadataFile;
use crate::testing::{linear_graph, Outcome, RunFixture, ScriptedJobManager};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn cmd() -> Vec<String> {
    vec!["/bin/true".to_string()]
}

fn chunk_defs(count: usize) -> StageDefs {
    StageDefs {
        chunks: (0..count)
            .map(|i| ChunkDef {
                resources: ResourceRequest::default(),
                args: [("i".to_string(), json!(i))].into_iter().collect(),
            })
            .collect(),
        join: None,
    }
}

fn split_graph(join: bool) -> CallGraph {
    CallGraph::new("p")
        .with_node(NodeSpec::stage("p.S", cmd()).with_split(join).with_arg("n", json!(7)))
        .with_node(NodeSpec::pipeline("p", vec!["p.S".into()]))
}

fn read_json(tree: &NodeTree, fqname: &str, sub: Option<&str>, file: MetadataFile) -> Value {
    let node = tree.node(fqname).unwrap();
    let meta = match sub {
        Some(name) => node.metadata().child(name),
        None => node.metadata().clone(),
    };
    meta.read_into(file).unwrap()
}

#[test]
fn test_linear_pipeline_completes_and_binds_outputs() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new().with(
        "p.S0",
        JobMode::Main,
        Outcome::Complete(json!({"out": "/data/reads.fq"})),
    );
    let mut run = RunFixture::new(&linear_graph("p", 3), dir.path()).unwrap();

    assert_eq!(run.tree.node("p.S0").unwrap().state(), JobState::Ready);
    assert_eq!(run.tree.node("p.S1").unwrap().state(), JobState::Waiting);

    assert_eq!(run.run_until_settled(&jm, 30), JobState::Complete);
    assert_eq!(
        read_json(&run.tree, "p.S1", Some("chnk0"), MetadataFile::Args),
        json!({"out": "/data/reads.fq"})
    );
    assert_eq!(jm.count("p.S2", JobMode::Main), 1);
    assert_eq!(jm.count("p.S0", JobMode::Split), 0);
    assert!(run.tree.node("p").unwrap().metadata().exists(MetadataFile::Complete));
}

#[test]
fn test_split_chunks_join() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new()
        .with("p.S", JobMode::Split, Outcome::Split(chunk_defs(3)))
        .with("p.S", JobMode::Main, Outcome::Complete(json!({"part": 0})))
        .with("p.S", JobMode::Main, Outcome::Complete(json!({"part": 1})))
        .with("p.S", JobMode::Main, Outcome::Complete(json!({"part": 2})))
        .with("p.S", JobMode::Join, Outcome::Complete(json!({"merged": true})));
    let mut run = RunFixture::new(&split_graph(true), dir.path()).unwrap();

    assert_eq!(run.run_until_settled(&jm, 30), JobState::Complete);
    assert_eq!(jm.count("p.S", JobMode::Main), 3);
    assert_eq!(
        read_json(&run.tree, "p.S", Some("chnk2"), MetadataFile::Args),
        json!({"n": 7, "i": 2})
    );
    assert_eq!(
        read_json(&run.tree, "p.S", Some("join"), MetadataFile::ChunkOuts),
        json!([{"part": 0}, {"part": 1}, {"part": 2}])
    );
    assert_eq!(run.tree.node("p.S").unwrap().outs(), Some(&json!({"merged": true}).as_object().unwrap().clone()));
}

#[test]
fn test_split_without_join_merges_chunk_outputs() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new()
        .with("p.S", JobMode::Split, Outcome::Split(chunk_defs(2)))
        .with("p.S", JobMode::Main, Outcome::Complete(json!({"bam": "a.bam"})))
        .with("p.S", JobMode::Main, Outcome::Complete(json!({"bam": "b.bam"})));
    let mut run = RunFixture::new(&split_graph(false), dir.path()).unwrap();

    assert_eq!(run.run_until_settled(&jm, 30), JobState::Complete);
    assert_eq!(jm.count("p.S", JobMode::Join), 0);
    assert_eq!(
        read_json(&run.tree, "p.S", None, MetadataFile::Outs),
        json!({"bam": ["a.bam", "b.bam"]})
    );
}

#[test]
fn test_split_with_no_chunks_completes() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new().with("p.S", JobMode::Split, Outcome::Split(chunk_defs(0)));
    let mut run = RunFixture::new(&split_graph(false), dir.path()).unwrap();
    assert_eq!(run.run_until_settled(&jm, 20), JobState::Complete);
    assert_eq!(jm.count("p.S", JobMode::Main), 0);
}

#[test]
fn test_chunk_failure_fails_node_and_partial_reset_keeps_split() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new()
        .with("p.S", JobMode::Split, Outcome::Split(chunk_defs(2)))
        .with("p.S", JobMode::Main, Outcome::Fail("signal: killed".into()));
    let mut run = RunFixture::new(&split_graph(false), dir.path()).unwrap();

    assert_eq!(run.run_until_settled(&jm, 20), JobState::Failed);
    let failures = run.tree.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].fqname, "p.S");
    assert_eq!(failures[0].message, "signal: killed");
    assert!(!failures[0].assert);
    assert!(failures[0].error_path.ends_with("p/S/chnk0/_errors"));

    let cleared = run.tree.reset_failed(false);
    assert!(cleared.contains(&"p.S.chnk0".to_string()));
    assert!(!cleared.contains(&"p.S.split".to_string()));
    run.forget(&cleared);

    assert_eq!(run.run_until_settled(&jm, 20), JobState::Complete);
    assert_eq!(jm.count("p.S", JobMode::Split), 1);
    assert_eq!(jm.count("p.S", JobMode::Main), 4);
}

#[test]
fn test_corrupt_chunk_outputs_fail_node() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new()
        .with("p.S", JobMode::Split, Outcome::Split(chunk_defs(2)))
        .with("p.S", JobMode::Main, Outcome::CompleteRaw("{\"part\": ".into()))
        .with("p.S", JobMode::Main, Outcome::Complete(json!({"part": 1})));
    let mut run = RunFixture::new(&split_graph(false), dir.path()).unwrap();

    assert_eq!(run.run_until_settled(&jm, 20), JobState::Failed);
    let failures = run.tree.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].message.starts_with("Chunk outputs could not be read"));
    assert!(failures[0].error_path.ends_with("p/S/chnk0/_errors"));
    let join = run.tree.node("p.S").unwrap().metadata().child("join");
    assert!(!join.exists(MetadataFile::ChunkOuts));
}

#[test]
fn test_missing_chunk_outputs_are_null() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new()
        .with("p.S", JobMode::Split, Outcome::Split(chunk_defs(2)))
        .with("p.S", JobMode::Main, Outcome::Complete(json!({"part": 0})));
    let mut run = RunFixture::new(&split_graph(true), dir.path()).unwrap();
    let chunk1 = run.tree.node("p.S").unwrap().metadata().child("chnk1");

    // The second chunk completes without an _outs file.
    jm.script("p.S", JobMode::Main, Outcome::Hang);
    run.run_until_settled(&jm, 10);
    chunk1.write_time(MetadataFile::Complete).unwrap();
    chunk1.update_journal(MetadataFile::Complete);

    assert_eq!(run.run_until_settled(&jm, 20), JobState::Complete);
    assert_eq!(
        read_json(&run.tree, "p.S", Some("join"), MetadataFile::ChunkOuts),
        json!([{"part": 0}, null])
    );
}

#[test]
fn test_full_reset_reruns_split() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new()
        .with("p.S", JobMode::Split, Outcome::Split(chunk_defs(1)))
        .with("p.S", JobMode::Main, Outcome::Fail("preempted".into()));
    let mut run = RunFixture::new(&split_graph(false), dir.path()).unwrap();

    assert_eq!(run.run_until_settled(&jm, 20), JobState::Failed);
    let cleared = run.tree.reset_failed(true);
    assert!(cleared.contains(&"p.S".to_string()));
    run.forget(&cleared);
    assert!(!run.tree.node("p.S").unwrap().metadata().path().exists());

    assert_eq!(run.run_until_settled(&jm, 20), JobState::Complete);
    assert_eq!(jm.count("p.S", JobMode::Split), 2);
}

#[test]
fn test_assert_is_reported() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new().with(
        "p.S0",
        JobMode::Main,
        Outcome::Assert("input file is empty".into()),
    );
    let mut run = RunFixture::new(&linear_graph("p", 2), dir.path()).unwrap();
    assert_eq!(run.run_until_settled(&jm, 20), JobState::Failed);

    let report = run.tree.node("p.S0").unwrap().failure_report().unwrap();
    assert!(report.assert);
    assert_eq!(report.message, "input file is empty");
    assert_eq!(run.tree.node("p.S1").unwrap().state(), JobState::Waiting);
    assert_eq!(jm.count("p.S1", JobMode::Main), 0);
}

#[test]
fn test_lost_heartbeat_fails_running_job() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new().with("p.S0", JobMode::Main, Outcome::Hang);
    let mut run = RunFixture::new(&linear_graph("p", 1), dir.path()).unwrap();
    for _ in 0..3 {
        run.cycle(&jm);
    }
    assert_eq!(run.tree.node("p.S0").unwrap().state(), JobState::Running);

    let timeout = Duration::from_secs(60 * 60);
    let soon = SystemTime::now() + Duration::from_secs(60);
    assert_eq!(run.tree.check_heartbeats(soon, timeout), 0);

    let later = SystemTime::now() + Duration::from_secs(61 * 60);
    assert_eq!(run.tree.check_heartbeats(later, timeout), 1);
    run.tree.update_states();
    assert_eq!(run.tree.node("p.S0").unwrap().state(), JobState::Failed);

    let report = &run.tree.failures()[0];
    assert!(report.message.starts_with("No heartbeat detected for 6"));
    assert!(crate::retry::RetryClassifier::with_defaults()
        .is_error_transient(report)
        .transient);
}

#[test]
fn test_queue_check_respects_grace() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new().with("p.S0", JobMode::Main, Outcome::Queue);
    let mut run = RunFixture::new(&linear_graph("p", 1), dir.path()).unwrap();
    for _ in 0..3 {
        run.cycle(&jm);
    }
    assert_eq!(run.tree.node("p.S0").unwrap().state(), JobState::Queued);

    let missing = vec!["p.S0.chnk0".to_string()];
    let grace = Duration::from_secs(600);
    let now = SystemTime::now();
    assert_eq!(run.tree.apply_queue_check(&missing, now, grace), 0);
    assert_eq!(run.tree.apply_queue_check(&[], now + grace, grace), 0);
    assert_eq!(run.tree.apply_queue_check(&missing, now + grace, grace), 0);
    assert_eq!(
        run.tree
            .apply_queue_check(&missing, now + grace + grace, grace),
        1
    );
    run.tree.update_states();
    let report = &run.tree.failures()[0];
    assert!(report.message.starts_with("Job was not found in the queue."));
}

#[test]
fn test_disabled_node_satisfies_consumers() {
    let dir = TempDir::new().unwrap();
    let graph = CallGraph::new("p")
        .with_node(NodeSpec::stage("p.A", cmd()).with_modifiers(Modifiers {
            disabled: true,
            ..Modifiers::default()
        }))
        .with_node(NodeSpec::stage("p.B", cmd()).with_binding("p.A", "out"))
        .with_node(NodeSpec::pipeline("p", vec!["p.A".into(), "p.B".into()]));
    let jm = ScriptedJobManager::new();
    let mut run = RunFixture::new(&graph, dir.path()).unwrap();

    assert_eq!(run.run_until_settled(&jm, 20), JobState::Complete);
    assert_eq!(run.tree.node("p.A").unwrap().state(), JobState::Disabled);
    assert_eq!(jm.count("p.A", JobMode::Main), 0);
    assert_eq!(
        read_json(&run.tree, "p.B", Some("chnk0"), MetadataFile::Args),
        json!({"out": null})
    );
}

#[test]
fn test_preflight_runs_first() {
    let dir = TempDir::new().unwrap();
    let graph = CallGraph::new("p")
        .with_node(NodeSpec::stage("p.CHECK", cmd()).with_modifiers(Modifiers {
            preflight: true,
            ..Modifiers::default()
        }))
        .with_node(NodeSpec::stage("p.WORK", cmd()))
        .with_node(NodeSpec::pipeline("p", vec!["p.CHECK".into(), "p.WORK".into()]));
    let jm = ScriptedJobManager::new().with("p.CHECK", JobMode::Main, Outcome::Hang);
    let mut run = RunFixture::new(&graph, dir.path()).unwrap();
    for _ in 0..4 {
        run.cycle(&jm);
    }
    assert_eq!(run.tree.node("p.CHECK").unwrap().state(), JobState::Running);
    assert_eq!(run.tree.node("p.WORK").unwrap().state(), JobState::Waiting);
    assert_eq!(jm.count("p.WORK", JobMode::Main), 0);
}

#[test]
fn test_oversized_request_fails_node() {
    let dir = TempDir::new().unwrap();
    let graph = CallGraph::new("p")
        .with_node(NodeSpec::stage("p.BIG", cmd()).with_resources(ResourceRequest::new(32, 1)))
        .with_node(NodeSpec::pipeline("p", vec!["p.BIG".into()]));
    let jm = ScriptedJobManager::new();
    let mut run = RunFixture::new(&graph, dir.path()).unwrap();

    assert_eq!(run.run_until_settled(&jm, 10), JobState::Failed);
    assert!(jm.submitted().is_empty());
    let report = &run.tree.failures()[0];
    assert_eq!(
        report.message,
        "Job requested 32 threads, but the job manager allows at most 16"
    );
}

#[test]
fn test_blocked_submission_waits() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new();
    jm.set_capacity(Some(0));
    let mut run = RunFixture::new(&linear_graph("p", 1), dir.path()).unwrap();
    for _ in 0..3 {
        run.cycle(&jm);
    }
    assert_eq!(run.tree.node("p.S0").unwrap().state(), JobState::Ready);

    jm.set_capacity(None);
    assert_eq!(run.run_until_settled(&jm, 20), JobState::Complete);
}

#[test]
fn test_restart_rederives_state_from_disk() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new().with("p.S1", JobMode::Main, Outcome::Hang);
    let graph = linear_graph("p", 2);
    let mut run = RunFixture::new(&graph, dir.path()).unwrap();
    for _ in 0..8 {
        run.cycle(&jm);
    }
    assert_eq!(run.tree.node("p.S1").unwrap().state(), JobState::Running);

    let reloaded = RunFixture::new(&graph, dir.path()).unwrap();
    assert_eq!(reloaded.tree.node("p.S0").unwrap().state(), JobState::Complete);
    assert_eq!(reloaded.tree.node("p.S1").unwrap().state(), JobState::Running);
    assert_eq!(reloaded.tree.state(), JobState::Running);
}

#[test]
fn test_restart_local_jobs_fails_dead_process() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new().with("p.S0", JobMode::Main, Outcome::Hang);
    let mut run = RunFixture::new(&linear_graph("p", 1), dir.path()).unwrap();
    for _ in 0..3 {
        run.cycle(&jm);
    }

    let mut child = std::process::Command::new("/bin/true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();

    let chunk = run.tree.node("p.S0").unwrap().chunks()[0].clone();
    let mut info: JobInfo = chunk.read_into(MetadataFile::JobInfo).unwrap();
    info.pid = pid;
    info.host = "node-a".into();
    chunk.write(MetadataFile::JobInfo, &info).unwrap();

    assert!(run.tree.restart_local_jobs("node-b").is_empty());
    run.tree.update_states();
    assert_eq!(run.tree.node("p.S0").unwrap().state(), JobState::Running);

    run.tree.restart_local_jobs("node-a");
    run.tree.update_states();
    assert_eq!(run.tree.node("p.S0").unwrap().state(), JobState::Failed);
    assert_eq!(
        run.tree.failures()[0].message,
        format!("Local job process {pid} is no longer running")
    );
}

#[test]
fn test_restart_local_jobs_requeues_waiting_job() {
    let dir = TempDir::new().unwrap();
    let jm = ScriptedJobManager::new().with("p.S0", JobMode::Main, Outcome::Queue);
    let mut run = RunFixture::new(&linear_graph("p", 1), dir.path()).unwrap();
    for _ in 0..3 {
        run.cycle(&jm);
    }
    let chunk = run.tree.node("p.S0").unwrap().chunks()[0].clone();
    chunk.write_time(MetadataFile::QueuedLocally).unwrap();
    let mut run = RunFixture::new(&linear_graph("p", 1), dir.path()).unwrap();

    let reset = run.tree.restart_local_jobs("anywhere");
    assert_eq!(reset, vec!["p.S0.chnk0".to_string()]);
    assert!(!chunk.exists(MetadataFile::JobInfo));
    assert!(chunk.exists(MetadataFile::Args));

    run.tree.update_states();
    assert_eq!(run.tree.node("p.S0").unwrap().state(), JobState::Ready);
    assert_eq!(run.run_until_settled(&jm, 20), JobState::Complete);
}

#[test]
fn test_unknown_journal_entries_are_ignored() {
    let dir = TempDir::new().unwrap();
    let mut run = RunFixture::new(&linear_graph("p", 1), dir.path()).unwrap();
    let entries = vec![crate::metadata::JournalEntry {
        name: "q.OTHER".into(),
        file: MetadataFile::Log,
        seq: 1,
        modified: None,
    }];
    assert_eq!(run.tree.apply_journal(&entries, SystemTime::now()), 0);
}

#[test]
fn test_refreshed_nodes_are_reported_once() {
    let dir = TempDir::new().unwrap();
    let mut run = RunFixture::new(&linear_graph("p", 2), dir.path()).unwrap();
    assert!(run.tree.take_refreshed().is_empty());

    let entries = vec![
        crate::metadata::JournalEntry {
            name: "p.S1.chnk0".into(),
            file: MetadataFile::Log,
            seq: 1,
            modified: None,
        },
        crate::metadata::JournalEntry {
            name: "p.S1".into(),
            file: MetadataFile::Heartbeat,
            seq: 2,
            modified: None,
        },
    ];
    assert_eq!(run.tree.apply_journal(&entries, SystemTime::now()), 1);
    assert_eq!(run.tree.take_refreshed(), vec!["p.S1".to_string()]);
    assert!(run.tree.take_refreshed().is_empty());
}
