//! End-to-end builder tests against real shell commands

mod common;

use common::RecordingManager;
use indexmap::IndexMap;
use navvy_core::builder::Builder;
use navvy_core::config::BuilderConfig;
use navvy_core::messages::{BuildEvent, BuildStatus};
use navvy_core::settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn make_workdir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("seed.txt"), "seed").unwrap();
    dir
}

fn make_builder(
    manager: Arc<RecordingManager>,
    workdir: &TempDir,
    yaml: &str,
    remove_env: bool,
) -> Builder {
    let conf = BuilderConfig::from_yaml(yaml).unwrap();
    Builder::new(
        manager,
        conf,
        workdir.path(),
        &Settings::default(),
        remove_env,
        IndexMap::new(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_single_echo_step_message_sequence() {
    let workdir = make_workdir();
    let manager = Arc::new(RecordingManager::new());
    let builder = make_builder(
        manager.clone(),
        &workdir,
        "name: b1\nsteps:\n  - \"echo hi\"\n",
        true,
    );

    let info = builder.build().await.unwrap();
    assert_eq!(info.status, BuildStatus::Success);
    assert_eq!(info.total_steps, 1);
    assert_eq!(info.steps.len(), 1);
    assert!(info.finished.is_some());

    let events = manager.events();
    assert_eq!(events.len(), 4);

    match &events[0] {
        BuildEvent::Build(b) => {
            assert_eq!(b.status, BuildStatus::Running);
            assert_eq!(b.total_steps, 1);
            assert!(b.steps.is_empty());
        }
        other => panic!("expected build_info, got {other:?}"),
    }
    match &events[1] {
        BuildEvent::Step(s) => {
            assert_eq!(s.status, BuildStatus::Running);
            assert_eq!(s.cmd, "echo hi");
            assert_eq!(s.index, 0);
            assert!(s.last_step_status.is_none());
        }
        other => panic!("expected step_info, got {other:?}"),
    }
    match &events[2] {
        BuildEvent::StepOutput(o) => {
            assert_eq!(o.output, "hi");
            assert_eq!(o.output_index, 0);
        }
        other => panic!("expected step_output_info, got {other:?}"),
    }
    match &events[3] {
        BuildEvent::Step(s) => {
            assert_eq!(s.status, BuildStatus::Success);
            assert_eq!(s.output, "hi");
            assert!(s.finished.is_some());
            assert!(s.total_time.is_some());
        }
        other => panic!("expected step_info, got {other:?}"),
    }

    // remove_env cleaned the derived workspace up
    assert!(!builder.scoped_workdir().exists());
}

#[tokio::test]
async fn test_steps_run_in_scoped_workdir_copy() {
    let workdir = make_workdir();
    let manager = Arc::new(RecordingManager::new());
    let builder = make_builder(
        manager.clone(),
        &workdir,
        "name: b1\nsteps:\n  - \"cat seed.txt\"\n",
        true,
    );

    let info = builder.build().await.unwrap();
    assert_eq!(info.status, BuildStatus::Success);
    assert_eq!(info.steps[0].output, "seed");
}

#[tokio::test]
async fn test_keep_env_leaves_scoped_workdir() {
    let workdir = make_workdir();
    let manager = Arc::new(RecordingManager::new());
    let builder = make_builder(
        manager.clone(),
        &workdir,
        "name: b1\nsteps:\n  - \"echo hi\"\n",
        false,
    );

    builder.build().await.unwrap();
    let scoped = builder.scoped_workdir();
    assert!(scoped.exists());
    assert!(scoped.join("seed.txt").exists());
    std::fs::remove_dir_all(scoped).unwrap();
}

#[tokio::test]
async fn test_stop_on_fail_skips_remaining_steps() {
    let workdir = make_workdir();
    let manager = Arc::new(RecordingManager::new());
    let builder = make_builder(
        manager.clone(),
        &workdir,
        r#"
name: b1
steps:
  - name: a
    command: "false"
    stop_on_fail: true
  - name: b
    command: echo skipped
"#,
        true,
    );

    let info = builder.build().await.unwrap();
    assert_eq!(info.status, BuildStatus::Fail);
    assert_eq!(info.total_steps, 2);
    assert_eq!(info.steps.len(), 1);
    assert_eq!(info.steps[0].status, BuildStatus::Fail);

    // Only step a ever produced step_info messages.
    let step_names: Vec<String> = manager
        .events()
        .iter()
        .filter_map(|e| match e {
            BuildEvent::Step(s) => Some(s.name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(step_names, vec!["a", "a"]);
}

#[tokio::test]
async fn test_failure_without_stop_on_fail_continues() {
    let workdir = make_workdir();
    let manager = Arc::new(RecordingManager::new());
    let builder = make_builder(
        manager.clone(),
        &workdir,
        r#"
name: b1
steps:
  - name: a
    command: "false"
  - name: b
    command: echo onward
"#,
        true,
    );

    let info = builder.build().await.unwrap();
    assert_eq!(info.steps.len(), 2);
    assert_eq!(info.steps[0].status, BuildStatus::Fail);
    assert_eq!(info.steps[1].status, BuildStatus::Success);
    // A later success never improves the build status.
    assert_eq!(info.status, BuildStatus::Fail);
}

#[tokio::test]
async fn test_warning_promotion_and_aggregation() {
    let workdir = make_workdir();
    let manager = Arc::new(RecordingManager::new());
    let builder = make_builder(
        manager.clone(),
        &workdir,
        r#"
name: b1
steps:
  - name: flaky
    command: "false"
    warning_on_fail: true
  - name: solid
    command: echo ok
"#,
        true,
    );

    let info = builder.build().await.unwrap();
    assert_eq!(info.steps.len(), 2);
    assert_eq!(info.steps[0].status, BuildStatus::Warning);
    assert_eq!(info.steps[1].status, BuildStatus::Success);
    assert_eq!(info.status, BuildStatus::Warning);
}

#[tokio::test]
async fn test_timeout_yields_exception() {
    let workdir = make_workdir();
    let manager = Arc::new(RecordingManager::new());
    let builder = make_builder(
        manager.clone(),
        &workdir,
        r#"
name: b1
steps:
  - name: slow
    command: sleep 5
    timeout: 1
"#,
        true,
    );

    let info = builder.build().await.unwrap();
    assert_eq!(info.status, BuildStatus::Exception);
    assert_eq!(info.steps[0].status, BuildStatus::Exception);
    assert_eq!(info.steps[0].output, "sleep 5 has timed out in 1 seconds");
}

#[tokio::test]
async fn test_empty_steps_build_succeeds() {
    let workdir = make_workdir();
    let manager = Arc::new(RecordingManager::new());
    let builder = make_builder(manager.clone(), &workdir, "name: b1\nsteps: []\n", true);

    let info = builder.build().await.unwrap();
    assert_eq!(info.status, BuildStatus::Success);
    assert_eq!(info.total_steps, 0);
    assert!(info.steps.is_empty());

    // One running envelope, no step messages.
    let events = manager.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], BuildEvent::Build(b) if b.status == BuildStatus::Running));
}

#[tokio::test]
async fn test_workspace_failure_is_build_exception() {
    let manager = Arc::new(RecordingManager::new());
    let conf = BuilderConfig::from_yaml("name: b1\nsteps:\n  - \"echo hi\"\n").unwrap();
    let missing = tempfile::tempdir().unwrap().path().join("gone");
    let builder = Builder::new(
        manager.clone(),
        conf,
        missing,
        &Settings::default(),
        true,
        IndexMap::new(),
    )
    .unwrap();

    let info = builder.build().await.unwrap();
    assert_eq!(info.status, BuildStatus::Exception);
    assert!(info.steps.is_empty());
    assert_eq!(info.total_steps, 1);
    // No step ever started.
    assert!(manager.events().is_empty());
}

#[tokio::test]
async fn test_envvars_reach_steps() {
    let workdir = make_workdir();
    let manager = Arc::new(RecordingManager::new());
    let conf = BuilderConfig::from_yaml("name: b1\nsteps:\n  - \"echo $GREETING\"\n").unwrap();
    let mut envvars = IndexMap::new();
    envvars.insert("GREETING".to_string(), "yo".to_string());
    let builder = Builder::new(
        manager.clone(),
        conf,
        workdir.path(),
        &Settings::default(),
        true,
        envvars,
    )
    .unwrap();

    let info = builder.build().await.unwrap();
    assert_eq!(info.steps[0].output, "yo");
}

#[tokio::test]
async fn test_output_batching_with_large_threshold() {
    let workdir = make_workdir();
    let manager = Arc::new(RecordingManager::new());
    let conf = BuilderConfig::from_yaml("name: b1\nsteps:\n  - \"echo one; echo two\"\n").unwrap();
    let settings = Settings {
        output_buffer_len: 10_000,
        ..Settings::default()
    };
    let builder = Builder::new(
        manager.clone(),
        conf,
        workdir.path(),
        &settings,
        true,
        IndexMap::new(),
    )
    .unwrap();

    builder.build().await.unwrap();

    let chunks: Vec<(u64, String)> = manager
        .events()
        .iter()
        .filter_map(|e| match e {
            BuildEvent::StepOutput(o) => Some((o.output_index, o.output.clone())),
            _ => None,
        })
        .collect();
    // Nothing crossed the threshold, so a single final flush drained it all.
    assert_eq!(chunks, vec![(0, "one\ntwo".to_string())]);
}

#[tokio::test]
async fn test_cancellation_short_circuits_build() {
    let workdir = make_workdir();
    let manager = Arc::new(RecordingManager::new());
    let builder = Arc::new(make_builder(
        manager.clone(),
        &workdir,
        r#"
name: b1
steps:
  - name: slow
    command: sleep 10
  - name: next
    command: echo never
"#,
        true,
    ));

    let handle = tokio::spawn({
        let builder = builder.clone();
        async move { builder.build().await }
    });

    // Wait until the step's canceller shows up in the registry, then fire it.
    let mut cancelled = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if manager.registry.cancel(builder.build_uuid()) {
            cancelled = true;
            break;
        }
    }
    assert!(cancelled, "step task was never registered");

    let info = handle.await.unwrap().unwrap();
    assert_eq!(info.status, BuildStatus::Cancelled);
    assert_eq!(info.steps.len(), 1);
    assert_eq!(info.steps[0].status, BuildStatus::Cancelled);
    assert_eq!(info.steps[0].output, "Build cancelled");
    assert_eq!(info.total_steps, 2);

    // The canceller was deregistered on the way out.
    assert!(manager.registry.is_empty());
}

#[tokio::test]
async fn test_last_step_context_is_threaded() {
    let workdir = make_workdir();
    let manager = Arc::new(RecordingManager::new());
    let builder = make_builder(
        manager.clone(),
        &workdir,
        "name: b1\nsteps:\n  - \"echo first\"\n  - \"echo second\"\n",
        true,
    );

    builder.build().await.unwrap();

    let running_infos: Vec<_> = manager
        .events()
        .iter()
        .filter_map(|e| match e {
            BuildEvent::Step(s) if s.status == BuildStatus::Running => Some(s.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(running_infos.len(), 2);
    assert!(running_infos[0].last_step_status.is_none());
    assert!(running_infos[0].last_step_finished.is_none());
    assert_eq!(running_infos[1].last_step_status, Some(BuildStatus::Success));
    assert!(running_infos[1].last_step_finished.is_some());
}
