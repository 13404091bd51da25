//! Unit tests for the lifecycle stages.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use serde_json::{Value, json};
use tempfile::TempDir;

use super::*;
use crate::bootstrap::bootstrap_command;
use crate::experiment::ExperimentSpec;
use crate::registry::PluginRegistry;
use crate::remote::RetryPolicy;
use crate::test_support::{
    CallLog, FakeProvisioner, RecordingRemote, fake_experiment, fake_installer,
};

struct Harness {
    _sandbox: TempDir,
    output: Utf8PathBuf,
    log: CallLog,
    provisioner: FakeProvisioner,
    remote: RecordingRemote,
    registry: PluginRegistry,
}

impl Harness {
    fn orchestrator(&self) -> Orchestrator {
        let provisioners = ProvisionerRegistry::new().with(self.provisioner.clone());
        let options = LifecycleOptions {
            remote_root: String::from("/tmp/kiso"),
            retry: RetryPolicy::once(),
            ..LifecycleOptions::default()
        };
        Orchestrator::new(provisioners, Arc::new(self.remote.clone()), options)
    }

    fn store(&self) -> StateStore {
        StateStore::open(&self.output)
    }

    fn checked(&self, document: Value) -> CheckedExperiment {
        let spec = ExperimentSpec::from_value(document, Utf8PathBuf::from("/experiments/demo"))
            .unwrap_or_else(|err| panic!("document: {err}"));
        check(spec, &self.registry, self.orchestrator().provisioners())
            .unwrap_or_else(|err| panic!("check: {err}"))
    }

    fn state(&self) -> State {
        self.store()
            .load()
            .unwrap_or_else(|err| panic!("load: {err}"))
    }
}

#[fixture]
fn harness() -> Harness {
    let sandbox = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let output = Utf8Path::from_path(sandbox.path())
        .unwrap_or_else(|| panic!("non-UTF-8 tempdir"))
        .join("output");
    let log = CallLog::new();
    let registry = PluginRegistry::builder()
        .software(fake_installer("alpha", &log))
        .software(fake_installer("beta", &log))
        .software(fake_installer("gamma", &log))
        .deployment(fake_installer("cluster", &log))
        .experiment(fake_experiment("probe", &log))
        .build()
        .unwrap_or_else(|err| panic!("registry: {err}"));
    Harness {
        _sandbox: sandbox,
        output,
        provisioner: FakeProvisioner::new("fake", &log),
        log,
        remote: RecordingRemote::new(),
        registry,
    }
}

fn two_sites() -> Value {
    json!([
        {"kind": "fake", "name": "a", "resources": {"machines": [
            {"roles": ["server"], "number": 1},
            {"roles": ["nodes"], "number": 1}
        ]}},
        {"kind": "fake", "name": "b", "resources": {"machines": [
            {"roles": ["nodes"], "number": 1}
        ]}}
    ])
}

fn document(software: Value, experiments: Value) -> Value {
    json!({
        "name": "demo",
        "sites": two_sites(),
        "software": software,
        "deployment": {"cluster": {"roles": ["server", "nodes"]}},
        "experiments": experiments
    })
}

fn probe(name: &str, count: u32) -> Value {
    json!({"kind": "probe", "name": name, "count": count, "roles": ["nodes"]})
}

async fn bring_up(harness: &Harness, checked: &CheckedExperiment) {
    harness
        .orchestrator()
        .up(checked, &harness.store(), false)
        .await
        .unwrap_or_else(|err| panic!("up: {err}"));
}

#[rstest]
#[tokio::test]
async fn up_provisions_distributes_and_installs_in_order(harness: Harness) {
    let checked = harness.checked(document(
        json!({"alpha": {"roles": ["nodes"]}, "beta": {}}),
        json!([probe("p", 1)]),
    ));

    let outcome = harness
        .orchestrator()
        .up(&checked, &harness.store(), false)
        .await
        .unwrap_or_else(|err| panic!("up: {err}"));

    assert_eq!(outcome, UpOutcome::Completed);
    assert_eq!(
        harness.log.entries(),
        vec![
            "provision:a",
            "provision:b",
            "install:alpha:2",
            "install:beta:0",
            "install:cluster:3",
        ]
    );
    let state = harness.state();
    assert_eq!(state.stage, LifecycleState::Deployed);
    assert_eq!(state.sites.len(), 2);
    assert_eq!(state.environment.get("alpha"), Some(&json!("installed")));
    assert_eq!(state.remote_working_dir.as_deref(), Some("/tmp/kiso/demo"));

    let hosts = files::read_to_string(&harness.output.join(HOSTS_FILE_NAME))
        .unwrap_or_else(|err| panic!("hosts: {err}"));
    for id in ["fake-a-1-1", "fake-a-2-1", "fake-b-1-1"] {
        assert!(hosts.contains(id), "{id} missing from {hosts}");
    }
    let commands = harness.remote.exec_commands();
    let prepare = bootstrap_command();
    let (hosts_first, then_bootstrap) = commands.split_at(3);
    assert!(hosts_first.iter().all(|(_, command)| command.contains("/etc/hosts")));
    assert!(then_bootstrap.iter().all(|(_, command)| *command == prepare));
    assert_eq!(then_bootstrap.len(), 3);
    assert!(state.installed.commons);
}

#[rstest]
#[tokio::test]
async fn bootstrap_failure_blocks_every_installer(harness: Harness) {
    harness.remote.fail_when("useradd");
    let checked = harness.checked(document(json!({"alpha": {}}), json!([probe("p", 1)])));

    let err = harness
        .orchestrator()
        .up(&checked, &harness.store(), false)
        .await
        .err()
        .unwrap_or_else(|| panic!("up should fail"));

    assert!(matches!(err, LifecycleError::Bootstrap(_)), "unexpected error: {err}");
    assert!(harness.log.matching("install:").is_empty());
    let state = harness.state();
    assert!(!state.installed.commons);
    assert_eq!(state.stage, LifecycleState::Provisioned);
    assert_eq!(
        state.failure.map(|failure| failure.stage),
        Some(LifecycleState::SoftwareInstalled.to_string())
    );
}

#[rstest]
#[tokio::test]
async fn second_up_is_a_no_op(harness: Harness) {
    let checked = harness.checked(document(json!({"alpha": {}}), json!([probe("p", 1)])));
    bring_up(&harness, &checked).await;
    let before = harness.state();

    let outcome = harness
        .orchestrator()
        .up(&checked, &harness.store(), false)
        .await
        .unwrap_or_else(|err| panic!("second up: {err}"));

    assert_eq!(outcome, UpOutcome::AlreadyUp);
    assert_eq!(harness.log.matching("provision:").len(), 2);
    assert_eq!(harness.log.matching("install:alpha").len(), 1);
    assert_eq!(harness.state(), before);
}

#[rstest]
#[tokio::test]
async fn provisioning_failure_stops_before_installation(harness: Harness) {
    harness.provisioner.fail_provision("b");
    let checked = harness.checked(document(json!({"alpha": {}}), json!([probe("p", 1)])));

    let err = harness
        .orchestrator()
        .up(&checked, &harness.store(), false)
        .await
        .err()
        .unwrap_or_else(|| panic!("up should fail"));

    assert!(matches!(&err, LifecycleError::Provisioning { site, .. } if site == "b"));
    assert!(harness.log.matching("install:").is_empty());
    let state = harness.state();
    assert_eq!(state.sites.len(), 1);
    assert!(state.site(0).is_some());
    assert_eq!(
        state.failure.map(|failure| failure.stage),
        Some(LifecycleState::Provisioned.to_string())
    );
}

#[rstest]
#[tokio::test]
async fn failed_install_resumes_at_the_failing_kind(harness: Harness) {
    let failing = harness.checked(document(
        json!({"alpha": {}, "beta": {"fail": true}, "gamma": {}}),
        json!([probe("p", 1)]),
    ));
    let err = harness
        .orchestrator()
        .up(&failing, &harness.store(), false)
        .await
        .err()
        .unwrap_or_else(|| panic!("up should fail"));
    assert!(matches!(
        &err,
        LifecycleError::Install { category: PluginCategory::Software, kind, .. } if kind == "beta"
    ));
    assert!(harness.log.matching("install:gamma").is_empty());
    assert!(harness.state().installed.software.contains("alpha"));

    let fixed = harness.checked(document(
        json!({"alpha": {}, "beta": {}, "gamma": {}}),
        json!([probe("p", 1)]),
    ));
    bring_up(&harness, &fixed).await;

    assert_eq!(harness.log.matching("provision:").len(), 2);
    assert_eq!(harness.log.matching("install:alpha").len(), 1);
    assert_eq!(harness.log.matching("install:beta").len(), 2);
    assert_eq!(harness.log.matching("install:gamma").len(), 1);
    let prepare = bootstrap_command();
    let bootstraps = harness
        .remote
        .exec_commands()
        .into_iter()
        .filter(|(_, command)| *command == prepare)
        .count();
    assert_eq!(bootstraps, 3);
    let state = harness.state();
    assert_eq!(state.stage, LifecycleState::Deployed);
    assert!(state.failure.is_none());
}

#[rstest]
#[tokio::test]
async fn run_before_up_is_rejected(harness: Harness) {
    let checked = harness.checked(document(json!({}), json!([probe("p", 1)])));

    let err = harness
        .orchestrator()
        .run(&checked, &harness.store(), RunOptions::default())
        .await
        .err()
        .unwrap_or_else(|| panic!("run should fail"));

    assert_eq!(
        err,
        LifecycleError::NotProvisioned {
            output_dir: harness.output.clone(),
        }
    );
    assert!(harness.log.entries().is_empty());
}

#[rstest]
#[tokio::test]
async fn run_repeats_count_times_and_skips_completed_iterations(harness: Harness) {
    let checked = harness.checked(document(json!({}), json!([probe("p", 3)])));
    bring_up(&harness, &checked).await;
    let orchestrator = harness.orchestrator();

    let first = orchestrator
        .run(&checked, &harness.store(), RunOptions::default())
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));
    assert!(first.is_success());
    assert_eq!(harness.log.matching("run:"), vec!["run:p:1", "run:p:2", "run:p:3"]);
    for iteration in 1..=3 {
        let marker = harness
            .output
            .join(RESULTS_DIR_NAME)
            .join("p")
            .join(iteration.to_string())
            .join("iteration.txt");
        assert!(marker.is_file(), "{marker} missing");
    }
    let state = harness.state();
    assert_eq!(state.stage, LifecycleState::Collected);
    assert_eq!(state.environment.get("p-last"), Some(&json!(3)));

    let again = orchestrator
        .run(&checked, &harness.store(), RunOptions::default())
        .await
        .unwrap_or_else(|err| panic!("second run: {err}"));
    assert!(again.completed.is_empty());
    assert_eq!(again.skipped.len(), 3);

    let forced = orchestrator
        .run(
            &checked,
            &harness.store(),
            RunOptions {
                force: true,
                keep_going: false,
            },
        )
        .await
        .unwrap_or_else(|err| panic!("forced run: {err}"));
    assert_eq!(forced.completed.len(), 3);
    assert_eq!(harness.log.matching("run:").len(), 6);
}

#[rstest]
#[tokio::test]
async fn run_copies_the_working_directory_once(harness: Harness) {
    let checked = harness.checked(document(json!({}), json!([probe("p", 1)])));
    bring_up(&harness, &checked).await;
    let orchestrator = harness.orchestrator();

    for _ in 0..2 {
        orchestrator
            .run(&checked, &harness.store(), RunOptions::default())
            .await
            .unwrap_or_else(|err| panic!("run: {err}"));
    }

    let pushes = harness.remote.pushes();
    assert_eq!(pushes.len(), 3);
    assert!(pushes.iter().all(|(_, source, destination)| {
        source == "/experiments/demo/" && destination == "/tmp/kiso/demo"
    }));
    assert!(harness.state().working_dir_copied);
}

#[rstest]
#[tokio::test]
async fn failing_experiment_stops_the_run(harness: Harness) {
    let checked = harness.checked(document(
        json!({}),
        json!([
            {"kind": "probe", "name": "broken", "fail": true},
            probe("after", 1)
        ]),
    ));
    bring_up(&harness, &checked).await;

    let err = harness
        .orchestrator()
        .run(&checked, &harness.store(), RunOptions::default())
        .await
        .err()
        .unwrap_or_else(|| panic!("run should fail"));

    assert!(matches!(
        &err,
        LifecycleError::Execution { experiment, iteration: 1, step: ExecutionStep::Run, .. }
            if experiment == "broken"
    ));
    assert!(harness.log.matching("run:after").is_empty());
    let state = harness.state();
    assert!(state.failure.is_some());
    assert!(state.experiments.get(&0).is_some_and(|record| record.failed.is_some()));
}

#[rstest]
#[tokio::test]
async fn keep_going_continues_with_the_next_experiment(harness: Harness) {
    let checked = harness.checked(document(
        json!({}),
        json!([
            {"kind": "probe", "name": "broken", "fail": true},
            probe("after", 2)
        ]),
    ));
    bring_up(&harness, &checked).await;

    let summary = harness
        .orchestrator()
        .run(
            &checked,
            &harness.store(),
            RunOptions {
                force: false,
                keep_going: true,
            },
        )
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert!(!summary.is_success());
    assert_eq!(
        summary
            .failures
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>(),
        vec!["broken"]
    );
    assert_eq!(
        summary.completed,
        vec![(String::from("after"), 1), (String::from("after"), 2)]
    );
    assert_eq!(harness.state().stage, LifecycleState::Running);
}

#[rstest]
#[tokio::test]
async fn setup_failure_is_attributed_to_its_step(harness: Harness) {
    let checked = harness.checked(document(
        json!({}),
        json!([{
            "kind": "probe",
            "name": "p",
            "setup": [{"roles": ["server"], "script": "prepare-db"}]
        }]),
    ));
    bring_up(&harness, &checked).await;
    harness.remote.fail_when("prepare-db");

    let err = harness
        .orchestrator()
        .run(&checked, &harness.store(), RunOptions::default())
        .await
        .err()
        .unwrap_or_else(|| panic!("run should fail"));

    assert!(matches!(
        err,
        LifecycleError::Execution { step: ExecutionStep::Setup, .. }
    ));
    assert!(harness.log.matching("run:").is_empty());
}

#[rstest]
#[tokio::test]
async fn missing_outputs_become_warnings(harness: Harness) {
    let checked = harness.checked(document(
        json!({}),
        json!([{
            "kind": "probe",
            "name": "p",
            "outputs": [{"roles": ["nodes"], "src": "out.csv", "dst": "csv"}]
        }]),
    ));
    bring_up(&harness, &checked).await;
    harness.remote.fail_transfers_of("out.csv");

    let summary = harness
        .orchestrator()
        .run(&checked, &harness.store(), RunOptions::default())
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert!(summary.is_success());
    assert_eq!(summary.warnings.len(), 2);
    let state = harness.state();
    let record = state
        .experiments
        .get(&0)
        .unwrap_or_else(|| panic!("experiment record missing"));
    assert!(record.completed.contains(&1));
    assert_eq!(record.warnings.get(&1).map(Vec::len), Some(2));
}

#[rstest]
#[tokio::test]
async fn down_without_state_touches_nothing(harness: Harness) {
    let outcome = harness
        .orchestrator()
        .down(&harness.store())
        .await
        .unwrap_or_else(|err| panic!("down: {err}"));

    assert_eq!(outcome, DownOutcome::NothingProvisioned);
    assert!(harness.log.entries().is_empty());
    assert!(!harness.output.exists());
}

#[rstest]
#[tokio::test]
async fn down_tears_sites_down_in_reverse_order(harness: Harness) {
    let checked = harness.checked(document(json!({}), json!([probe("p", 1)])));
    bring_up(&harness, &checked).await;

    let outcome = harness
        .orchestrator()
        .down(&harness.store())
        .await
        .unwrap_or_else(|err| panic!("down: {err}"));

    assert_eq!(outcome, DownOutcome::TornDown { sites: 2 });
    assert_eq!(
        harness.log.matching("teardown:"),
        vec!["teardown:b", "teardown:a"]
    );
    assert_eq!(harness.log.matching("release:").len(), 2);
    assert!(!harness.store().path().exists());
}

#[rstest]
#[tokio::test]
async fn failed_site_teardown_keeps_its_record(harness: Harness) {
    let checked = harness.checked(document(json!({}), json!([probe("p", 1)])));
    bring_up(&harness, &checked).await;
    harness.provisioner.fail_teardown("b");

    let err = harness
        .orchestrator()
        .down(&harness.store())
        .await
        .err()
        .unwrap_or_else(|| panic!("down should fail"));

    let LifecycleError::Teardown(teardown) = err else {
        panic!("expected a teardown error");
    };
    assert_eq!(teardown.failures.len(), 1);
    assert!(teardown.failures.iter().all(|failure| {
        failure.site == "b" && failure.step == TeardownStep::Destroy
    }));
    assert_eq!(harness.log.matching("teardown:").len(), 2);
    assert!(harness.log.matching("remove:b").is_empty());
    let state = harness.state();
    assert_eq!(state.sites.len(), 1);
    assert!(state.site(1).is_some());
}
